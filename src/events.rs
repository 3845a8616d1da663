//! Protocol events reported to the external observer.
//!
//! Events are rendered as free text and shipped through an [`EventSink`];
//! the sink decides how (and whether) they reach the observer. The
//! production sink is the reliable log channel in [`crate::transport`].

use std::fmt;

use async_trait::async_trait;

use crate::protocol::{Identity, Vote};

/// Something worth telling the observer about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    StartedListening { port: u16 },
    ConnectionAccepted { remote_port: u16 },
    ConnectionEstablished { peer: Identity },
    JoinSent { coordinator: u16 },
    JoinReceived { participant: Identity },
    DetailsSent { participant: Identity, peers: Vec<Identity> },
    DetailsReceived { peers: Vec<Identity> },
    VoteOptionsSent { participant: Identity, options: Vec<String> },
    VoteOptionsReceived { options: Vec<String> },
    BeginRound { round: u32 },
    EndRound { round: u32 },
    VotesSent { peer: Identity, votes: Vec<Vote> },
    VotesReceived { peer: Identity, votes: Vec<Vote> },
    OutcomeDecided { choice: String, contributors: Vec<Identity> },
    OutcomeNotified { choice: String, contributors: Vec<Identity> },
    OutcomeReceived { participant: Identity, choice: String },
    ParticipantCrashed { participant: Identity },
    UnidentifiedCrash { remote_port: u16 },
    MessageSent { remote_port: u16, line: String },
    /// Outbound peer links are known by identity only.
    PeerMessageSent { peer: Identity, line: String },
    MessageReceived { remote_port: u16, line: String },
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolEvent::StartedListening { port } => write!(f, "Started listening on {}", port),
            ProtocolEvent::ConnectionAccepted { remote_port } => {
                write!(f, "Connection accepted from port {}", remote_port)
            }
            ProtocolEvent::ConnectionEstablished { peer } => {
                write!(f, "Connection established with {}", peer)
            }
            ProtocolEvent::JoinSent { coordinator } => write!(f, "JOIN sent to {}", coordinator),
            ProtocolEvent::JoinReceived { participant } => {
                write!(f, "JOIN received from {}", participant)
            }
            ProtocolEvent::DetailsSent { participant, peers } => {
                write!(f, "DETAILS {} sent to {}", join(peers), participant)
            }
            ProtocolEvent::DetailsReceived { peers } => {
                write!(f, "DETAILS received: {}", join(peers))
            }
            ProtocolEvent::VoteOptionsSent {
                participant,
                options,
            } => write!(f, "VOTE_OPTIONS {} sent to {}", join(options), participant),
            ProtocolEvent::VoteOptionsReceived { options } => {
                write!(f, "VOTE_OPTIONS received: {}", join(options))
            }
            ProtocolEvent::BeginRound { round } => write!(f, "Round {} started", round),
            ProtocolEvent::EndRound { round } => write!(f, "Round {} completed", round),
            ProtocolEvent::VotesSent { peer, votes } => {
                write!(f, "Votes [{}] sent to {}", join(votes), peer)
            }
            ProtocolEvent::VotesReceived { peer, votes } => {
                write!(f, "Votes [{}] received from {}", join(votes), peer)
            }
            ProtocolEvent::OutcomeDecided {
                choice,
                contributors,
            } => write!(f, "Outcome {} decided from {}", choice, join(contributors)),
            ProtocolEvent::OutcomeNotified {
                choice,
                contributors,
            } => write!(f, "Outcome {} notified for {}", choice, join(contributors)),
            ProtocolEvent::OutcomeReceived {
                participant,
                choice,
            } => write!(f, "Outcome {} received from {}", choice, participant),
            ProtocolEvent::ParticipantCrashed { participant } => {
                write!(f, "Participant {} crashed", participant)
            }
            ProtocolEvent::UnidentifiedCrash { remote_port } => {
                write!(f, "Unidentified participant on port {} crashed", remote_port)
            }
            ProtocolEvent::MessageSent { remote_port, line } => {
                write!(f, "Message sent to port {}: {}", remote_port, line)
            }
            ProtocolEvent::PeerMessageSent { peer, line } => {
                write!(f, "Message sent to {}: {}", peer, line)
            }
            ProtocolEvent::MessageReceived { remote_port, line } => {
                write!(f, "Message received from port {}: {}", remote_port, line)
            }
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Destination for protocol events.
///
/// Emitting never fails from the caller's point of view: a sink that loses
/// an event logs the loss itself and lets the protocol continue.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ProtocolEvent);
}

/// Keeps every event in memory for assertions.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<ProtocolEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProtocolEvent> {
        self.events.lock().clone()
    }

    pub fn crashed(&self) -> Vec<Identity> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ProtocolEvent::ParticipantCrashed { participant } => Some(*participant),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: ProtocolEvent) {
        self.events.lock().push(event);
    }
}
