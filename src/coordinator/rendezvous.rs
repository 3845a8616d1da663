//! The coordinator's join, publish and collect phases.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

use super::membership::{Member, PeerSet};
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::events::{EventSink, ProtocolEvent};
use crate::protocol::{write_message, Identity, Message, MessageReader};

/// The coordinator's half of a participant connection.
pub struct Connection {
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Coordinator lifecycle. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Listening,
    Publishing,
    AwaitingOutcomes,
    Done,
}

/// Why a participant was declared crashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashReason {
    /// Nothing arrived within the read timeout.
    Timeout,
    /// The participant closed its connection.
    Disconnected,
    Io(String),
    /// The participant sent something other than a well-formed OUTCOME.
    Protocol(String),
}

/// The final word on one joined participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Decided {
        participant: Identity,
        choice: String,
        contributors: Vec<Identity>,
    },
    Crashed {
        participant: Identity,
        reason: CrashReason,
    },
}

impl Verdict {
    pub fn participant(&self) -> Identity {
        match self {
            Verdict::Decided { participant, .. } | Verdict::Crashed { participant, .. } => {
                *participant
            }
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, Verdict::Crashed { .. })
    }
}

/// Rendezvous point for one voting run.
pub struct Coordinator<S: EventSink + 'static> {
    config: CoordinatorConfig,
    listener: TcpListener,
    sink: Arc<S>,
    peers: PeerSet<Connection>,
    phase: Phase,
    run_id: Uuid,
}

impl<S: EventSink + 'static> Coordinator<S> {
    /// Bind the join port described by `config`.
    pub async fn bind(config: CoordinatorConfig, sink: Arc<S>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Self::from_listener(listener, config, sink)
    }

    /// Use an already bound listener; `config.port` is ignored.
    pub fn from_listener(
        listener: TcpListener,
        mut config: CoordinatorConfig,
        sink: Arc<S>,
    ) -> Result<Self> {
        config.validate()?;
        config.port = listener.local_addr()?.port();
        Ok(Self {
            config,
            listener,
            sink,
            peers: PeerSet::new(),
            phase: Phase::Listening,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Identities joined so far, in join order.
    pub fn members(&self) -> Vec<Identity> {
        self.peers.identities()
    }

    /// Drive a whole run: joins, publish, outcome collection.
    pub async fn run(mut self) -> Result<Vec<Verdict>> {
        let span = tracing::info_span!("coordinator", run_id = %self.run_id, port = self.config.port);
        async move {
            self.accept_joins().await?;
            self.publish().await;
            let verdicts = self.collect_outcomes().await;
            let crashed = verdicts.iter().filter(|v| v.is_crash()).count();
            info!(
                participants = verdicts.len(),
                crashed, "Voting run complete"
            );
            Ok(verdicts)
        }
        .instrument(span)
        .await
    }

    /// Accept connections until the expected number of distinct joins is in.
    ///
    /// A connection whose first line is not a valid JOIN is dropped and does
    /// not count towards the total.
    pub async fn accept_joins(&mut self) -> Result<Vec<Identity>> {
        let port = self.config.port;
        info!(port, expected = self.config.participants, "Waiting for joins");
        self.sink.emit(ProtocolEvent::StartedListening { port }).await;

        while self.peers.len() < self.config.participants {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let source_port = remote.port();
            self.sink
                .emit(ProtocolEvent::ConnectionAccepted {
                    remote_port: source_port,
                })
                .await;

            let (read, writer) = stream.into_split();
            let mut reader = MessageReader::new(read);
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    warn!(source_port, "Connection closed before JOIN");
                    continue;
                }
                Err(e) => {
                    warn!(source_port, error = %e, "Failed to read JOIN");
                    continue;
                }
            };

            let identity = match Message::decode(&line) {
                Ok(Message::Join { identity }) => identity,
                Ok(other) => {
                    warn!(source_port, tag = other.tag(), "Expected JOIN, dropping connection");
                    continue;
                }
                Err(e) => {
                    warn!(source_port, error = %e, "Malformed JOIN, dropping connection");
                    continue;
                }
            };

            self.sink
                .emit(ProtocolEvent::MessageReceived {
                    remote_port: source_port,
                    line,
                })
                .await;
            self.sink
                .emit(ProtocolEvent::JoinReceived {
                    participant: identity,
                })
                .await;

            let member = Member {
                identity,
                source_port,
                conn: Connection { reader, writer },
            };
            match self.peers.add_or_replace(member) {
                Some(old) => info!(
                    identity,
                    replaced = old.identity,
                    source_port,
                    "Rejoin replaced existing member"
                ),
                None => info!(
                    identity,
                    source_port,
                    joined = self.peers.len(),
                    "Participant joined"
                ),
            }
        }

        self.phase = Phase::Publishing;
        Ok(self.peers.identities())
    }

    /// Send DETAILS then VOTE_OPTIONS to every member.
    ///
    /// A failed write only affects that member; the rest still get theirs.
    pub async fn publish(&mut self) {
        let details: Vec<Vec<Identity>> = (0..self.peers.len())
            .map(|i| self.peers.others(i))
            .collect();
        let options = Message::VoteOptions {
            options: self.config.options.clone(),
        };

        for (member, peers) in self.peers.iter_mut().zip(details) {
            let details_msg = Message::Details {
                peers: peers.clone(),
            };
            if let Err(e) = write_message(&mut member.conn.writer, &details_msg).await {
                warn!(identity = member.identity, error = %e, "Failed to send DETAILS");
                continue;
            }
            self.sink
                .emit(ProtocolEvent::DetailsSent {
                    participant: member.identity,
                    peers,
                })
                .await;
            self.sink
                .emit(ProtocolEvent::MessageSent {
                    remote_port: member.source_port,
                    line: details_msg.encode(),
                })
                .await;

            if let Err(e) = write_message(&mut member.conn.writer, &options).await {
                warn!(identity = member.identity, error = %e, "Failed to send VOTE_OPTIONS");
                continue;
            }
            self.sink
                .emit(ProtocolEvent::VoteOptionsSent {
                    participant: member.identity,
                    options: self.config.options.clone(),
                })
                .await;
            self.sink
                .emit(ProtocolEvent::MessageSent {
                    remote_port: member.source_port,
                    line: options.encode(),
                })
                .await;
            debug!(identity = member.identity, "Published details and options");
        }

        self.phase = Phase::AwaitingOutcomes;
    }

    /// Wait for one OUTCOME per member, concurrently.
    ///
    /// Returns exactly one verdict per joined participant, in join order.
    pub async fn collect_outcomes(&mut self) -> Vec<Verdict> {
        let members = std::mem::take(&mut self.peers).into_members();
        info!(
            participants = members.len(),
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Awaiting outcomes"
        );

        let (identities, handles): (Vec<_>, Vec<_>) = members
            .into_iter()
            .map(|member| {
                let identity = member.identity;
                let sink = self.sink.clone();
                let timeout = self.config.timeout;
                let handle =
                    tokio::spawn(await_outcome(member, timeout, sink).in_current_span());
                (identity, handle)
            })
            .unzip();

        let verdicts = join_all(handles)
            .await
            .into_iter()
            .zip(identities)
            .map(|(joined, participant)| {
                joined.unwrap_or_else(|e| Verdict::Crashed {
                    participant,
                    reason: CrashReason::Io(e.to_string()),
                })
            })
            .collect();

        self.phase = Phase::Done;
        verdicts
    }
}

#[instrument(skip(member, sink), fields(identity = member.identity))]
async fn await_outcome<S: EventSink>(
    mut member: Member<Connection>,
    timeout: Duration,
    sink: Arc<S>,
) -> Verdict {
    let participant = member.identity;
    let reason = match tokio::time::timeout(timeout, member.conn.reader.next_line()).await {
        Ok(Ok(Some(line))) => {
            sink.emit(ProtocolEvent::MessageReceived {
                remote_port: member.source_port,
                line: line.clone(),
            })
            .await;
            match Message::decode(&line) {
                Ok(Message::Outcome {
                    choice,
                    contributors,
                }) => {
                    info!(choice = %choice, contributors = ?contributors, "Outcome received");
                    sink.emit(ProtocolEvent::OutcomeReceived {
                        participant,
                        choice: choice.clone(),
                    })
                    .await;
                    return Verdict::Decided {
                        participant,
                        choice,
                        contributors,
                    };
                }
                Ok(other) => CrashReason::Protocol(format!("expected OUTCOME, got {}", other.tag())),
                Err(e) => CrashReason::Protocol(e.to_string()),
            }
        }
        Ok(Ok(None)) => CrashReason::Disconnected,
        Ok(Err(e)) => CrashReason::Io(e.to_string()),
        Err(_) => CrashReason::Timeout,
    };

    warn!(reason = ?reason, "Participant crashed");
    sink.emit(ProtocolEvent::ParticipantCrashed { participant }).await;
    Verdict::Crashed {
        participant,
        reason,
    }
}
