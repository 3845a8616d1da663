//! One participant's voting run.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::ledger::{Decision, VoteLedger};
use super::mesh::Mesh;
use crate::config::ParticipantConfig;
use crate::error::{GossipVoteError, Result};
use crate::events::{EventSink, ProtocolEvent};
use crate::protocol::{read_message, write_message, Identity, Message, MessageReader, ProtocolError, Vote};

/// What the coordinator told this participant, plus the open connection
/// the outcome goes back on.
pub struct Enrollment {
    pub peers: Vec<Identity>,
    pub options: Vec<String>,
    /// This participant's own randomly picked vote.
    pub initial: Vote,
    coordinator_port: u16,
    _reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A participant and all state scoped to its run.
pub struct Participant<S: EventSink + 'static> {
    config: ParticipantConfig,
    listener: TcpListener,
    sink: Arc<S>,
    run_id: Uuid,
}

impl<S: EventSink + 'static> Participant<S> {
    /// Bind the participant's listening port.
    pub async fn bind(config: ParticipantConfig, sink: Arc<S>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Self::from_listener(listener, config, sink)
    }

    /// Use an already bound listener; its port becomes the identity.
    pub fn from_listener(
        listener: TcpListener,
        mut config: ParticipantConfig,
        sink: Arc<S>,
    ) -> Result<Self> {
        config.port = listener.local_addr()?.port();
        Ok(Self {
            config,
            listener,
            sink,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn identity(&self) -> Identity {
        self.config.port
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Join, gossip, decide and report.
    pub async fn run(self) -> Result<Decision> {
        let span = tracing::info_span!("participant", run_id = %self.run_id, identity = self.identity());
        async move {
            let mut enrollment = self.join().await?;
            let mut mesh = self.form_mesh(&enrollment.peers).await;
            let decision = self.run_rounds(&mut mesh, enrollment.initial.clone()).await?;
            self.report(&mut enrollment, &decision).await?;
            Ok(decision)
        }
        .instrument(span)
        .await
    }

    /// Send JOIN, then read DETAILS and VOTE_OPTIONS in that order.
    pub async fn join(&self) -> Result<Enrollment> {
        let coordinator = self.config.coordinator_addr();
        let stream = TcpStream::connect(coordinator).await?;
        let (read, mut writer) = stream.into_split();
        let mut reader = MessageReader::new(read);

        let join = Message::Join {
            identity: self.identity(),
        };
        write_message(&mut writer, &join).await?;
        self.sink
            .emit(ProtocolEvent::JoinSent {
                coordinator: coordinator.port(),
            })
            .await;
        info!(coordinator = %coordinator, "Joined, waiting for details");

        let peers = match read_message(&mut reader).await? {
            Some(Message::Details { peers }) => peers,
            other => return Err(unexpected(Message::DETAILS, other)),
        };
        self.sink
            .emit(ProtocolEvent::DetailsReceived {
                peers: peers.clone(),
            })
            .await;

        let options = match read_message(&mut reader).await? {
            Some(Message::VoteOptions { options }) => options,
            other => return Err(unexpected(Message::VOTE_OPTIONS, other)),
        };
        self.sink
            .emit(ProtocolEvent::VoteOptionsReceived {
                options: options.clone(),
            })
            .await;

        let choice = options
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| GossipVoteError::Session("coordinator offered no vote options".to_string()))?;
        info!(peers = ?peers, choice = %choice, "Initial vote chosen");

        Ok(Enrollment {
            peers,
            options,
            initial: Vote::new(self.identity(), choice),
            coordinator_port: coordinator.port(),
            _reader: reader,
            writer,
        })
    }

    /// Build the connection mesh with the peers named in DETAILS.
    pub async fn form_mesh(&self, peers: &[Identity]) -> Mesh {
        Mesh::form(&self.listener, &self.config, peers, self.sink.as_ref()).await
    }

    /// Flood votes for as many rounds as inbound links were discovered.
    ///
    /// Each round merges last round's arrivals into the ledger, sends the
    /// ones not seen before to every outbound peer, then waits (up to the
    /// configured timeout) for one VOTE line from every live inbound peer.
    /// A peer that misses the deadline, hangs up or sends garbage is dropped
    /// for the rest of the run. Arrivals from the final round are merged
    /// before deciding.
    pub async fn run_rounds(&self, mesh: &mut Mesh, initial: Vote) -> Result<Decision> {
        let budget = mesh.round_budget();
        let mut ledger = VoteLedger::new();
        let mut pending = vec![initial];

        for round in 1..=budget {
            self.sink.emit(ProtocolEvent::BeginRound { round }).await;
            let fresh = ledger.absorb(pending.drain(..));
            debug!(round, fresh = fresh.len(), known = ledger.len(), "Round started");

            self.broadcast(mesh, fresh).await;

            for read in mesh.receive_round(self.config.timeout).await {
                let line = match read.result {
                    Ok(line) => line,
                    Err(failure) => {
                        self.crashed(mesh, read.peer, &failure.to_string()).await;
                        continue;
                    }
                };
                self.sink
                    .emit(ProtocolEvent::MessageReceived {
                        remote_port: read.remote_port,
                        line: line.clone(),
                    })
                    .await;
                match Message::decode(&line) {
                    Ok(Message::Vote { votes }) => {
                        self.sink
                            .emit(ProtocolEvent::VotesReceived {
                                peer: read.peer,
                                votes: votes.clone(),
                            })
                            .await;
                        pending.extend(votes);
                    }
                    Ok(other) => {
                        let reason = format!("expected VOTE, got {}", other.tag());
                        self.crashed(mesh, read.peer, &reason).await;
                    }
                    Err(e) => self.crashed(mesh, read.peer, &e.to_string()).await,
                }
            }

            self.sink.emit(ProtocolEvent::EndRound { round }).await;
            info!(round, known = ledger.len(), live = ?mesh.live_peers(), "Round complete");
        }

        ledger.absorb(pending);
        let decision = ledger
            .decide(budget)
            .ok_or_else(|| GossipVoteError::Session("no votes recorded".to_string()))?;
        self.sink
            .emit(ProtocolEvent::OutcomeDecided {
                choice: decision.choice.clone(),
                contributors: decision.contributors.clone(),
            })
            .await;
        info!(
            choice = %decision.choice,
            contributors = ?decision.contributors,
            rounds = decision.rounds,
            "Outcome decided"
        );
        Ok(decision)
    }

    /// Send OUTCOME back to the coordinator.
    pub async fn report(&self, enrollment: &mut Enrollment, decision: &Decision) -> Result<()> {
        let outcome = Message::Outcome {
            choice: decision.choice.clone(),
            contributors: decision.contributors.clone(),
        };
        write_message(&mut enrollment.writer, &outcome).await?;
        self.sink
            .emit(ProtocolEvent::OutcomeNotified {
                choice: decision.choice.clone(),
                contributors: decision.contributors.clone(),
            })
            .await;
        self.sink
            .emit(ProtocolEvent::MessageSent {
                remote_port: enrollment.coordinator_port,
                line: outcome.encode(),
            })
            .await;
        Ok(())
    }

    /// Same payload to every outbound peer.
    async fn broadcast(&self, mesh: &mut Mesh, votes: Vec<Vote>) {
        let message = Message::Vote {
            votes: votes.clone(),
        };
        let line = message.encode();

        let mut failed = Vec::new();
        for link in mesh.outbound_mut() {
            match link.send(&message).await {
                Ok(()) => {
                    self.sink
                        .emit(ProtocolEvent::PeerMessageSent {
                            peer: link.peer,
                            line: line.clone(),
                        })
                        .await;
                    self.sink
                        .emit(ProtocolEvent::VotesSent {
                            peer: link.peer,
                            votes: votes.clone(),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(peer = link.peer, error = %e, "Failed to send votes");
                    failed.push(link.peer);
                }
            }
        }
        for peer in failed {
            mesh.drop_outbound(peer);
        }
    }

    async fn crashed(&self, mesh: &mut Mesh, peer: Identity, reason: &str) {
        warn!(peer, reason, "Peer crashed");
        mesh.drop_peer(peer);
        self.sink
            .emit(ProtocolEvent::ParticipantCrashed { participant: peer })
            .await;
    }
}

fn unexpected(expected: &'static str, got: Option<Message>) -> GossipVoteError {
    match got {
        Some(message) => ProtocolError::UnexpectedMessage {
            expected,
            got: message.tag().to_string(),
        }
        .into(),
        None => GossipVoteError::Session(format!(
            "coordinator closed the connection before {}",
            expected
        )),
    }
}
