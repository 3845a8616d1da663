//! Peer connection mesh.
//!
//! Every logical edge is two TCP connections: the one this participant
//! opened (used only for sending) and the one the peer opened (used only for
//! receiving). Outbound connections announce themselves with `HELLO <id>`,
//! so inbound links are tagged with the peer's identity before any votes
//! flow.

use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::ParticipantConfig;
use crate::events::{EventSink, ProtocolEvent};
use crate::protocol::{write_message, Identity, Message, MessageReader};

/// Lines buffered per inbound link before its reader task waits.
const LINK_BUFFER: usize = 16;

/// Connection this participant opened to a peer.
pub struct OutboundLink {
    pub peer: Identity,
    writer: OwnedWriteHalf,
}

impl OutboundLink {
    pub async fn send(&mut self, message: &Message) -> std::io::Result<()> {
        write_message(&mut self.writer, message).await
    }
}

/// Connection a peer opened to this participant.
///
/// A dedicated task reads lines off the socket into a channel, so a round
/// can stop waiting without cancelling a read mid-line. Dropping the link
/// aborts that task.
pub struct InboundLink {
    pub peer: Identity,
    pub remote_port: u16,
    lines: mpsc::Receiver<std::io::Result<String>>,
    reader: JoinHandle<()>,
}

impl InboundLink {
    fn spawn(peer: Identity, remote_port: u16, mut reader: MessageReader<tokio::net::tcp::OwnedReadHalf>) -> Self {
        let (tx, lines) = mpsc::channel(LINK_BUFFER);
        let reader = tokio::spawn(async move {
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Self {
            peer,
            remote_port,
            lines,
            reader,
        }
    }
}

impl Drop for InboundLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Why a link produced nothing usable this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    Timeout,
    Closed,
    Io(String),
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFailure::Timeout => write!(f, "read timed out"),
            LinkFailure::Closed => write!(f, "connection closed"),
            LinkFailure::Io(e) => write!(f, "{}", e),
        }
    }
}

/// One inbound link's contribution to a round.
#[derive(Debug)]
pub struct RoundRead {
    pub peer: Identity,
    pub remote_port: u16,
    pub result: Result<String, LinkFailure>,
}

/// All links a participant holds during its rounds.
pub struct Mesh {
    outbound: Vec<OutboundLink>,
    inbound: Vec<InboundLink>,
    discovered: usize,
}

impl Mesh {
    /// Open links to `peers`, then accept inbound links until `config.timeout`
    /// passes without a new arrival.
    pub async fn form<S: EventSink + ?Sized>(
        listener: &TcpListener,
        config: &ParticipantConfig,
        peers: &[Identity],
        sink: &S,
    ) -> Self {
        let identity = config.port;
        let mut outbound = Vec::with_capacity(peers.len());

        for &peer in peers {
            match connect(config, peer).await {
                Ok(link) => {
                    debug!(peer, "Outbound link established");
                    sink.emit(ProtocolEvent::ConnectionEstablished { peer }).await;
                    outbound.push(link);
                }
                Err(reason) => {
                    warn!(peer, reason = %reason, "Could not reach peer");
                    sink.emit(ProtocolEvent::ParticipantCrashed { participant: peer })
                        .await;
                }
            }
        }

        sink.emit(ProtocolEvent::StartedListening { port: identity }).await;
        let mut inbound: Vec<InboundLink> = Vec::with_capacity(peers.len());
        loop {
            let (stream, remote) = match timeout(config.timeout, listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    warn!(error = %e, "Accept failed, closing discovery window");
                    break;
                }
                Err(_) => break,
            };
            let remote_port = remote.port();
            sink.emit(ProtocolEvent::ConnectionAccepted { remote_port }).await;

            let (read, _) = stream.into_split();
            let mut reader = MessageReader::new(read);
            let peer = match timeout(config.timeout, reader.next_line()).await {
                Ok(Ok(Some(line))) => match Message::decode(&line) {
                    Ok(Message::Hello { identity }) => {
                        sink.emit(ProtocolEvent::MessageReceived { remote_port, line })
                            .await;
                        Some(identity)
                    }
                    _ => None,
                },
                _ => None,
            };

            match peer {
                Some(peer) => {
                    // A peer that reconnects supersedes its earlier link.
                    inbound.retain(|link| link.peer != peer);
                    inbound.push(InboundLink::spawn(peer, remote_port, reader));
                }
                None => {
                    warn!(remote_port, "Inbound connection failed its handshake");
                    sink.emit(ProtocolEvent::UnidentifiedCrash { remote_port }).await;
                }
            }
        }

        let discovered = inbound.len();
        info!(
            outbound = outbound.len(),
            inbound = discovered,
            "Mesh formed"
        );
        Self {
            outbound,
            inbound,
            discovered,
        }
    }

    /// Rounds to run: inbound links identified during formation.
    pub fn round_budget(&self) -> u32 {
        self.discovered as u32
    }

    /// Peers still reachable for reads.
    pub fn live_peers(&self) -> Vec<Identity> {
        self.inbound.iter().map(|link| link.peer).collect()
    }

    pub fn outbound_mut(&mut self) -> &mut [OutboundLink] {
        &mut self.outbound
    }

    /// Forget a peer in both directions.
    pub fn drop_peer(&mut self, peer: Identity) {
        self.outbound.retain(|link| link.peer != peer);
        self.inbound.retain(|link| link.peer != peer);
    }

    /// Stop sending to a peer whose outbound link failed.
    pub fn drop_outbound(&mut self, peer: Identity) {
        self.outbound.retain(|link| link.peer != peer);
    }

    /// Wait for one line from every live inbound link, up to a shared deadline.
    pub async fn receive_round(&mut self, wait: Duration) -> Vec<RoundRead> {
        let deadline = Instant::now() + wait;
        join_all(self.inbound.iter_mut().map(|link| async move {
            let result = match timeout_at(deadline, link.lines.recv()).await {
                Ok(Some(Ok(line))) => Ok(line),
                Ok(Some(Err(e))) => Err(LinkFailure::Io(e.to_string())),
                Ok(None) => Err(LinkFailure::Closed),
                Err(_) => Err(LinkFailure::Timeout),
            };
            RoundRead {
                peer: link.peer,
                remote_port: link.remote_port,
                result,
            }
        }))
        .await
    }
}

async fn connect(config: &ParticipantConfig, peer: Identity) -> Result<OutboundLink, String> {
    let stream = match timeout(config.timeout, TcpStream::connect(config.peer_addr(peer))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err("connect timed out".to_string()),
    };
    let (_, writer) = stream.into_split();
    let mut link = OutboundLink { peer, writer };
    link.send(&Message::Hello {
        identity: config.port,
    })
    .await
    .map_err(|e| e.to_string())?;
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use std::net::{IpAddr, Ipv4Addr};

    fn config(port: Identity, timeout_ms: u64) -> ParticipantConfig {
        ParticipantConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            coordinator_port: 0,
            port,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn listener() -> (TcpListener, Identity) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported_crashed() {
        let (listener, me) = listener().await;
        // Bind and drop to get a port nothing listens on.
        let (gone, gone_port) = self::listener().await;
        drop(gone);

        let sink = RecordingSink::new();
        let mesh = Mesh::form(&listener, &config(me, 150), &[gone_port], &sink).await;

        assert_eq!(mesh.round_budget(), 0);
        assert_eq!(sink.crashed(), vec![gone_port]);
    }

    #[tokio::test]
    async fn test_inbound_links_are_identified_by_handshake() {
        let (listener, me) = listener().await;
        let (_other_listener, other) = self::listener().await;

        let peer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", me)).await.unwrap();
            write_message(&mut stream, &Message::Hello { identity: other })
                .await
                .unwrap();
            write_message(&mut stream, &Message::Vote { votes: vec![] })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            stream
        });

        let sink = RecordingSink::new();
        let mut mesh = Mesh::form(&listener, &config(me, 200), &[other], &sink).await;
        assert_eq!(mesh.round_budget(), 1);
        assert_eq!(mesh.live_peers(), vec![other]);
        assert_eq!(mesh.outbound_mut().len(), 1);

        let reads = mesh.receive_round(Duration::from_millis(200)).await;
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].peer, other);
        assert_eq!(reads[0].result, Ok("VOTE".to_string()));

        let reads = mesh.receive_round(Duration::from_millis(100)).await;
        assert_eq!(reads[0].result, Err(LinkFailure::Timeout));
        drop(peer);
    }

    #[tokio::test]
    async fn test_connection_without_handshake_is_unidentified() {
        let (listener, me) = listener().await;

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", me)).await.unwrap();
            write_message(&mut stream, &Message::Vote { votes: vec![] })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let sink = RecordingSink::new();
        let mesh = Mesh::form(&listener, &config(me, 200), &[], &sink).await;
        assert_eq!(mesh.round_budget(), 0);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ProtocolEvent::UnidentifiedCrash { .. })));
    }

    #[tokio::test]
    async fn test_drop_peer_removes_both_directions() {
        let (listener, me) = listener().await;
        let (other_listener, other) = self::listener().await;

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", me)).await.unwrap();
            write_message(&mut stream, &Message::Hello { identity: other })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(other_listener);
        });

        let sink = RecordingSink::new();
        let mut mesh = Mesh::form(&listener, &config(me, 200), &[other], &sink).await;
        assert_eq!(mesh.live_peers(), vec![other]);

        mesh.drop_peer(other);
        assert!(mesh.live_peers().is_empty());
        assert!(mesh.outbound_mut().is_empty());
        assert_eq!(mesh.round_budget(), 1);
    }
}
