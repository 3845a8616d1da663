//! Sending side of the log channel.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::ACK;
use crate::config::LogClientConfig;
use crate::error::{GossipVoteError, Result};
use crate::events::{EventSink, ProtocolEvent};
use crate::protocol::Identity;

/// Ships tagged log lines to a [`super::LogServer`].
pub struct LogClient {
    config: LogClientConfig,
}

impl LogClient {
    pub fn new(config: LogClientConfig) -> Self {
        debug!(
            server = %config.server_addr,
            tag = config.tag,
            "Log client ready"
        );
        Self { config }
    }

    /// The tag prefixed to every line.
    pub fn tag(&self) -> Identity {
        self.config.tag
    }

    /// Deliver `"<tag> <message>"`, retransmitting until acknowledged.
    ///
    /// Each call binds its own ephemeral socket, so a late ACK for an
    /// earlier line can never confirm this one. Fails with
    /// [`GossipVoteError::Delivery`] once `max_attempts` sends have each gone
    /// unacknowledged for `ack_timeout`, and with
    /// [`GossipVoteError::Oversize`] before sending anything if the line
    /// would be truncated by the receiver.
    pub async fn send(&self, message: &str) -> Result<()> {
        let payload = format!("{} {}", self.config.tag, message);
        if payload.len() > self.config.max_datagram_bytes {
            return Err(GossipVoteError::Oversize {
                len: payload.len(),
                max: self.config.max_datagram_bytes,
            });
        }

        let socket = UdpSocket::bind(unspecified(self.config.server_addr)).await?;
        let mut buf = [0u8; 16];

        for attempt in 1..=self.config.max_attempts {
            socket
                .send_to(payload.as_bytes(), self.config.server_addr)
                .await?;

            let deadline = Instant::now() + self.config.ack_timeout;
            let acked = timeout_at(deadline, async {
                loop {
                    let (len, _) = socket.recv_from(&mut buf).await?;
                    if &buf[..len] == ACK {
                        return Ok::<_, std::io::Error>(());
                    }
                }
            })
            .await;

            match acked {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    // ICMP port-unreachable surfaces here on some platforms.
                    debug!(attempt, error = %e, "Log receive failed");
                    tokio::time::sleep_until(deadline).await;
                }
                Err(_) => debug!(attempt, "Log acknowledgement timed out"),
            }
        }

        Err(GossipVoteError::Delivery {
            attempts: self.config.max_attempts,
        })
    }

    /// Move the client onto a background task fed by an [`EventForwarder`].
    ///
    /// The task ends once every forwarder clone is dropped and the queue is
    /// drained.
    pub fn into_forwarder(self) -> (EventForwarder, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProtocolEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.send(&event.to_string()).await {
                    warn!(error = %e, event = %event, "Dropping log event");
                }
            }
        });
        (EventForwarder { tx }, handle)
    }
}

fn unspecified(server: SocketAddr) -> &'static str {
    if server.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    }
}

/// Event sink that queues events for a [`LogClient`] running in the background.
///
/// Emitting never waits for an acknowledgement, so an unreachable observer
/// cannot stall protocol timing.
#[derive(Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<ProtocolEvent>,
}

#[async_trait]
impl EventSink for EventForwarder {
    async fn emit(&self, event: ProtocolEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(event = %e.0, "Log forwarder has stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client_config(server_addr: SocketAddr) -> LogClientConfig {
        LogClientConfig {
            server_addr,
            tag: 5001,
            ack_timeout: Duration::from_millis(100),
            max_attempts: 4,
            max_datagram_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_send_gives_up_after_four_attempts() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let client = LogClient::new(client_config(addr));

        let err = client.send("hello").await.unwrap_err();
        assert!(matches!(err, GossipVoteError::Delivery { attempts: 4 }));

        let mut buf = [0u8; 64];
        let mut received = 0;
        while let Ok(Ok((len, _))) =
            tokio::time::timeout(Duration::from_millis(50), silent.recv_from(&mut buf)).await
        {
            assert_eq!(&buf[..len], b"5001 hello");
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_send_succeeds_on_ack() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let client = LogClient::new(client_config(addr));

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
            receiver.send_to(ACK, from).await.unwrap();
            String::from_utf8_lossy(&buf[..len]).into_owned()
        });

        client.send("Round 1 started").await.unwrap();
        assert_eq!(echo.await.unwrap(), "5001 Round 1 started");
    }

    #[tokio::test]
    async fn test_send_ignores_stray_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let client = LogClient::new(client_config(addr));

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = receiver.recv_from(&mut buf).await.unwrap();
            receiver.send_to(b"NOPE", from).await.unwrap();
            receiver.send_to(ACK, from).await.unwrap();
        });

        client.send("line").await.unwrap();
    }

    #[tokio::test]
    async fn test_retransmits_until_acknowledged() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let client = LogClient::new(client_config(addr));

        let lossy = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            // Swallow the first two transmissions.
            receiver.recv_from(&mut buf).await.unwrap();
            receiver.recv_from(&mut buf).await.unwrap();
            let (_, from) = receiver.recv_from(&mut buf).await.unwrap();
            receiver.send_to(ACK, from).await.unwrap();
        });

        client.send("eventually").await.unwrap();
        lossy.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_ships_events_in_order() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let client = LogClient::new(client_config(addr));
        let (forwarder, flushed) = client.into_forwarder();

        forwarder.emit(ProtocolEvent::BeginRound { round: 1 }).await;
        forwarder.emit(ProtocolEvent::EndRound { round: 1 }).await;
        drop(forwarder);

        let mut buf = [0u8; 64];
        for expected in ["5001 Round 1 started", "5001 Round 1 completed"] {
            let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], expected.as_bytes());
            receiver.send_to(ACK, from).await.unwrap();
        }
        flushed.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_ack_does_not_confirm_next_line() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let client = LogClient::new(client_config(addr));

        // Acknowledges 150ms late and never acknowledges "second".
        let slow = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut logged = Vec::new();
            while let Ok(Ok((len, from))) =
                tokio::time::timeout(Duration::from_millis(800), receiver.recv_from(&mut buf))
                    .await
            {
                let line = String::from_utf8_lossy(&buf[..len]).into_owned();
                if line.ends_with("second") {
                    continue;
                }
                logged.push(line);
                tokio::time::sleep(Duration::from_millis(150)).await;
                let _ = receiver.send_to(ACK, from).await;
            }
            logged
        });

        client.send("first").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = client.send("second").await.unwrap_err();
        assert!(matches!(err, GossipVoteError::Delivery { attempts: 4 }));

        let logged = slow.await.unwrap();
        assert!(logged.iter().all(|line| line == "5001 first"));
    }

    #[tokio::test]
    async fn test_oversize_line_is_rejected_before_sending() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let mut config = client_config(addr);
        config.max_datagram_bytes = 16;
        let client = LogClient::new(config);

        let err = client.send("Votes sent to 5002: 5001 A 5003 B").await.unwrap_err();
        assert!(matches!(err, GossipVoteError::Oversize { len: 38, max: 16 }));

        let mut buf = [0u8; 64];
        let nothing =
            tokio::time::timeout(Duration::from_millis(100), receiver.recv_from(&mut buf)).await;
        assert!(nothing.is_err());

        // Exactly at the limit still goes out.
        tokio::spawn(async move {
            let (_, from) = receiver.recv_from(&mut buf).await.unwrap();
            receiver.send_to(ACK, from).await.unwrap();
        });
        client.send("01234567890").await.unwrap();
    }
}
