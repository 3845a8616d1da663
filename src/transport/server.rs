//! Receiving side of the log channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::sink::LogSink;
use super::ACK;
use crate::config::LogServerConfig;
use crate::error::Result;

/// Appends every received line to a sink and acknowledges it.
pub struct LogServer {
    socket: UdpSocket,
    max_datagram_bytes: usize,
}

impl LogServer {
    /// Bind the receiving socket.
    pub async fn bind(config: &LogServerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen_addr).await?;
        Ok(Self {
            socket,
            max_datagram_bytes: config.max_datagram_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive forever.
    pub async fn serve<S: LogSink + ?Sized>(self, sink: Arc<S>) -> Result<()> {
        info!(addr = %self.local_addr()?, "Log receiver listening");
        let mut buf = vec![0u8; self.max_datagram_bytes];
        loop {
            self.receive_one(&mut buf, sink.as_ref()).await;
        }
    }

    /// Receive until `signal` resolves.
    pub async fn serve_with_shutdown<S, F>(self, sink: Arc<S>, signal: F) -> Result<()>
    where
        S: LogSink + ?Sized,
        F: std::future::Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.serve(sink) => result,
            _ = signal => {
                info!("Log receiver stopped");
                Ok(())
            }
        }
    }

    async fn receive_one<S: LogSink + ?Sized>(&self, buf: &mut [u8], sink: &S) {
        let (len, from) = match self.socket.recv_from(buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "Log receive failed");
                return;
            }
        };

        if len == buf.len() {
            warn!(from = %from, len, "Log line may have been truncated");
        }

        let line = stamp(&String::from_utf8_lossy(&buf[..len]), chrono::Utc::now().timestamp_millis());
        debug!(from = %from, line = %line, "Log line received");
        if let Err(e) = sink.append(&line) {
            warn!(error = %e, "Failed to append log line");
        }

        if let Err(e) = self.socket.send_to(ACK, from).await {
            warn!(error = %e, to = %from, "Failed to send acknowledgement");
        }
    }
}

/// Insert the receipt time after the sender's tag.
fn stamp(datagram: &str, receipt_millis: i64) -> String {
    let (tag, message) = datagram.split_once(' ').unwrap_or((datagram, ""));
    format!("{} {} {}", tag, receipt_millis, message)
}
