//! Newline framing over async byte streams.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use super::message::Message;
use crate::error::Result;

/// Reads newline-terminated protocol lines from a stream.
///
/// `next_line` is cancel safe, so it may be raced against a timeout
/// without losing a partially received line.
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next raw line, or `None` once the peer has closed its side.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

/// Read and decode the next message.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
) -> Result<Option<Message>> {
    match reader.next_line().await? {
        Some(line) => Ok(Some(Message::decode(&line)?)),
        None => Ok(None),
    }
}

/// Encode and write one message followed by a newline, then flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> std::io::Result<()> {
    let mut line = message.encode();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
