//! Reliable log channel over UDP.
//!
//! The sender retransmits each line until the receiver echoes `ACK` or the
//! attempt budget runs out. The receiver acknowledges every datagram, so
//! delivery is at-least-once and the log may contain duplicate lines.

mod client;
mod server;
mod sink;

pub use client::{EventForwarder, LogClient};
pub use server::LogServer;
pub use sink::{FileSink, LogSink};

/// Body of every acknowledgement datagram.
pub const ACK: &[u8; 3] = b"ACK";
