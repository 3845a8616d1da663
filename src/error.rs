//! Error types for the gossip voting processes.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Main error type for gossipvote operations.
#[derive(Error, Debug)]
pub enum GossipVoteError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A peer or the coordinator violated the line protocol
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The log channel gave up after exhausting its retries
    #[error("Log delivery failed after {attempts} attempts")]
    Delivery { attempts: u32 },

    /// A log line would not fit in one receiver datagram
    #[error("Log line of {len} bytes exceeds the {max} byte datagram limit")]
    Oversize { len: usize, max: usize },

    /// The run could not continue (for example the coordinator hung up)
    #[error("Session error: {0}")]
    Session(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gossipvote operations.
pub type Result<T> = std::result::Result<T, GossipVoteError>;
