//! Gossipvote - crash-tolerant gossip voting
//!
//! A coordinator lets participants find each other, participants flood
//! their votes over a full mesh for a bounded number of rounds and report
//! the majority, and every process ships its protocol events to an
//! observer over a retry-until-acknowledged UDP channel.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod participant;
pub mod protocol;
pub mod transport;
