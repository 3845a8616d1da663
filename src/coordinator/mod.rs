//! Rendezvous coordinator.
//!
//! Collects joins until the expected number of participants is in, tells
//! each one who the others are and what the candidate choices are, then
//! waits for every participant's outcome (or its crash).

mod membership;
mod rendezvous;

pub use membership::{Member, PeerSet};
pub use rendezvous::{Connection, Coordinator, CrashReason, Phase, Verdict};
