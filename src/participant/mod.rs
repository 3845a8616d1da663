//! Gossip participant.
//!
//! A participant joins through the coordinator, connects to every peer it
//! was told about, floods votes for a fixed number of rounds and reports
//! the majority choice back to the coordinator.

mod ledger;
mod mesh;
mod session;

pub use ledger::{Decision, VoteLedger};
pub use mesh::{InboundLink, LinkFailure, Mesh, OutboundLink, RoundRead};
pub use session::{Enrollment, Participant};
