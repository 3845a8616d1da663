//! Line-oriented wire protocol shared by the coordinator and participants.
//!
//! Every message is a single line of space-separated tokens whose first
//! token is the message tag. Payloads are plain tokens, with no brackets or
//! comma separators.

mod codec;
mod message;

pub use codec::{read_message, write_message, MessageReader};
pub use message::{Identity, Message, ProtocolError, Vote};
