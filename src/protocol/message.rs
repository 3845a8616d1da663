//! Protocol messages and their text encoding.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A process identity: the TCP port it listens on.
pub type Identity = u16;

/// Errors raised while decoding a protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message tag `{0}`")]
    UnknownTag(String),
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },
    #[error("invalid identity `{0}`")]
    InvalidIdentity(String),
    #[error("vote for identity {0} has no choice")]
    UnpairedVote(Identity),
    #[error("{tag} is missing its {field}")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },
}

/// A single participant's choice.
///
/// Ordering is by identity, then choice, so sets of votes iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vote {
    /// Who cast the vote.
    pub participant: Identity,
    /// The candidate chosen.
    pub choice: String,
}

impl Vote {
    pub fn new(participant: Identity, choice: impl Into<String>) -> Self {
        Self {
            participant,
            choice: choice.into(),
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.participant, self.choice)
    }
}

/// Every message exchanged over the stream connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Participant announces its listening identity to the coordinator.
    Join { identity: Identity },
    /// First line on every participant-to-participant connection.
    Hello { identity: Identity },
    /// Coordinator lists every other joined identity.
    Details { peers: Vec<Identity> },
    /// Coordinator lists the candidate choices.
    VoteOptions { options: Vec<String> },
    /// One round's worth of newly seen votes.
    Vote { votes: Vec<Vote> },
    /// Participant reports its decision and the identities it heard from.
    Outcome {
        choice: String,
        contributors: Vec<Identity>,
    },
}

impl Message {
    pub const JOIN: &'static str = "JOIN";
    pub const HELLO: &'static str = "HELLO";
    pub const DETAILS: &'static str = "DETAILS";
    pub const VOTE_OPTIONS: &'static str = "VOTE_OPTIONS";
    pub const VOTE: &'static str = "VOTE";
    pub const OUTCOME: &'static str = "OUTCOME";

    /// The leading token of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Join { .. } => Self::JOIN,
            Message::Hello { .. } => Self::HELLO,
            Message::Details { .. } => Self::DETAILS,
            Message::VoteOptions { .. } => Self::VOTE_OPTIONS,
            Message::Vote { .. } => Self::VOTE,
            Message::Outcome { .. } => Self::OUTCOME,
        }
    }

    /// Encode to a single line without the trailing newline.
    pub fn encode(&self) -> String {
        let mut line = String::from(self.tag());
        match self {
            Message::Join { identity } | Message::Hello { identity } => {
                push_token(&mut line, identity);
            }
            Message::Details { peers } => {
                for peer in peers {
                    push_token(&mut line, peer);
                }
            }
            Message::VoteOptions { options } => {
                for option in options {
                    push_token(&mut line, option);
                }
            }
            Message::Vote { votes } => {
                for vote in votes {
                    push_token(&mut line, vote);
                }
            }
            Message::Outcome {
                choice,
                contributors,
            } => {
                push_token(&mut line, choice);
                for id in contributors {
                    push_token(&mut line, id);
                }
            }
        }
        line
    }

    /// Decode a single line (a trailing newline is tolerated).
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = line.split_whitespace();
        let tag = tokens.next().ok_or(ProtocolError::Empty)?;

        match tag {
            Self::JOIN => {
                let identity = parse_identity(tokens.next().ok_or(ProtocolError::MissingField {
                    tag: Self::JOIN,
                    field: "identity",
                })?)?;
                Ok(Message::Join { identity })
            }
            Self::HELLO => {
                let identity = parse_identity(tokens.next().ok_or(ProtocolError::MissingField {
                    tag: Self::HELLO,
                    field: "identity",
                })?)?;
                Ok(Message::Hello { identity })
            }
            Self::DETAILS => {
                let peers = tokens.map(parse_identity).collect::<Result<_, _>>()?;
                Ok(Message::Details { peers })
            }
            Self::VOTE_OPTIONS => Ok(Message::VoteOptions {
                options: tokens.map(str::to_string).collect(),
            }),
            Self::VOTE => {
                let mut votes = Vec::new();
                while let Some(id) = tokens.next() {
                    let participant = parse_identity(id)?;
                    let choice = tokens
                        .next()
                        .ok_or(ProtocolError::UnpairedVote(participant))?;
                    votes.push(Vote::new(participant, choice));
                }
                Ok(Message::Vote { votes })
            }
            Self::OUTCOME => {
                let choice = tokens.next().ok_or(ProtocolError::MissingField {
                    tag: Self::OUTCOME,
                    field: "choice",
                })?;
                let contributors = tokens.map(parse_identity).collect::<Result<_, _>>()?;
                Ok(Message::Outcome {
                    choice: choice.to_string(),
                    contributors,
                })
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

fn push_token(line: &mut String, token: impl fmt::Display) {
    line.push(' ');
    line.push_str(&token.to_string());
}

fn parse_identity(token: &str) -> Result<Identity, ProtocolError> {
    token
        .parse()
        .map_err(|_| ProtocolError::InvalidIdentity(token.to_string()))
}
