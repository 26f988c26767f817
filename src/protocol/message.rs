//! Request/response messages and their wire encoding.
//!
//! Each message travels as a single UTF-8 token naming its kind. Requests
//! are written by the scanner and responses are notified by the advertiser,
//! so the token alone does not say which one it is: the receiving role
//! supplies the [`Direction`] when decoding.

use thiserror::Error;

/// Message kinds understood by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageKind {
    /// Greeting, answered with a greeting.
    Hello,
}

impl MessageKind {
    /// All known kinds, in token lookup order.
    pub const ALL: [MessageKind; 1] = [MessageKind::Hello];

    /// Canonical wire token for this kind.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
        }
    }

    /// Look up a kind by its wire token.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.token() == token)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Which way a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Scanner to advertiser (characteristic write).
    Request,
    /// Advertiser to scanner (characteristic notification).
    Response,
}

/// A protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    /// A request sent by the scanner.
    Request(MessageKind),
    /// A response sent by the advertiser.
    Response(MessageKind),
}

impl Message {
    /// Build a message of the given kind travelling in `direction`.
    pub fn new(direction: Direction, kind: MessageKind) -> Self {
        match direction {
            Direction::Request => Self::Request(kind),
            Direction::Response => Self::Response(kind),
        }
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(kind) | Self::Response(kind) => *kind,
        }
    }

    /// The direction this message travels in.
    pub fn direction(&self) -> Direction {
        match self {
            Self::Request(_) => Direction::Request,
            Self::Response(_) => Direction::Response,
        }
    }

    /// The response answering this message, if it is a request.
    pub fn response(&self) -> Option<Self> {
        match self {
            Self::Request(kind) => Some(Self::Response(*kind)),
            Self::Response(_) => None,
        }
    }

    /// Serialize the message to its wire payload.
    pub fn encode(&self) -> Vec<u8> {
        self.kind().token().as_bytes().to_vec()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(kind) => write!(f, "request:{}", kind),
            Self::Response(kind) => write!(f, "response:{}", kind),
        }
    }
}

/// Reasons a payload fails to decode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload is not valid UTF-8 text.
    #[error("payload is not valid UTF-8")]
    Malformed,
    /// The payload is text but not a known token.
    #[error("unrecognized message token")]
    Unrecognized,
}

/// Encode a message to its wire payload.
pub fn encode(message: &Message) -> Vec<u8> {
    message.encode()
}

/// Decode a wire payload received in the given direction.
pub fn decode(data: &[u8], direction: Direction) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::Malformed)?;
    let kind = MessageKind::from_token(text).ok_or(DecodeError::Unrecognized)?;
    Ok(Message::new(direction, kind))
}
