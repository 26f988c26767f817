//! Protocol module for encoding and decoding messages.
//!
//! The protocol is deliberately minimal: one short text token per payload.

pub mod message;

pub use message::{decode, encode, DecodeError, Direction, Message, MessageKind};
