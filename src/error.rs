//! Error types for the transfer-rust-ble crate.

use thiserror::Error;

use crate::ble::session::SessionState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio is off, unsupported, or the process is not authorized to use it.
    #[error("Bluetooth not available or disabled")]
    TransportUnavailable,

    /// A request or response could not be handed to the transport.
    #[error("Send failed: {reason}")]
    SendFailed {
        /// Description of why the message was not sent.
        reason: String,
    },

    /// Operation requires an active peer session.
    #[error("Peer not connected")]
    NotConnected,

    /// The peer session cannot move between the given states.
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// State that was requested.
        to: SessionState,
    },

    /// The transport does not implement the requested command.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The transport has no peripheral with the given identifier.
    #[error("Peer not found: {identifier}")]
    PeerNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::SendFailed`] with the given reason.
    pub(crate) fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed {
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories reported to observers.
///
/// Range rejections and undecodable payloads are deliberately absent: those
/// are dropped after logging and never reach an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Radio off, unsupported or unauthorized. Retried on the next power-on.
    TransportUnavailable,
    /// The connection attempt was rejected by the transport.
    ConnectFailed,
    /// Service discovery reported an error or did not find the service.
    ServiceDiscoveryFailed,
    /// Characteristic discovery reported an error or did not find the characteristic.
    CharacteristicDiscoveryFailed,
    /// Enabling notifications failed, or notifications stopped unexpectedly.
    SubscriptionFailed,
    /// A value update arrived with an error.
    ReceiveFailed,
    /// The session stalled in a handshake state for longer than the configured timeout.
    HandshakeTimeout,
    /// The transport refused to publish or advertise the service.
    AdvertisingFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TransportUnavailable => "transport unavailable",
            Self::ConnectFailed => "connect failed",
            Self::ServiceDiscoveryFailed => "service discovery failed",
            Self::CharacteristicDiscoveryFailed => "characteristic discovery failed",
            Self::SubscriptionFailed => "subscription failed",
            Self::ReceiveFailed => "receive failed",
            Self::HandshakeTimeout => "handshake timeout",
            Self::AdvertisingFailed => "advertising failed",
        };
        f.write_str(name)
    }
}
