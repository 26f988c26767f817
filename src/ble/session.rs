//! Peer session state machine.
//!
//! Tracks one remote endpoint through discovery, connection, capability
//! discovery, subscription and active messaging. The owning controller
//! drives transitions from transport events; this module only decides
//! which transitions are legal and records the bookkeeping that goes with
//! them.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::ble::transport::{CharacteristicHandle, PeerId};
use crate::ble::uuids::ServiceDescriptor;
use crate::error::{Error, Result};

/// Lifecycle state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Seen in a discovery event above the signal threshold.
    #[default]
    Discovered,
    /// Connect command issued.
    Connecting,
    /// Link established.
    Connected,
    /// Looking for the transfer service.
    DiscoveringServices,
    /// Looking for the transfer characteristic.
    DiscoveringCharacteristics,
    /// Enabling notifications.
    Subscribing,
    /// Requests and responses can flow.
    Ready,
    /// Cleanup commands issued after an error.
    Disconnecting,
    /// Terminal; the session is discarded.
    Disconnected,
}

impl SessionState {
    /// All states in lifecycle order.
    pub const ALL: [SessionState; 9] = [
        SessionState::Discovered,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::DiscoveringServices,
        SessionState::DiscoveringCharacteristics,
        SessionState::Subscribing,
        SessionState::Ready,
        SessionState::Disconnecting,
        SessionState::Disconnected,
    ];

    /// Check whether a session may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        match (*self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Discovered, Connecting) => true,
            // Explicit cancel of a pending connection.
            (Connecting, Connected | Disconnecting) => true,
            (Connected, DiscoveringServices) => true,
            (DiscoveringServices, DiscoveringCharacteristics) => true,
            (DiscoveringCharacteristics, Subscribing) => true,
            (Subscribing, Ready) => true,
            // The remote changed its service table.
            (Ready, DiscoveringServices) => true,
            (
                Connected | DiscoveringServices | DiscoveringCharacteristics | Subscribing | Ready,
                Disconnecting,
            ) => true,
            _ => false,
        }
    }

    /// Check if messages can be exchanged.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the link is up at the transport level.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Subscribing
                | Self::Ready
        )
    }

    /// Check if the session is waiting on the transport to finish a handshake step.
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Subscribing
        )
    }

    /// Check if the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered => write!(f, "Discovered"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::DiscoveringCharacteristics => write!(f, "DiscoveringCharacteristics"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// State for one remote endpoint.
#[derive(Debug, Clone)]
pub struct PeerSession {
    peer: PeerId,
    state: SessionState,
    descriptor: Arc<ServiceDescriptor>,
    characteristic: Option<CharacteristicHandle>,
    rssi: Option<i16>,
    subscribed: bool,
    entered_at: Instant,
}

impl PeerSession {
    /// Create a session for a peer accepted from a discovery event.
    pub fn discovered(peer: PeerId, descriptor: Arc<ServiceDescriptor>, rssi: Option<i16>) -> Self {
        Self {
            peer,
            state: SessionState::Discovered,
            descriptor,
            characteristic: None,
            rssi,
            subscribed: false,
            entered_at: Instant::now(),
        }
    }

    /// Recreate a session directly in `state` without replaying the handshake.
    ///
    /// Used when the platform hands back live connections or subscriptions
    /// after a cold start, and by the advertiser when a central subscribes.
    pub fn rehydrate(
        peer: PeerId,
        descriptor: Arc<ServiceDescriptor>,
        state: SessionState,
        characteristic: Option<CharacteristicHandle>,
    ) -> Self {
        let subscribed = state.is_ready();
        debug!("Rehydrating session for {} in state {}", peer, state);

        Self {
            peer,
            state,
            descriptor,
            characteristic,
            rssi: None,
            subscribed,
            entered_at: Instant::now(),
        }
    }

    /// The remote peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The shared service descriptor.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// The discovered characteristic, once discovery has completed.
    pub fn characteristic(&self) -> Option<&CharacteristicHandle> {
        self.characteristic.as_ref()
    }

    /// Signal strength seen at discovery time.
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Whether notifications are enabled on the characteristic.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// When the current state was entered.
    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    /// Check whether this session belongs to `peer`.
    pub fn is_peer(&self, peer: &PeerId) -> bool {
        self.peer == *peer
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            warn!(
                "Rejected session transition for {}: {} -> {}",
                self.peer, self.state, next
            );
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        debug!("Session {} state changed: {} -> {}", self.peer, self.state, next);

        match next {
            SessionState::DiscoveringServices => {
                // Handles from a previous service table are stale.
                self.characteristic = None;
                self.subscribed = false;
            }
            SessionState::Ready => self.subscribed = true,
            SessionState::Disconnected => self.subscribed = false,
            _ => {}
        }

        self.state = next;
        self.entered_at = Instant::now();
        Ok(())
    }

    /// Record the discovered characteristic.
    pub fn set_characteristic(&mut self, characteristic: CharacteristicHandle) {
        self.characteristic = Some(characteristic);
    }

    /// Record that notifications were switched off remotely.
    pub fn clear_subscription(&mut self) {
        self.subscribed = false;
    }
}
