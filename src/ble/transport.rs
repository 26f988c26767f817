//! Transport adapter boundary.
//!
//! The radio stack is an external collaborator. The core issues commands
//! through [`Transport`] and learns about outcomes from [`TransportEvent`]s
//! the adapter posts to an [`EventSink`](crate::dispatcher::EventSink).
//! Every command returns immediately; results always arrive as events.

use btleplug::api::{CharPropFlags, WriteType};
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::uuids::ServiceDescriptor;
use crate::error::Result;

/// Opaque handle to a remote device at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Power/authorization state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportState {
    /// State not yet reported.
    #[default]
    Unknown,
    /// Radio is resetting; a new state follows.
    Resetting,
    /// Radio hardware is missing or lacks LE support.
    Unsupported,
    /// The process is not allowed to use the radio.
    Unauthorized,
    /// Radio is switched off.
    PoweredOff,
    /// Radio is ready.
    PoweredOn,
}

impl TransportState {
    /// Check if commands can be issued.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// A characteristic found on a remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the service containing the characteristic.
    pub service_uuid: Uuid,
    /// Characteristic properties.
    pub properties: CharPropFlags,
}

impl CharacteristicHandle {
    /// Create a characteristic handle.
    pub fn new(uuid: Uuid, service_uuid: Uuid, properties: CharPropFlags) -> Self {
        Self {
            uuid,
            service_uuid,
            properties,
        }
    }

    /// The handle for a descriptor's characteristic, with its published properties.
    pub fn for_descriptor(descriptor: &ServiceDescriptor) -> Self {
        Self::new(
            descriptor.characteristic_uuid,
            descriptor.service_uuid,
            descriptor.properties,
        )
    }
}

/// A single write delivered to the advertiser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// The writing central.
    pub central: PeerId,
    /// Written characteristic.
    pub characteristic: Uuid,
    /// Written bytes.
    pub value: Vec<u8>,
}

/// A peripheral handed back by the platform after a cold start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredPeripheral {
    /// The restored peer.
    pub peer: PeerId,
    /// Previously discovered characteristic, if discovery had completed.
    pub characteristic: Option<CharacteristicHandle>,
    /// Whether notifications were enabled on that characteristic.
    pub notifying: bool,
}

/// Events posted by a transport adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Radio state changed.
    StateChanged(TransportState),

    // Scanner role
    /// A peripheral was seen while scanning.
    Discovered {
        /// The peripheral.
        peer: PeerId,
        /// Advertisement contents.
        advertisement: Advertisement,
        /// Signal strength in dBm.
        rssi: i16,
    },
    /// Connection established.
    Connected {
        /// The peripheral.
        peer: PeerId,
    },
    /// Connection attempt failed.
    ConnectFailed {
        /// The peripheral.
        peer: PeerId,
        /// Transport error description.
        error: String,
    },
    /// Connection dropped or closed.
    Disconnected {
        /// The peripheral.
        peer: PeerId,
        /// Transport error description, if the drop was unexpected.
        error: Option<String>,
    },
    /// Service discovery finished.
    ServicesFound {
        /// The peripheral.
        peer: PeerId,
        /// Discovered service UUIDs.
        services: Vec<Uuid>,
        /// Transport error description.
        error: Option<String>,
    },
    /// The remote changed its service table.
    ServicesInvalidated {
        /// The peripheral.
        peer: PeerId,
        /// Services that are no longer valid.
        services: Vec<Uuid>,
    },
    /// Characteristic discovery finished.
    CharacteristicsFound {
        /// The peripheral.
        peer: PeerId,
        /// Service that was searched.
        service: Uuid,
        /// Discovered characteristics.
        characteristics: Vec<CharacteristicHandle>,
        /// Transport error description.
        error: Option<String>,
    },
    /// Notification state changed on a characteristic.
    NotifyStateChanged {
        /// The peripheral.
        peer: PeerId,
        /// The characteristic.
        characteristic: Uuid,
        /// Whether notifications are now enabled.
        enabled: bool,
        /// Transport error description.
        error: Option<String>,
    },
    /// A notified value arrived.
    ValueUpdated {
        /// The peripheral.
        peer: PeerId,
        /// The characteristic.
        characteristic: Uuid,
        /// Value bytes.
        value: Vec<u8>,
        /// Transport error description.
        error: Option<String>,
    },
    /// Live connections handed back after a cold start (scanner role).
    CentralRestored {
        /// Restored peripherals, most relevant first.
        peripherals: Vec<RestoredPeripheral>,
    },

    // Advertiser role
    /// A central subscribed to a characteristic.
    Subscribed {
        /// The central.
        central: PeerId,
        /// The characteristic.
        characteristic: Uuid,
    },
    /// A central unsubscribed from a characteristic.
    Unsubscribed {
        /// The central.
        central: PeerId,
        /// The characteristic.
        characteristic: Uuid,
    },
    /// One or more writes arrived.
    WriteReceived {
        /// The writes, in arrival order.
        requests: Vec<WriteRequest>,
    },
    /// The outbound notification queue has room again.
    ReadyToUpdateSubscribers,
    /// Advertising started or failed to start.
    AdvertisingStarted {
        /// Transport error description.
        error: Option<String>,
    },
    /// Published services and subscriptions handed back after a cold start.
    PeripheralRestored {
        /// Previously published service UUIDs.
        services: Vec<Uuid>,
        /// Centrals that were subscribed to the characteristic.
        subscribed_centrals: Vec<PeerId>,
    },
}

impl TransportEvent {
    /// Short event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "state_changed",
            Self::Discovered { .. } => "discovered",
            Self::Connected { .. } => "connected",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::Disconnected { .. } => "disconnected",
            Self::ServicesFound { .. } => "services_found",
            Self::ServicesInvalidated { .. } => "services_invalidated",
            Self::CharacteristicsFound { .. } => "characteristics_found",
            Self::NotifyStateChanged { .. } => "notify_state_changed",
            Self::ValueUpdated { .. } => "value_updated",
            Self::CentralRestored { .. } => "central_restored",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::WriteReceived { .. } => "write_received",
            Self::ReadyToUpdateSubscribers => "ready_to_update_subscribers",
            Self::AdvertisingStarted { .. } => "advertising_started",
            Self::PeripheralRestored { .. } => "peripheral_restored",
        }
    }
}

/// Commands the core issues to the radio stack.
///
/// Implementations must not block: each command either fails synchronously
/// (for example when the radio is off) or reports its outcome later as a
/// [`TransportEvent`].
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Current radio state.
    fn state(&self) -> TransportState;

    /// Peers that are already connected at the transport level and expose `service`.
    fn retrieve_connected(&self, service: Uuid) -> Vec<PeerId>;

    /// Start scanning for peripherals advertising any of `services`.
    fn scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()>;

    /// Stop scanning.
    fn stop_scan(&self) -> Result<()>;

    /// Connect to a peer.
    fn connect(&self, peer: &PeerId) -> Result<()>;

    /// Disconnect from a peer, or cancel a pending connection.
    fn disconnect(&self, peer: &PeerId) -> Result<()>;

    /// Discover the given services on a connected peer.
    fn discover_services(&self, peer: &PeerId, services: &[Uuid]) -> Result<()>;

    /// Discover the given characteristics of a service.
    fn discover_characteristics(
        &self,
        peer: &PeerId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    /// Enable or disable notifications on a characteristic.
    fn set_notify(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<()>;

    /// Write a value to a characteristic.
    fn write(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Publish a service and its characteristic.
    fn publish_service(&self, descriptor: &ServiceDescriptor) -> Result<()>;

    /// Remove every published service.
    fn remove_all_services(&self) -> Result<()>;

    /// Start advertising.
    fn advertise(&self, advertisement: &Advertisement) -> Result<()>;

    /// Push a notification to subscribed centrals.
    ///
    /// Returns `false` when the outbound queue is full; the transport later
    /// posts [`TransportEvent::ReadyToUpdateSubscribers`].
    fn push_notification(&self, characteristic: Uuid, value: &[u8], subscribers: &[PeerId])
        -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_state() {
        assert!(TransportState::PoweredOn.is_ready());
        assert!(!TransportState::PoweredOff.is_ready());
        assert!(!TransportState::default().is_ready());
        assert_eq!(TransportState::Unauthorized.to_string(), "Unauthorized");
    }

    #[test]
    fn test_peer_id() {
        let peer = PeerId::from("AA:BB");
        assert_eq!(peer.as_str(), "AA:BB");
        assert_eq!(peer.to_string(), "AA:BB");
    }

    #[test]
    fn test_event_name() {
        let event = TransportEvent::Connected {
            peer: PeerId::from("a"),
        };
        assert_eq!(event.name(), "connected");
        assert_eq!(
            TransportEvent::ReadyToUpdateSubscribers.name(),
            "ready_to_update_subscribers"
        );
    }

    #[test]
    fn test_characteristic_for_descriptor() {
        let descriptor = ServiceDescriptor::default();
        let handle = CharacteristicHandle::for_descriptor(&descriptor);
        assert_eq!(handle.uuid, descriptor.characteristic_uuid);
        assert_eq!(handle.service_uuid, descriptor.service_uuid);
        assert!(handle.properties.contains(CharPropFlags::NOTIFY));
    }
}
