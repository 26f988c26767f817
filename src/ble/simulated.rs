//! In-memory transport for tests, demos and simulations.
//!
//! A standalone [`SimulatedTransport`] only records the commands it receives.
//! Two transports created from the same [`SimulatedAir`] behave like a
//! central and a peripheral within radio range of each other: commands on
//! one side post the matching [`TransportEvent`]s to both sides' event
//! sinks, in the order a real stack would report them.

use btleplug::api::WriteType;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::transport::{
    CharacteristicHandle, PeerId, Transport, TransportEvent, TransportState, WriteRequest,
};
use crate::ble::uuids::ServiceDescriptor;
use crate::dispatcher::EventSink;
use crate::error::{Error, Result};

/// A command received by a [`SimulatedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `scan`
    Scan {
        /// Service filter.
        services: Vec<Uuid>,
        /// Duplicate reporting.
        allow_duplicates: bool,
    },
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(PeerId),
    /// `disconnect`
    Disconnect(PeerId),
    /// `discover_services`
    DiscoverServices {
        /// Target peer.
        peer: PeerId,
        /// Service filter.
        services: Vec<Uuid>,
    },
    /// `discover_characteristics`
    DiscoverCharacteristics {
        /// Target peer.
        peer: PeerId,
        /// Searched service.
        service: Uuid,
        /// Characteristic filter.
        characteristics: Vec<Uuid>,
    },
    /// `set_notify`
    SetNotify {
        /// Target peer.
        peer: PeerId,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Requested notification state.
        enabled: bool,
    },
    /// `write`
    Write {
        /// Target peer.
        peer: PeerId,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Written bytes.
        value: Vec<u8>,
        /// Write type.
        write_type: WriteType,
    },
    /// `publish_service`
    PublishService {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// `remove_all_services`
    RemoveAllServices,
    /// `advertise`
    Advertise(Advertisement),
    /// `push_notification`
    PushNotification {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Pushed bytes.
        value: Vec<u8>,
        /// Target subscribers.
        subscribers: Vec<PeerId>,
        /// Whether the push was accepted.
        accepted: bool,
    },
}

impl Command {
    /// Name of the transport method that produced this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan { .. } => "scan",
            Self::StopScan => "stop_scan",
            Self::Connect(_) => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::DiscoverServices { .. } => "discover_services",
            Self::DiscoverCharacteristics { .. } => "discover_characteristics",
            Self::SetNotify { .. } => "set_notify",
            Self::Write { .. } => "write",
            Self::PublishService { .. } => "publish_service",
            Self::RemoveAllServices => "remove_all_services",
            Self::Advertise(_) => "advertise",
            Self::PushNotification { .. } => "push_notification",
        }
    }
}

/// Which end of a [`SimulatedAir`] a transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Central,
    Peripheral,
}

/// Shared medium between one simulated central and one simulated peripheral.
struct Air {
    central_id: PeerId,
    peripheral_id: PeerId,
    rssi: i16,
    central_sink: Option<EventSink>,
    peripheral_sink: Option<EventSink>,
    published: Option<ServiceDescriptor>,
    advertisement: Option<Advertisement>,
    connected: bool,
    subscribed: bool,
}

impl Air {
    fn post_central(&self, event: TransportEvent) {
        if let Some(sink) = &self.central_sink {
            trace!("Simulated air -> central: {}", event.name());
            sink.post(event);
        }
    }

    fn post_peripheral(&self, event: TransportEvent) {
        if let Some(sink) = &self.peripheral_sink {
            trace!("Simulated air -> peripheral: {}", event.name());
            sink.post(event);
        }
    }

    fn published_handle(&self) -> Option<CharacteristicHandle> {
        self.published.as_ref().map(CharacteristicHandle::for_descriptor)
    }
}

/// A simulated radio environment with one central and one peripheral.
#[derive(Clone)]
pub struct SimulatedAir {
    air: Arc<Mutex<Air>>,
}

impl SimulatedAir {
    /// Create a medium where the peripheral is seen at `rssi` dBm.
    pub fn new(rssi: i16) -> Self {
        Self {
            air: Arc::new(Mutex::new(Air {
                central_id: PeerId::new("simulated-central"),
                peripheral_id: PeerId::new("simulated-peripheral"),
                rssi,
                central_sink: None,
                peripheral_sink: None,
                published: None,
                advertisement: None,
                connected: false,
                subscribed: false,
            })),
        }
    }

    /// Create the central end. Its events are posted to `sink`.
    pub fn central(&self, sink: EventSink) -> SimulatedTransport {
        self.air.lock().central_sink = Some(sink);
        SimulatedTransport::attached(self.air.clone(), Role::Central)
    }

    /// Create the peripheral end. Its events are posted to `sink`.
    pub fn peripheral(&self, sink: EventSink) -> SimulatedTransport {
        self.air.lock().peripheral_sink = Some(sink);
        SimulatedTransport::attached(self.air.clone(), Role::Peripheral)
    }

    /// Identity of the central as seen by the peripheral.
    pub fn central_id(&self) -> PeerId {
        self.air.lock().central_id.clone()
    }

    /// Identity of the peripheral as seen by the central.
    pub fn peripheral_id(&self) -> PeerId {
        self.air.lock().peripheral_id.clone()
    }

    /// Change the signal strength reported for future discoveries.
    pub fn set_rssi(&self, rssi: i16) {
        self.air.lock().rssi = rssi;
    }

    /// Drop the link as if the peripheral went out of range.
    pub fn drop_link(&self) {
        let mut air = self.air.lock();
        if !air.connected {
            return;
        }
        debug!("Simulated link dropped");
        air.connected = false;
        let peripheral_id = air.peripheral_id.clone();
        let central_id = air.central_id.clone();
        if air.subscribed {
            air.subscribed = false;
            if let Some(handle) = air.published_handle() {
                air.post_peripheral(TransportEvent::Unsubscribed {
                    central: central_id,
                    characteristic: handle.uuid,
                });
            }
        }
        air.post_central(TransportEvent::Disconnected {
            peer: peripheral_id,
            error: Some("link lost".to_string()),
        });
    }

    /// Tell the central that the peripheral's service table changed.
    pub fn invalidate_services(&self) {
        let air = self.air.lock();
        if let (true, Some(descriptor)) = (air.connected, air.published.as_ref()) {
            air.post_central(TransportEvent::ServicesInvalidated {
                peer: air.peripheral_id.clone(),
                services: vec![descriptor.service_uuid],
            });
        }
    }
}

struct Inner {
    state: TransportState,
    connected_peers: Vec<PeerId>,
    accept_notifications: bool,
    failing: HashSet<&'static str>,
    commands: Vec<Command>,
}

/// Transport double that records commands and, when attached to a
/// [`SimulatedAir`], answers them.
pub struct SimulatedTransport {
    inner: Mutex<Inner>,
    air: Option<(Arc<Mutex<Air>>, Role)>,
}

impl SimulatedTransport {
    /// Create a powered-on, recording-only transport.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TransportState::PoweredOn,
                connected_peers: Vec::new(),
                accept_notifications: true,
                failing: HashSet::new(),
                commands: Vec::new(),
            }),
            air: None,
        }
    }

    fn attached(air: Arc<Mutex<Air>>, role: Role) -> Self {
        Self {
            air: Some((air, role)),
            ..Self::new()
        }
    }

    /// Set the radio state reported by [`Transport::state`].
    pub fn set_state(&self, state: TransportState) {
        self.inner.lock().state = state;
    }

    /// Set the peers reported by [`Transport::retrieve_connected`].
    pub fn set_connected_peers(&self, peers: Vec<PeerId>) {
        self.inner.lock().connected_peers = peers;
    }

    /// Make `push_notification` accept or reject pushes.
    pub fn set_accept_notifications(&self, accept: bool) {
        self.inner.lock().accept_notifications = accept;
    }

    /// Make every future command with this name fail synchronously.
    pub fn fail_command(&self, name: &'static str) {
        self.inner.lock().failing.insert(name);
    }

    /// Stop failing commands with this name.
    pub fn clear_failure(&self, name: &'static str) {
        self.inner.lock().failing.remove(name);
    }

    /// All commands received so far.
    pub fn commands(&self) -> Vec<Command> {
        self.inner.lock().commands.clone()
    }

    /// Take and clear the recorded commands.
    pub fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.inner.lock().commands)
    }

    /// Number of recorded commands with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|command| command.name() == name)
            .count()
    }

    fn record(&self, command: Command) -> Result<()> {
        let mut inner = self.inner.lock();
        let name = command.name();
        if inner.failing.contains(name) {
            return Err(Error::Internal(format!("simulated {} failure", name)));
        }
        trace!("Simulated transport command: {}", name);
        inner.commands.push(command);
        Ok(())
    }

    fn with_air(&self, role: Role, f: impl FnOnce(&mut Air)) {
        if let Some((air, own_role)) = &self.air {
            if *own_role == role {
                f(&mut air.lock());
            }
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedTransport {
    fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    fn retrieve_connected(&self, _service: Uuid) -> Vec<PeerId> {
        self.inner.lock().connected_peers.clone()
    }

    fn scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
        self.record(Command::Scan {
            services: services.to_vec(),
            allow_duplicates,
        })?;
        self.with_air(Role::Central, |air| {
            let visible = air
                .advertisement
                .as_ref()
                .filter(|adv| services.is_empty() || services.iter().any(|s| adv.advertises(s)))
                .cloned();
            if let (false, Some(advertisement)) = (air.connected, visible) {
                air.post_central(TransportEvent::Discovered {
                    peer: air.peripheral_id.clone(),
                    advertisement,
                    rssi: air.rssi,
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.record(Command::StopScan)
    }

    fn connect(&self, peer: &PeerId) -> Result<()> {
        self.record(Command::Connect(peer.clone()))?;
        self.with_air(Role::Central, |air| {
            if *peer == air.peripheral_id && air.advertisement.is_some() {
                air.connected = true;
                air.post_central(TransportEvent::Connected { peer: peer.clone() });
            } else {
                air.post_central(TransportEvent::ConnectFailed {
                    peer: peer.clone(),
                    error: "peer out of range".to_string(),
                });
            }
        });
        Ok(())
    }

    fn disconnect(&self, peer: &PeerId) -> Result<()> {
        self.record(Command::Disconnect(peer.clone()))?;
        self.with_air(Role::Central, |air| {
            if air.subscribed {
                air.subscribed = false;
                if let Some(handle) = air.published_handle() {
                    air.post_peripheral(TransportEvent::Unsubscribed {
                        central: air.central_id.clone(),
                        characteristic: handle.uuid,
                    });
                }
            }
            air.connected = false;
            air.post_central(TransportEvent::Disconnected {
                peer: peer.clone(),
                error: None,
            });
        });
        Ok(())
    }

    fn discover_services(&self, peer: &PeerId, services: &[Uuid]) -> Result<()> {
        self.record(Command::DiscoverServices {
            peer: peer.clone(),
            services: services.to_vec(),
        })?;
        self.with_air(Role::Central, |air| {
            let found = air
                .published
                .as_ref()
                .map(|d| d.service_uuid)
                .filter(|uuid| services.is_empty() || services.contains(uuid))
                .into_iter()
                .collect();
            air.post_central(TransportEvent::ServicesFound {
                peer: peer.clone(),
                services: found,
                error: None,
            });
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        peer: &PeerId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        self.record(Command::DiscoverCharacteristics {
            peer: peer.clone(),
            service,
            characteristics: characteristics.to_vec(),
        })?;
        self.with_air(Role::Central, |air| {
            let found = air
                .published_handle()
                .filter(|handle| handle.service_uuid == service)
                .filter(|handle| characteristics.is_empty() || characteristics.contains(&handle.uuid))
                .into_iter()
                .collect();
            air.post_central(TransportEvent::CharacteristicsFound {
                peer: peer.clone(),
                service,
                characteristics: found,
                error: None,
            });
        });
        Ok(())
    }

    fn set_notify(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<()> {
        self.record(Command::SetNotify {
            peer: peer.clone(),
            characteristic: characteristic.uuid,
            enabled,
        })?;
        self.with_air(Role::Central, |air| {
            air.subscribed = enabled;
            air.post_central(TransportEvent::NotifyStateChanged {
                peer: peer.clone(),
                characteristic: characteristic.uuid,
                enabled,
                error: None,
            });
            let central = air.central_id.clone();
            air.post_peripheral(if enabled {
                TransportEvent::Subscribed {
                    central,
                    characteristic: characteristic.uuid,
                }
            } else {
                TransportEvent::Unsubscribed {
                    central,
                    characteristic: characteristic.uuid,
                }
            });
        });
        Ok(())
    }

    fn write(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.record(Command::Write {
            peer: peer.clone(),
            characteristic: characteristic.uuid,
            value: value.to_vec(),
            write_type,
        })?;
        self.with_air(Role::Central, |air| {
            if air.connected {
                air.post_peripheral(TransportEvent::WriteReceived {
                    requests: vec![WriteRequest {
                        central: air.central_id.clone(),
                        characteristic: characteristic.uuid,
                        value: value.to_vec(),
                    }],
                });
            }
        });
        Ok(())
    }

    fn publish_service(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        self.record(Command::PublishService {
            service: descriptor.service_uuid,
            characteristic: descriptor.characteristic_uuid,
        })?;
        self.with_air(Role::Peripheral, |air| {
            air.published = Some(descriptor.clone());
        });
        Ok(())
    }

    fn remove_all_services(&self) -> Result<()> {
        self.record(Command::RemoveAllServices)?;
        self.with_air(Role::Peripheral, |air| air.published = None);
        Ok(())
    }

    fn advertise(&self, advertisement: &Advertisement) -> Result<()> {
        self.record(Command::Advertise(advertisement.clone()))?;
        self.with_air(Role::Peripheral, |air| {
            air.advertisement = Some(advertisement.clone());
            air.post_peripheral(TransportEvent::AdvertisingStarted { error: None });
        });
        Ok(())
    }

    fn push_notification(
        &self,
        characteristic: Uuid,
        value: &[u8],
        subscribers: &[PeerId],
    ) -> bool {
        let accepted = self.inner.lock().accept_notifications;
        if self
            .record(Command::PushNotification {
                characteristic,
                value: value.to_vec(),
                subscribers: subscribers.to_vec(),
                accepted,
            })
            .is_err()
        {
            return false;
        }
        if accepted {
            self.with_air(Role::Peripheral, |air| {
                if air.subscribed && subscribers.contains(&air.central_id) {
                    air.post_central(TransportEvent::ValueUpdated {
                        peer: air.peripheral_id.clone(),
                        characteristic,
                        value: value.to_vec(),
                        error: None,
                    });
                }
            });
        }
        accepted
    }
}
