//! Scanner-role transport over `btleplug`.
//!
//! Every command is spawned on the runtime the transport was created on and
//! reports its outcome as a [`TransportEvent`]. Adapter events (discovery,
//! disconnects, radio state) are translated by a background task.
//!
//! `btleplug` only implements the central role, so the advertiser commands
//! fail with [`Error::NotSupported`].

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::transport::{
    CharacteristicHandle, PeerId, Transport, TransportEvent, TransportState,
};
use crate::ble::uuids::ServiceDescriptor;
use crate::dispatcher::EventSink;
use crate::error::{Error, Result};

/// Map the adapter's power state.
pub fn transport_state(state: CentralState) -> TransportState {
    match state {
        CentralState::PoweredOn => TransportState::PoweredOn,
        CentralState::PoweredOff => TransportState::PoweredOff,
        CentralState::Unknown => TransportState::Unknown,
    }
}

/// Build an [`Advertisement`] from cached peripheral properties.
pub fn advertisement_from(properties: &PeripheralProperties) -> Advertisement {
    Advertisement {
        local_name: properties.local_name.clone(),
        service_uuids: properties.services.clone(),
    }
}

fn peer_id(id: &PeripheralId) -> PeerId {
    PeerId::new(id.to_string())
}

struct Inner {
    adapter: Adapter,
    sink: EventSink,
    state: RwLock<TransportState>,
    /// Peripherals seen by the adapter.
    peripherals: RwLock<HashMap<PeerId, Peripheral>>,
    /// Service UUIDs each peripheral advertised.
    advertised: RwLock<HashMap<PeerId, Vec<Uuid>>>,
    connected: RwLock<HashSet<PeerId>>,
    /// Peers reported since the current scan started.
    reported: RwLock<HashSet<PeerId>>,
    allow_duplicates: AtomicBool,
    connecting: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    listeners: Mutex<HashMap<PeerId, JoinHandle<()>>>,
}

impl Inner {
    fn post(&self, event: TransportEvent) {
        if !self.sink.post(event) {
            trace!("Event sink closed, dropping transport event");
        }
    }

    fn peripheral(&self, peer: &PeerId) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound {
                identifier: peer.to_string(),
            })
    }

    fn stop_listener(&self, peer: &PeerId) {
        if let Some(handle) = self.listeners.lock().remove(peer) {
            handle.abort();
        }
    }

    /// Mark `peer` disconnected. Returns `false` if it already was.
    fn drop_connection(&self, peer: &PeerId) -> bool {
        self.stop_listener(peer);
        self.connected.write().remove(peer)
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                self.process_peripheral(&id).await;
            }
            CentralEvent::DeviceUpdated(id) => {
                trace!("Device updated: {:?}", id);
                self.process_peripheral(&id).await;
            }
            CentralEvent::ServicesAdvertisement { id, services } => {
                trace!("Device {:?} advertised {} services", id, services.len());
                self.advertised.write().insert(peer_id(&id), services);
                self.process_peripheral(&id).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let peer = peer_id(&id);
                if self.drop_connection(&peer) {
                    self.post(TransportEvent::Disconnected {
                        peer,
                        error: Some("connection lost".to_string()),
                    });
                }
            }
            CentralEvent::StateUpdate(state) => {
                let state = transport_state(state);
                info!("Bluetooth adapter state: {}", state);
                *self.state.write() = state;
                self.post(TransportEvent::StateChanged(state));
            }
            CentralEvent::ManufacturerDataAdvertisement { .. } => {}
            CentralEvent::ServiceDataAdvertisement { .. } => {}
        }
    }

    async fn process_peripheral(&self, id: &PeripheralId) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let peer = peer_id(id);
        self.peripherals.write().insert(peer.clone(), peripheral);
        if !properties.services.is_empty() {
            self.advertised
                .write()
                .insert(peer.clone(), properties.services.clone());
        }

        // No signal strength means the peripheral is cached, not in range.
        let Some(rssi) = properties.rssi else {
            return;
        };

        if !self.allow_duplicates.load(Ordering::SeqCst)
            && !self.reported.write().insert(peer.clone())
        {
            return;
        }

        self.post(TransportEvent::Discovered {
            peer,
            advertisement: advertisement_from(&properties),
            rssi,
        });
    }
}

/// Transport backed by the first Bluetooth adapter on the host.
pub struct BtleplugTransport {
    inner: Arc<Inner>,
    runtime: Handle,
    event_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start translating its events.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(sink: EventSink) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::TransportUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::TransportUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, Handle::current(), sink))
    }

    /// Create a transport over a specific adapter, spawning work on `runtime`.
    pub fn with_adapter(adapter: Adapter, runtime: Handle, sink: EventSink) -> Self {
        let inner = Arc::new(Inner {
            adapter,
            sink,
            state: RwLock::new(TransportState::PoweredOn),
            peripherals: RwLock::new(HashMap::new()),
            advertised: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashSet::new()),
            reported: RwLock::new(HashSet::new()),
            allow_duplicates: AtomicBool::new(false),
            connecting: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        });

        let events_inner = inner.clone();
        let event_handle = runtime.spawn(async move {
            let mut events = match events_inner.adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                events_inner.handle_central_event(event).await;
            }

            debug!("Adapter event loop ended");
        });

        Self {
            inner,
            runtime,
            event_handle: Mutex::new(Some(event_handle)),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.inner.adapter
    }

    fn find_characteristic(
        &self,
        peripheral: &Peripheral,
        handle: &CharacteristicHandle,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service_uuid)
            .ok_or_else(|| {
                Error::Internal(format!("characteristic {} not discovered", handle.uuid))
            })
    }

    fn start_listener(inner: &Arc<Inner>, runtime: &Handle, peer: PeerId, peripheral: Peripheral) {
        let listener_inner = inner.clone();
        let listener_peer = peer.clone();
        let handle = runtime.spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {} on {}: {} bytes",
                    listener_peer,
                    notification.uuid,
                    notification.value.len()
                );
                listener_inner.post(TransportEvent::ValueUpdated {
                    peer: listener_peer.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                    error: None,
                });
            }

            debug!("Notification listener for {} stopped", listener_peer);
        });

        if let Some(previous) = inner.listeners.lock().insert(peer, handle) {
            previous.abort();
        }
    }

    fn not_supported(operation: &str) -> Error {
        Error::NotSupported {
            operation: format!("{} (btleplug supports the central role only)", operation),
        }
    }
}

impl Transport for BtleplugTransport {
    fn state(&self) -> TransportState {
        *self.inner.state.read()
    }

    fn retrieve_connected(&self, service: Uuid) -> Vec<PeerId> {
        let advertised = self.inner.advertised.read();
        let mut peers: Vec<PeerId> = self
            .inner
            .connected
            .read()
            .iter()
            .filter(|peer| {
                advertised
                    .get(*peer)
                    .map_or(false, |services| services.contains(&service))
            })
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    fn scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
        self.inner
            .allow_duplicates
            .store(allow_duplicates, Ordering::SeqCst);
        self.inner.reported.write().clear();

        let inner = self.inner.clone();
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.runtime.spawn(async move {
            match inner.adapter.start_scan(filter).await {
                Ok(()) => debug!("BLE scan started"),
                Err(e) => error!("Failed to start scan: {}", e),
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.runtime.spawn(async move {
            if let Err(e) = inner.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&self, peer: &PeerId) -> Result<()> {
        let peripheral = self.inner.peripheral(peer)?;

        let inner = self.inner.clone();
        let runtime = self.runtime.clone();
        let peer = peer.clone();
        let task_peer = peer.clone();
        let handle = self.runtime.spawn(async move {
            let result = if peripheral.is_connected().await.unwrap_or(false) {
                info!("Peripheral {} already connected at BLE level", task_peer);
                Ok(())
            } else {
                peripheral.connect().await
            };

            inner.connecting.lock().remove(&task_peer);
            match result {
                Ok(()) => {
                    inner.connected.write().insert(task_peer.clone());
                    Self::start_listener(&inner, &runtime, task_peer.clone(), peripheral);
                    inner.post(TransportEvent::Connected { peer: task_peer });
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", task_peer, e);
                    inner.post(TransportEvent::ConnectFailed {
                        peer: task_peer,
                        error: e.to_string(),
                    });
                }
            }
        });

        if let Some(previous) = self.inner.connecting.lock().insert(peer, handle) {
            previous.abort();
        }
        Ok(())
    }

    fn disconnect(&self, peer: &PeerId) -> Result<()> {
        let peripheral = self.inner.peripheral(peer)?;

        let was_connecting = match self.inner.connecting.lock().remove(peer) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };

        let inner = self.inner.clone();
        let peer = peer.clone();
        self.runtime.spawn(async move {
            let error = match peripheral.disconnect().await {
                Ok(()) => None,
                Err(e) => {
                    warn!("Failed to disconnect from {}: {}", peer, e);
                    Some(e.to_string())
                }
            };

            if inner.drop_connection(&peer) || was_connecting {
                inner.post(TransportEvent::Disconnected { peer, error });
            }
        });
        Ok(())
    }

    fn discover_services(&self, peer: &PeerId, services: &[Uuid]) -> Result<()> {
        let peripheral = self.inner.peripheral(peer)?;

        let inner = self.inner.clone();
        let peer = peer.clone();
        let wanted = services.to_vec();
        self.runtime.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let found: Vec<Uuid> = peripheral
                        .services()
                        .iter()
                        .map(|service| service.uuid)
                        .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
                        .collect();
                    debug!("Discovered {} matching services on {}", found.len(), peer);
                    TransportEvent::ServicesFound {
                        peer,
                        services: found,
                        error: None,
                    }
                }
                Err(e) => TransportEvent::ServicesFound {
                    peer,
                    services: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            inner.post(event);
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        peer: &PeerId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let peripheral = self.inner.peripheral(peer)?;

        // btleplug resolves characteristics together with services.
        let event = match peripheral.services().into_iter().find(|s| s.uuid == service) {
            Some(found) => {
                let handles: Vec<CharacteristicHandle> = found
                    .characteristics
                    .into_iter()
                    .filter(|c| characteristics.is_empty() || characteristics.contains(&c.uuid))
                    .map(|c| CharacteristicHandle::new(c.uuid, c.service_uuid, c.properties))
                    .collect();
                debug!(
                    "Found {} matching characteristics in service {}",
                    handles.len(),
                    service
                );
                TransportEvent::CharacteristicsFound {
                    peer: peer.clone(),
                    service,
                    characteristics: handles,
                    error: None,
                }
            }
            None => TransportEvent::CharacteristicsFound {
                peer: peer.clone(),
                service,
                characteristics: Vec::new(),
                error: Some(format!("service {} not discovered", service)),
            },
        };
        self.inner.post(event);
        Ok(())
    }

    fn set_notify(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<()> {
        let peripheral = self.inner.peripheral(peer)?;
        let target = self.find_characteristic(&peripheral, characteristic)?;

        let inner = self.inner.clone();
        let peer = peer.clone();
        self.runtime.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };

            let event = match result {
                Ok(()) => {
                    debug!(
                        "Notifications {} on {}",
                        if enabled { "enabled" } else { "disabled" },
                        target.uuid
                    );
                    TransportEvent::NotifyStateChanged {
                        peer,
                        characteristic: target.uuid,
                        enabled,
                        error: None,
                    }
                }
                Err(e) => TransportEvent::NotifyStateChanged {
                    peer,
                    characteristic: target.uuid,
                    enabled: !enabled,
                    error: Some(e.to_string()),
                },
            };
            inner.post(event);
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
        let peripheral = self.inner.peripheral(peer)?;
        let target = self.find_characteristic(&peripheral, characteristic)?;

        let value = value.to_vec();
        self.runtime.spawn(async move {
            match peripheral.write(&target, &value, write_type).await {
                Ok(()) => trace!("Wrote {} bytes to characteristic {}", value.len(), target.uuid),
                Err(e) => warn!("Write to {} failed: {}", target.uuid, e),
            }
        });
        Ok(())
    }

    fn publish_service(&self, _descriptor: &ServiceDescriptor) -> Result<()> {
        Err(Self::not_supported("publish_service"))
    }

    fn remove_all_services(&self) -> Result<()> {
        Err(Self::not_supported("remove_all_services"))
    }

    fn advertise(&self, _advertisement: &Advertisement) -> Result<()> {
        Err(Self::not_supported("advertise"))
    }

    fn push_notification(
        &self,
        characteristic: Uuid,
        _value: &[u8],
        _subscribers: &[PeerId],
    ) -> bool {
        warn!(
            "Cannot notify on {}: btleplug supports the central role only",
            characteristic
        );
        false
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.event_handle.lock().take() {
            handle.abort();
        }
        for (_, handle) in self.inner.connecting.lock().drain() {
            handle.abort();
        }
        for (_, handle) in self.inner.listeners.lock().drain() {
            handle.abort();
        }
    }
}
