//! Scanner controller.
//!
//! Finds an advertiser exposing the transfer service, walks the session
//! through connection, discovery and subscription, and then exchanges
//! requests and responses with it. At most one session exists at a time;
//! once it ends the scanner goes back to discovery for as long as scanning
//! is wanted.

use btleplug::api::WriteType;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::session::{PeerSession, SessionState};
use crate::ble::transport::{
    CharacteristicHandle, PeerId, RestoredPeripheral, Transport, TransportEvent, TransportState,
};
use crate::ble::uuids::ServiceDescriptor;
use crate::config::ScannerConfig;
use crate::dispatcher::EventHandler;
use crate::error::{Error, ErrorKind, Result};
use crate::observer::{LinkEvent, Notifier};
use crate::protocol::{decode, Direction, Message, MessageKind};

#[derive(Debug, Default)]
struct ScannerState {
    /// Scanning was requested and not stopped.
    wants_scanning: bool,
    /// A scan command is active on the transport.
    is_scanning: bool,
    session: Option<PeerSession>,
}

impl ScannerState {
    fn session_for(&mut self, peer: &PeerId) -> Option<&mut PeerSession> {
        self.session.as_mut().filter(|session| session.is_peer(peer))
    }

    fn session_in(&self, peer: &PeerId, state: SessionState) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| session.is_peer(peer) && session.state() == state)
    }
}

/// Scanner-role controller.
///
/// Feed it transport events through an [`EventDispatcher`](crate::EventDispatcher);
/// the public operations may be called from any thread.
pub struct Scanner {
    transport: Arc<dyn Transport>,
    descriptor: Arc<ServiceDescriptor>,
    config: ScannerConfig,
    notifier: Notifier,
    state: Mutex<ScannerState>,
}

impl Scanner {
    /// Create a scanner. Nothing happens until [`Scanner::start_scanning`].
    pub fn new(
        transport: Arc<dyn Transport>,
        descriptor: ServiceDescriptor,
        config: ScannerConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            transport,
            descriptor: Arc::new(descriptor),
            config,
            notifier,
            state: Mutex::new(ScannerState::default()),
        }
    }

    /// Start looking for an advertiser.
    ///
    /// Only records the request while already scanning or while a session
    /// exists; scanning then resumes once that session ends. When the radio
    /// is not powered on, observers get [`ErrorKind::TransportUnavailable`]
    /// and scanning starts on the next power-on.
    pub fn start_scanning(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.wants_scanning = true;

        if state.is_scanning || state.session.is_some() {
            debug!("Already scanning or connected, start request recorded");
            return Ok(());
        }

        let radio = self.transport.state();
        if !radio.is_ready() {
            warn!("Transport is {}, scanning deferred until powered on", radio);
            self.notifier
                .notify(LinkEvent::Error(ErrorKind::TransportUnavailable));
            return Ok(());
        }

        self.begin(&mut state)
    }

    /// Write a request to the connected advertiser.
    ///
    /// Fails with [`Error::SendFailed`] when the session is not ready or the
    /// transport refuses the command. `Ok` only means the write was
    /// handed to the transport: [`BtleplugTransport`](crate::ble::BtleplugTransport)
    /// performs it in the background and a write the radio later rejects is
    /// logged, not reported back to the caller.
    pub fn send_request(&self, kind: MessageKind) -> Result<()> {
        let state = self.state.lock();

        let session = state
            .session
            .as_ref()
            .filter(|session| session.state().is_ready())
            .ok_or_else(|| Error::send_failed("no ready session"))?;
        let characteristic = session
            .characteristic()
            .ok_or_else(|| Error::send_failed("transfer characteristic not discovered"))?;

        let message = Message::Request(kind);
        let payload = message.encode();
        self.transport
            .write(
                session.peer(),
                characteristic,
                &payload,
                WriteType::WithoutResponse,
            )
            .map_err(|e| Error::send_failed(e.to_string()))?;

        debug!("Sent {} to {} ({} bytes)", message, session.peer(), payload.len());
        Ok(())
    }

    /// Abandon a connection attempt that has not completed.
    ///
    /// Only valid while the session is `Connecting`. The session ends when
    /// the transport confirms the disconnect, after which scanning resumes.
    pub fn cancel_connect(&self) -> Result<()> {
        let mut state = self.state.lock();

        let session = state.session.as_mut().ok_or(Error::NotConnected)?;
        if session.state() != SessionState::Connecting {
            return Err(Error::InvalidTransition {
                from: session.state(),
                to: SessionState::Disconnecting,
            });
        }

        info!("Cancelling connection to {}", session.peer());
        session.transition(SessionState::Disconnecting)?;
        self.notify_state(session);

        let peer = session.peer().clone();
        if let Err(e) = self.transport.disconnect(&peer) {
            error!("Failed to cancel connection to {}: {}", peer, e);
            self.discard(&mut state);
            self.resume(&mut state);
            return Err(e);
        }

        Ok(())
    }

    /// Stop scanning and tear down any session. Scanning does not resume.
    pub fn stop_scanning(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.wants_scanning = false;

        let stopped = if state.is_scanning {
            state.is_scanning = false;
            self.transport.stop_scan()
        } else {
            Ok(())
        };

        self.cleanup(&mut state);

        stopped?;
        info!("Scanning stopped");
        Ok(())
    }

    /// Check if a scan is active on the transport.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().is_scanning
    }

    /// State of the current session, if any.
    pub fn session_state(&self) -> Option<SessionState> {
        self.state.lock().session.as_ref().map(PeerSession::state)
    }

    /// Peer of the current session, if any.
    pub fn session_peer(&self) -> Option<PeerId> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|session| session.peer().clone())
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> Option<PeerSession> {
        self.state.lock().session.clone()
    }

    /// Scanner settings.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// The service this scanner looks for.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Force a session that stalled mid-handshake to disconnect.
    ///
    /// Does nothing unless a handshake timeout is configured.
    pub fn check_handshake_timeout(&self, now: Instant) {
        let Some(timeout) = self.config.handshake_timeout else {
            return;
        };

        let mut state = self.state.lock();
        let stalled = state.session.as_ref().filter(|session| {
            session.state().is_handshaking()
                && now.saturating_duration_since(session.entered_at()) >= timeout
        });

        if let Some(session) = stalled {
            warn!(
                "Session {} stalled in {} for over {:?}",
                session.peer(),
                session.state(),
                timeout
            );
            self.fail(&mut state, ErrorKind::HandshakeTimeout);
        }
    }

    /// Reconnect to a known peer, or scan for a new one.
    fn begin(&self, state: &mut ScannerState) -> Result<()> {
        let service = self.descriptor.service_uuid;
        let connected = self.transport.retrieve_connected(service);
        debug!("Found {} connected peers with transfer service", connected.len());

        let mut reconnecting = false;
        if let Some(peer) = connected.last() {
            info!("Connecting to already-connected peer {}", peer);
            let session = PeerSession::discovered(peer.clone(), self.descriptor.clone(), None);
            reconnecting = self.connect_session(state, session);
        }

        if !reconnecting {
            self.transport
                .scan(&[service], self.config.allow_duplicates)?;
            state.is_scanning = true;
            info!("Scanning started for service {}", service);
        }

        self.notifier.notify(LinkEvent::ScanningStarted);
        Ok(())
    }

    /// Go back to discovery if scanning is still wanted.
    fn resume(&self, state: &mut ScannerState) {
        if !state.wants_scanning || state.session.is_some() {
            return;
        }

        let radio = self.transport.state();
        if !radio.is_ready() {
            debug!("Transport is {}, re-scan deferred", radio);
            return;
        }

        if let Err(e) = self.begin(state) {
            error!("Failed to restart scanning: {}", e);
        }
    }

    /// Adopt `session` and issue the connect command. Returns `false` if the
    /// command failed and the session was dropped.
    fn connect_session(&self, state: &mut ScannerState, mut session: PeerSession) -> bool {
        if session.transition(SessionState::Connecting).is_err() {
            return false;
        }
        self.notify_state(&session);

        let peer = session.peer().clone();
        state.session = Some(session);

        if let Err(e) = self.transport.connect(&peer) {
            warn!("Failed to connect to {}: {}", peer, e);
            self.notifier.notify(LinkEvent::Error(ErrorKind::ConnectFailed));
            self.discard(state);
            return false;
        }

        debug!("Connecting to {}", peer);
        true
    }

    /// Report `kind` and tear the session down.
    fn fail(&self, state: &mut ScannerState, kind: ErrorKind) {
        if let Some(session) = &state.session {
            warn!(
                "Session {} failed in state {}: {}",
                session.peer(),
                session.state(),
                kind
            );
        }
        self.notifier.notify(LinkEvent::Error(kind));
        self.cleanup(state);
    }

    /// Unsubscribe if subscribed, then disconnect.
    ///
    /// The session stays in `Disconnecting` until the transport reports the
    /// disconnect. A session that never reached the transport is dropped at once.
    fn cleanup(&self, state: &mut ScannerState) {
        let Some(session) = state.session.as_mut() else {
            return;
        };

        match session.state() {
            SessionState::Disconnecting | SessionState::Disconnected => {}
            SessionState::Discovered => self.discard(state),
            _ => {
                if session.transition(SessionState::Disconnecting).is_err() {
                    return;
                }
                self.notify_state(session);

                let peer = session.peer().clone();
                if let (true, Some(characteristic)) =
                    (session.is_subscribed(), session.characteristic())
                {
                    if let Err(e) = self.transport.set_notify(&peer, characteristic, false) {
                        warn!("Failed to unsubscribe from {}: {}", peer, e);
                    }
                }

                if let Err(e) = self.transport.disconnect(&peer) {
                    error!("Failed to disconnect from {}: {}", peer, e);
                    self.discard(state);
                    self.resume(state);
                }
            }
        }
    }

    /// End the session without issuing further commands.
    fn discard(&self, state: &mut ScannerState) {
        if let Some(mut session) = state.session.take() {
            if !session.state().is_terminal()
                && session.transition(SessionState::Disconnected).is_ok()
            {
                self.notify_state(&session);
            }
            debug!("Session for {} discarded", session.peer());
        }
    }

    fn notify_state(&self, session: &PeerSession) {
        self.notifier.notify(LinkEvent::StateChanged {
            peer: session.peer().clone(),
            state: session.state(),
        });
    }

    /// Move the session to `next` and report it.
    fn advance(&self, session: &mut PeerSession, next: SessionState) -> bool {
        let advanced = session.transition(next).is_ok();
        if advanced {
            self.notify_state(session);
        }
        advanced
    }

    fn discover_services(&self, state: &mut ScannerState, peer: &PeerId) {
        let services = [self.descriptor.service_uuid];
        if let Err(e) = self.transport.discover_services(peer, &services) {
            error!("Failed to start service discovery on {}: {}", peer, e);
            self.fail(state, ErrorKind::ServiceDiscoveryFailed);
        }
    }

    fn on_transport_state(&self, state: &mut ScannerState, radio: TransportState) {
        match radio {
            TransportState::PoweredOn => {
                info!("Transport powered on");
                if state.wants_scanning && !state.is_scanning && state.session.is_none() {
                    if let Err(e) = self.begin(state) {
                        error!("Failed to start scanning: {}", e);
                    }
                }
            }
            TransportState::Unknown | TransportState::Resetting => {
                debug!("Transport state is {}", radio);
            }
            TransportState::PoweredOff
            | TransportState::Unauthorized
            | TransportState::Unsupported => {
                match radio {
                    TransportState::Unauthorized => {
                        warn!("Not authorized to use Bluetooth")
                    }
                    TransportState::Unsupported => {
                        warn!("Bluetooth is not supported on this device")
                    }
                    _ => warn!("Bluetooth is powered off"),
                }

                // The radio drops every scan and link with it.
                state.is_scanning = false;
                self.discard(state);
                if state.wants_scanning {
                    self.notifier
                        .notify(LinkEvent::Error(ErrorKind::TransportUnavailable));
                }
            }
        }
    }

    fn on_discovered(
        &self,
        state: &mut ScannerState,
        peer: PeerId,
        advertisement: Advertisement,
        rssi: i16,
    ) {
        if let Some(session) = &state.session {
            trace!(
                "Ignoring discovery of {}, session with {} active",
                peer,
                session.peer()
            );
            return;
        }

        if !state.wants_scanning {
            trace!("Ignoring discovery of {}, scanning not wanted", peer);
            return;
        }

        if !advertisement.matches(&self.descriptor) {
            trace!("Ignoring {}, transfer service not advertised", peer);
            return;
        }

        if !self.config.accepts_rssi(rssi) {
            debug!("Discovered {} not in expected range, at {} dBm", peer, rssi);
            return;
        }

        info!(
            "Discovered {} ({}) at {} dBm",
            peer,
            advertisement.local_name.as_deref().unwrap_or("unnamed"),
            rssi
        );

        let session = PeerSession::discovered(peer, self.descriptor.clone(), Some(rssi));
        self.connect_session(state, session);
    }

    fn on_connected(&self, state: &mut ScannerState, peer: PeerId) {
        let Some(session) = state.session_for(&peer) else {
            trace!("Ignoring connection of unknown peer {}", peer);
            return;
        };

        if !self.advance(session, SessionState::Connected) {
            return;
        }
        info!("Connected to {}", peer);
        self.notifier.notify(LinkEvent::Connected { peer: peer.clone() });

        if state.is_scanning {
            state.is_scanning = false;
            match self.transport.stop_scan() {
                Ok(()) => debug!("Scanning stopped"),
                Err(e) => warn!("Failed to stop scanning: {}", e),
            }
        }

        if let Some(session) = state.session_for(&peer) {
            if self.advance(session, SessionState::DiscoveringServices) {
                self.discover_services(state, &peer);
            }
        }
    }

    fn on_connect_failed(&self, state: &mut ScannerState, peer: PeerId, reason: String) {
        if state.session_for(&peer).is_none() {
            return;
        }

        warn!("Failed to connect to {}: {}", peer, reason);
        self.notifier.notify(LinkEvent::Error(ErrorKind::ConnectFailed));
        self.discard(state);
        self.resume(state);
    }

    fn on_disconnected(&self, state: &mut ScannerState, peer: PeerId, reason: Option<String>) {
        if state.session_for(&peer).is_none() {
            trace!("Ignoring disconnect of unknown peer {}", peer);
            return;
        }

        match reason {
            Some(reason) => warn!("Peer {} disconnected: {}", peer, reason),
            None => info!("Peer {} disconnected", peer),
        }

        self.discard(state);
        self.resume(state);
    }

    fn on_services_found(
        &self,
        state: &mut ScannerState,
        peer: PeerId,
        services: Vec<Uuid>,
        reason: Option<String>,
    ) {
        if !state.session_in(&peer, SessionState::DiscoveringServices) {
            return;
        }

        if let Some(reason) = reason {
            warn!("Error discovering services on {}: {}", peer, reason);
            self.fail(state, ErrorKind::ServiceDiscoveryFailed);
            return;
        }

        if !services.iter().any(|uuid| self.descriptor.is_service(uuid)) {
            warn!("Transfer service not found on {}", peer);
            self.fail(state, ErrorKind::ServiceDiscoveryFailed);
            return;
        }

        let Some(session) = state.session_for(&peer) else {
            return;
        };
        if !self.advance(session, SessionState::DiscoveringCharacteristics) {
            return;
        }

        let service = self.descriptor.service_uuid;
        let characteristics = [self.descriptor.characteristic_uuid];
        if let Err(e) = self
            .transport
            .discover_characteristics(&peer, service, &characteristics)
        {
            error!("Failed to start characteristic discovery on {}: {}", peer, e);
            self.fail(state, ErrorKind::CharacteristicDiscoveryFailed);
        }
    }

    fn on_services_invalidated(&self, state: &mut ScannerState, peer: PeerId, services: Vec<Uuid>) {
        if !services.iter().any(|uuid| self.descriptor.is_service(uuid)) {
            return;
        }

        let Some(session) = state.session_for(&peer) else {
            return;
        };
        if !session.state().is_ready() {
            debug!(
                "Transfer service invalidated on {} during {}",
                peer,
                session.state()
            );
            return;
        }

        info!("Transfer service invalidated on {}, rediscovering services", peer);
        if self.advance(session, SessionState::DiscoveringServices) {
            self.discover_services(state, &peer);
        }
    }

    fn on_characteristics_found(
        &self,
        state: &mut ScannerState,
        peer: PeerId,
        service: Uuid,
        characteristics: Vec<CharacteristicHandle>,
        reason: Option<String>,
    ) {
        if !self.descriptor.is_service(&service)
            || !state.session_in(&peer, SessionState::DiscoveringCharacteristics)
        {
            return;
        }

        if let Some(reason) = reason {
            warn!("Error discovering characteristics on {}: {}", peer, reason);
            self.fail(state, ErrorKind::CharacteristicDiscoveryFailed);
            return;
        }

        let Some(characteristic) = characteristics
            .into_iter()
            .find(|handle| self.descriptor.is_characteristic(&handle.uuid))
        else {
            warn!("Transfer characteristic not found on {}", peer);
            self.fail(state, ErrorKind::CharacteristicDiscoveryFailed);
            return;
        };

        let Some(session) = state.session_for(&peer) else {
            return;
        };
        session.set_characteristic(characteristic.clone());
        if !self.advance(session, SessionState::Subscribing) {
            return;
        }

        if let Err(e) = self.transport.set_notify(&peer, &characteristic, true) {
            error!("Failed to subscribe on {}: {}", peer, e);
            self.fail(state, ErrorKind::SubscriptionFailed);
        }
    }

    fn on_notify_state_changed(
        &self,
        state: &mut ScannerState,
        peer: PeerId,
        characteristic: Uuid,
        enabled: bool,
        reason: Option<String>,
    ) {
        if !self.descriptor.is_characteristic(&characteristic) {
            return;
        }
        let Some(session) = state.session_for(&peer) else {
            return;
        };

        match (session.state(), reason, enabled) {
            (SessionState::Subscribing, Some(reason), _) => {
                warn!("Error changing notification state on {}: {}", peer, reason);
                self.fail(state, ErrorKind::SubscriptionFailed);
            }
            (SessionState::Subscribing, None, true) => {
                if self.advance(session, SessionState::Ready) {
                    info!("Notification began on {}", peer);
                }
            }
            (SessionState::Subscribing, None, false) => {
                warn!("Notifications not enabled on {}", peer);
                self.fail(state, ErrorKind::SubscriptionFailed);
            }
            (SessionState::Ready, Some(reason), _) => {
                warn!("Error changing notification state on {}: {}", peer, reason);
            }
            (SessionState::Ready, None, false) => {
                info!("Notification stopped on {}, disconnecting", peer);
                session.clear_subscription();
                self.fail(state, ErrorKind::SubscriptionFailed);
            }
            (current, _, enabled) => {
                trace!(
                    "Ignoring notification state {} on {} during {}",
                    enabled,
                    peer,
                    current
                );
            }
        }
    }

    fn on_value_updated(
        &self,
        state: &mut ScannerState,
        peer: PeerId,
        characteristic: Uuid,
        value: Vec<u8>,
        reason: Option<String>,
    ) {
        if !self.descriptor.is_characteristic(&characteristic)
            || !state.session_in(&peer, SessionState::Ready)
        {
            return;
        }

        if let Some(reason) = reason {
            warn!("Error receiving value from {}: {}", peer, reason);
            self.fail(state, ErrorKind::ReceiveFailed);
            return;
        }

        match decode(&value, Direction::Response) {
            Ok(message) => {
                info!("Received {} from {} ({} bytes)", message, peer, value.len());
                self.notifier.notify(LinkEvent::MessageReceived(message));
            }
            Err(e) => debug!("Dropping {} bytes from {}: {}", value.len(), peer, e),
        }
    }

    fn on_restored(&self, state: &mut ScannerState, peripherals: Vec<RestoredPeripheral>) {
        if state.session.is_some() {
            debug!("Ignoring restored peripherals, session already active");
            return;
        }

        let Some(restored) = peripherals.into_iter().next() else {
            return;
        };

        state.wants_scanning = true;
        let peer = restored.peer.clone();
        let characteristic = restored
            .characteristic
            .filter(|handle| self.descriptor.is_characteristic(&handle.uuid));

        match characteristic {
            Some(handle) if restored.notifying => {
                info!("Restored subscribed peer {}", peer);
                let session = PeerSession::rehydrate(
                    peer.clone(),
                    self.descriptor.clone(),
                    SessionState::Ready,
                    Some(handle),
                );
                self.notify_state(&session);
                state.session = Some(session);
                self.notifier.notify(LinkEvent::Connected { peer });
            }
            _ => {
                info!("Restored peer {}, rediscovering services", peer);
                let mut session = PeerSession::rehydrate(
                    peer.clone(),
                    self.descriptor.clone(),
                    SessionState::Connected,
                    None,
                );
                self.notify_state(&session);
                self.notifier.notify(LinkEvent::Connected { peer: peer.clone() });
                if self.advance(&mut session, SessionState::DiscoveringServices) {
                    state.session = Some(session);
                    self.discover_services(state, &peer);
                }
            }
        }
    }
}

impl EventHandler for Scanner {
    fn handle_event(&self, event: TransportEvent) {
        let mut state = self.state.lock();
        let state = &mut *state;

        match event {
            TransportEvent::StateChanged(radio) => self.on_transport_state(state, radio),
            TransportEvent::Discovered {
                peer,
                advertisement,
                rssi,
            } => self.on_discovered(state, peer, advertisement, rssi),
            TransportEvent::Connected { peer } => self.on_connected(state, peer),
            TransportEvent::ConnectFailed { peer, error } => {
                self.on_connect_failed(state, peer, error)
            }
            TransportEvent::Disconnected { peer, error } => {
                self.on_disconnected(state, peer, error)
            }
            TransportEvent::ServicesFound {
                peer,
                services,
                error,
            } => self.on_services_found(state, peer, services, error),
            TransportEvent::ServicesInvalidated { peer, services } => {
                self.on_services_invalidated(state, peer, services)
            }
            TransportEvent::CharacteristicsFound {
                peer,
                service,
                characteristics,
                error,
            } => self.on_characteristics_found(state, peer, service, characteristics, error),
            TransportEvent::NotifyStateChanged {
                peer,
                characteristic,
                enabled,
                error,
            } => self.on_notify_state_changed(state, peer, characteristic, enabled, error),
            TransportEvent::ValueUpdated {
                peer,
                characteristic,
                value,
                error,
            } => self.on_value_updated(state, peer, characteristic, value, error),
            TransportEvent::CentralRestored { peripherals } => self.on_restored(state, peripherals),
            other => trace!("Scanner ignoring {} event", other.name()),
        }
    }

    fn on_tick(&self, now: Instant) {
        self.check_handshake_timeout(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{Command, SimulatedTransport};
    use crate::ble::transport::MockTransport;
    use crate::ble::uuids::{TRANSFER_CHARACTERISTIC_UUID, TRANSFER_SERVICE_UUID};
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn peer() -> PeerId {
        PeerId::from("advertiser-1")
    }

    fn advertisement() -> Advertisement {
        Advertisement::for_service(&ServiceDescriptor::default(), Some("airkeyfc61"))
    }

    fn handle() -> CharacteristicHandle {
        CharacteristicHandle::for_descriptor(&ServiceDescriptor::default())
    }

    fn scanner_with(
        transport: Arc<dyn Transport>,
        config: ScannerConfig,
    ) -> (Scanner, UnboundedReceiver<LinkEvent>) {
        let (notifier, rx) = Notifier::channel();
        let scanner = Scanner::new(transport, ServiceDescriptor::default(), config, notifier);
        (scanner, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn discovered(rssi: i16) -> TransportEvent {
        TransportEvent::Discovered {
            peer: peer(),
            advertisement: advertisement(),
            rssi,
        }
    }

    /// Drive a scanner on a simulated transport to `Ready`.
    fn ready_scanner() -> (Scanner, Arc<SimulatedTransport>, UnboundedReceiver<LinkEvent>) {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());

        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));
        scanner.handle_event(TransportEvent::Connected { peer: peer() });
        scanner.handle_event(TransportEvent::ServicesFound {
            peer: peer(),
            services: vec![TRANSFER_SERVICE_UUID],
            error: None,
        });
        scanner.handle_event(TransportEvent::CharacteristicsFound {
            peer: peer(),
            service: TRANSFER_SERVICE_UUID,
            characteristics: vec![handle()],
            error: None,
        });
        scanner.handle_event(TransportEvent::NotifyStateChanged {
            peer: peer(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            enabled: true,
            error: None,
        });
        assert_eq!(scanner.session_state(), Some(SessionState::Ready));

        transport.take_commands();
        drain(&mut rx);
        (scanner, transport, rx)
    }

    #[test]
    fn test_start_scans_for_service() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());

        scanner.start_scanning().unwrap();
        assert!(scanner.is_scanning());
        assert_eq!(
            transport.commands(),
            vec![Command::Scan {
                services: vec![TRANSFER_SERVICE_UUID],
                allow_duplicates: false,
            }]
        );
        assert_eq!(drain(&mut rx), vec![LinkEvent::ScanningStarted]);

        // Idempotent while scanning.
        scanner.start_scanning().unwrap();
        assert_eq!(transport.count("scan"), 1);
    }

    #[test]
    fn test_start_reconnects_to_connected_peer() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_connected_peers(vec![PeerId::from("old"), peer()]);
        let (scanner, _rx) = scanner_with(transport.clone(), ScannerConfig::default());

        scanner.start_scanning().unwrap();
        assert!(!scanner.is_scanning());
        assert_eq!(scanner.session_peer(), Some(peer()));
        assert_eq!(scanner.session_state(), Some(SessionState::Connecting));
        assert_eq!(transport.commands(), vec![Command::Connect(peer())]);
    }

    #[test]
    fn test_start_deferred_until_powered_on() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_state(TransportState::PoweredOff);
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());

        scanner.start_scanning().unwrap();
        assert!(!scanner.is_scanning());
        assert_eq!(
            drain(&mut rx),
            vec![LinkEvent::Error(ErrorKind::TransportUnavailable)]
        );
        assert!(transport.commands().is_empty());

        transport.set_state(TransportState::PoweredOn);
        scanner.handle_event(TransportEvent::StateChanged(TransportState::PoweredOn));
        assert!(scanner.is_scanning());
        assert_eq!(drain(&mut rx), vec![LinkEvent::ScanningStarted]);
    }

    #[test]
    fn test_weak_signal_ignored() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, _rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();

        scanner.handle_event(discovered(-85));
        assert_eq!(scanner.session_state(), None);
        assert_eq!(transport.count("connect"), 0);

        scanner.handle_event(discovered(-70));
        assert_eq!(scanner.session_state(), Some(SessionState::Connecting));
    }

    #[test]
    fn test_other_service_ignored() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, _rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();

        scanner.handle_event(TransportEvent::Discovered {
            peer: peer(),
            advertisement: Advertisement {
                local_name: None,
                service_uuids: vec![Uuid::from_u128(1)],
            },
            rssi: -40,
        });
        assert_eq!(scanner.session_state(), None);
    }

    #[test]
    fn test_single_peer_policy() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, _rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();

        scanner.handle_event(discovered(-50));
        scanner.handle_event(TransportEvent::Discovered {
            peer: PeerId::from("advertiser-2"),
            advertisement: advertisement(),
            rssi: -30,
        });
        assert_eq!(scanner.session_peer(), Some(peer()));
        assert_eq!(transport.count("connect"), 1);
    }

    #[test]
    fn test_handshake_reaches_ready() {
        let (scanner, _transport, _rx) = ready_scanner();
        let session = scanner.session().unwrap();
        assert!(session.is_subscribed());
        assert_eq!(session.characteristic(), Some(&handle()));
        assert_eq!(session.rssi(), Some(-50));
    }

    #[test]
    fn test_connect_stops_scan_and_discovers() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));
        drain(&mut rx);
        transport.take_commands();

        scanner.handle_event(TransportEvent::Connected { peer: peer() });
        assert!(!scanner.is_scanning());
        assert_eq!(
            transport.commands(),
            vec![
                Command::StopScan,
                Command::DiscoverServices {
                    peer: peer(),
                    services: vec![TRANSFER_SERVICE_UUID],
                },
            ]
        );
        assert_eq!(
            drain(&mut rx),
            vec![
                LinkEvent::StateChanged {
                    peer: peer(),
                    state: SessionState::Connected
                },
                LinkEvent::Connected { peer: peer() },
                LinkEvent::StateChanged {
                    peer: peer(),
                    state: SessionState::DiscoveringServices
                },
            ]
        );
    }

    #[test]
    fn test_send_request_writes_hello() {
        let (scanner, transport, _rx) = ready_scanner();

        scanner.send_request(MessageKind::Hello).unwrap();
        assert_eq!(
            transport.commands(),
            vec![Command::Write {
                peer: peer(),
                characteristic: TRANSFER_CHARACTERISTIC_UUID,
                value: b"hello".to_vec(),
                write_type: WriteType::WithoutResponse,
            }]
        );
    }

    #[test]
    fn test_send_request_without_session_never_writes() {
        let mut transport = MockTransport::new();
        transport.expect_write().never();
        let (scanner, _rx) = scanner_with(Arc::new(transport), ScannerConfig::default());

        let err = scanner.send_request(MessageKind::Hello).unwrap_err();
        assert!(matches!(err, Error::SendFailed { .. }));
    }

    #[test]
    fn test_send_request_before_ready_never_writes() {
        let mut transport = MockTransport::new();
        transport
            .expect_state()
            .return_const(TransportState::PoweredOn);
        transport.expect_retrieve_connected().returning(|_| Vec::new());
        transport.expect_scan().times(1).returning(|_, _| Ok(()));
        transport.expect_connect().times(1).returning(|_| Ok(()));
        transport.expect_stop_scan().returning(|| Ok(()));
        transport
            .expect_discover_services()
            .times(1)
            .returning(|_, _| Ok(()));
        transport.expect_write().never();

        let (scanner, _rx) = scanner_with(Arc::new(transport), ScannerConfig::default());
        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));
        scanner.handle_event(TransportEvent::Connected { peer: peer() });
        assert_eq!(
            scanner.session_state(),
            Some(SessionState::DiscoveringServices)
        );

        assert!(scanner.send_request(MessageKind::Hello).is_err());
    }

    #[test]
    fn test_response_forwarded_to_observers() {
        let (scanner, _transport, mut rx) = ready_scanner();

        scanner.handle_event(TransportEvent::ValueUpdated {
            peer: peer(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            value: b"hello".to_vec(),
            error: None,
        });
        scanner.handle_event(TransportEvent::ValueUpdated {
            peer: peer(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            value: b"goodbye".to_vec(),
            error: None,
        });

        assert_eq!(
            drain(&mut rx),
            vec![LinkEvent::MessageReceived(Message::Response(
                MessageKind::Hello
            ))]
        );
        assert_eq!(scanner.session_state(), Some(SessionState::Ready));
    }

    #[test]
    fn test_service_discovery_error_cleans_up() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));
        scanner.handle_event(TransportEvent::Connected { peer: peer() });
        drain(&mut rx);
        transport.take_commands();

        scanner.handle_event(TransportEvent::ServicesFound {
            peer: peer(),
            services: Vec::new(),
            error: Some("gatt error".to_string()),
        });
        assert_eq!(scanner.session_state(), Some(SessionState::Disconnecting));
        assert_eq!(transport.commands(), vec![Command::Disconnect(peer())]);
        assert!(drain(&mut rx).contains(&LinkEvent::Error(ErrorKind::ServiceDiscoveryFailed)));

        scanner.handle_event(TransportEvent::Disconnected {
            peer: peer(),
            error: None,
        });
        assert_eq!(scanner.session_state(), None);
        assert!(scanner.is_scanning());
    }

    #[test]
    fn test_missing_characteristic_cleans_up() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));
        scanner.handle_event(TransportEvent::Connected { peer: peer() });
        scanner.handle_event(TransportEvent::ServicesFound {
            peer: peer(),
            services: vec![TRANSFER_SERVICE_UUID],
            error: None,
        });
        drain(&mut rx);

        scanner.handle_event(TransportEvent::CharacteristicsFound {
            peer: peer(),
            service: TRANSFER_SERVICE_UUID,
            characteristics: Vec::new(),
            error: None,
        });
        assert_eq!(scanner.session_state(), Some(SessionState::Disconnecting));
        assert!(drain(&mut rx)
            .contains(&LinkEvent::Error(ErrorKind::CharacteristicDiscoveryFailed)));
    }

    #[test]
    fn test_receive_error_unsubscribes_then_disconnects() {
        let (scanner, transport, mut rx) = ready_scanner();

        scanner.handle_event(TransportEvent::ValueUpdated {
            peer: peer(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            value: Vec::new(),
            error: Some("read failed".to_string()),
        });
        assert_eq!(
            transport.commands(),
            vec![
                Command::SetNotify {
                    peer: peer(),
                    characteristic: TRANSFER_CHARACTERISTIC_UUID,
                    enabled: false,
                },
                Command::Disconnect(peer()),
            ]
        );
        assert!(drain(&mut rx).contains(&LinkEvent::Error(ErrorKind::ReceiveFailed)));
    }

    #[test]
    fn test_notification_stopped_disconnects() {
        let (scanner, transport, _rx) = ready_scanner();

        scanner.handle_event(TransportEvent::NotifyStateChanged {
            peer: peer(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            enabled: false,
            error: None,
        });
        assert_eq!(scanner.session_state(), Some(SessionState::Disconnecting));
        // Already unsubscribed remotely, so only the disconnect is issued.
        assert_eq!(transport.commands(), vec![Command::Disconnect(peer())]);
    }

    #[test]
    fn test_disconnect_rescans() {
        let (scanner, transport, mut rx) = ready_scanner();

        scanner.handle_event(TransportEvent::Disconnected {
            peer: peer(),
            error: Some("link lost".to_string()),
        });
        assert_eq!(scanner.session_state(), None);
        assert!(scanner.is_scanning());
        assert_eq!(transport.count("scan"), 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                LinkEvent::StateChanged {
                    peer: peer(),
                    state: SessionState::Disconnected
                },
                LinkEvent::ScanningStarted,
            ]
        );
    }

    #[test]
    fn test_connect_failed_rescans() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));
        drain(&mut rx);

        scanner.handle_event(TransportEvent::ConnectFailed {
            peer: peer(),
            error: "timeout".to_string(),
        });
        assert_eq!(scanner.session_state(), None);
        let events = drain(&mut rx);
        assert!(events.contains(&LinkEvent::Error(ErrorKind::ConnectFailed)));
        assert!(events.contains(&LinkEvent::ScanningStarted));
    }

    #[test]
    fn test_cancel_connect() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, _rx) = scanner_with(transport.clone(), ScannerConfig::default());
        scanner.start_scanning().unwrap();

        assert!(matches!(scanner.cancel_connect(), Err(Error::NotConnected)));

        scanner.handle_event(discovered(-50));
        transport.take_commands();
        scanner.cancel_connect().unwrap();
        assert_eq!(scanner.session_state(), Some(SessionState::Disconnecting));
        assert_eq!(transport.commands(), vec![Command::Disconnect(peer())]);

        scanner.handle_event(TransportEvent::Disconnected {
            peer: peer(),
            error: None,
        });
        assert_eq!(scanner.session_state(), None);
        assert_eq!(transport.count("scan"), 1);
    }

    #[test]
    fn test_cancel_connect_rejected_when_ready() {
        let (scanner, transport, _rx) = ready_scanner();
        assert!(matches!(
            scanner.cancel_connect(),
            Err(Error::InvalidTransition {
                from: SessionState::Ready,
                ..
            })
        ));
        assert!(transport.commands().is_empty());
    }

    #[test]
    fn test_stop_scanning_tears_down_without_rescan() {
        let (scanner, transport, _rx) = ready_scanner();

        scanner.stop_scanning().unwrap();
        assert_eq!(transport.count("disconnect"), 1);

        scanner.handle_event(TransportEvent::Disconnected {
            peer: peer(),
            error: None,
        });
        assert_eq!(scanner.session_state(), None);
        assert!(!scanner.is_scanning());
        assert_eq!(transport.count("scan"), 0);

        scanner.handle_event(discovered(-40));
        assert_eq!(scanner.session_state(), None);
    }

    #[test]
    fn test_start_while_disconnecting_rescans_after_disconnect() {
        let (scanner, transport, _rx) = ready_scanner();

        scanner.stop_scanning().unwrap();
        assert_eq!(scanner.session_state(), Some(SessionState::Disconnecting));

        scanner.start_scanning().unwrap();
        assert_eq!(transport.count("scan"), 0);

        scanner.handle_event(TransportEvent::Disconnected {
            peer: peer(),
            error: None,
        });
        assert_eq!(scanner.session_state(), None);
        assert!(scanner.is_scanning());
        assert_eq!(transport.count("scan"), 1);
    }

    #[test]
    fn test_power_off_drops_session() {
        let (scanner, transport, mut rx) = ready_scanner();
        transport.set_state(TransportState::PoweredOff);

        scanner.handle_event(TransportEvent::StateChanged(TransportState::PoweredOff));
        assert_eq!(scanner.session_state(), None);
        assert!(drain(&mut rx).contains(&LinkEvent::Error(ErrorKind::TransportUnavailable)));

        transport.set_state(TransportState::PoweredOn);
        scanner.handle_event(TransportEvent::StateChanged(TransportState::PoweredOn));
        assert!(scanner.is_scanning());
    }

    #[test]
    fn test_services_invalidated_rediscovers() {
        let (scanner, transport, _rx) = ready_scanner();

        scanner.handle_event(TransportEvent::ServicesInvalidated {
            peer: peer(),
            services: vec![TRANSFER_SERVICE_UUID],
        });
        let session = scanner.session().unwrap();
        assert_eq!(session.state(), SessionState::DiscoveringServices);
        assert!(session.characteristic().is_none());
        assert_eq!(transport.count("discover_services"), 1);
    }

    #[test]
    fn test_handshake_timeout() {
        let transport = Arc::new(SimulatedTransport::new());
        let config = ScannerConfig::default().with_handshake_timeout(Duration::from_secs(5));
        let (scanner, mut rx) = scanner_with(transport.clone(), config);
        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));
        drain(&mut rx);

        scanner.check_handshake_timeout(Instant::now());
        assert_eq!(scanner.session_state(), Some(SessionState::Connecting));

        scanner.check_handshake_timeout(Instant::now() + Duration::from_secs(6));
        assert_eq!(scanner.session_state(), Some(SessionState::Disconnecting));
        assert!(drain(&mut rx).contains(&LinkEvent::Error(ErrorKind::HandshakeTimeout)));
    }

    #[test]
    fn test_no_timeout_configured() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, _rx) = scanner_with(transport, ScannerConfig::default());
        scanner.start_scanning().unwrap();
        scanner.handle_event(discovered(-50));

        scanner.on_tick(Instant::now() + Duration::from_secs(3600));
        assert_eq!(scanner.session_state(), Some(SessionState::Connecting));
    }

    #[test]
    fn test_restored_notifying_peer_is_ready() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, mut rx) = scanner_with(transport.clone(), ScannerConfig::default());

        scanner.handle_event(TransportEvent::CentralRestored {
            peripherals: vec![RestoredPeripheral {
                peer: peer(),
                characteristic: Some(handle()),
                notifying: true,
            }],
        });
        assert_eq!(scanner.session_state(), Some(SessionState::Ready));
        assert!(transport.commands().is_empty());
        assert!(drain(&mut rx).contains(&LinkEvent::Connected { peer: peer() }));

        scanner.send_request(MessageKind::Hello).unwrap();
        assert_eq!(transport.count("write"), 1);
    }

    #[test]
    fn test_restored_peer_rediscovers() {
        let transport = Arc::new(SimulatedTransport::new());
        let (scanner, _rx) = scanner_with(transport.clone(), ScannerConfig::default());

        scanner.handle_event(TransportEvent::CentralRestored {
            peripherals: vec![RestoredPeripheral {
                peer: peer(),
                characteristic: None,
                notifying: false,
            }],
        });
        assert_eq!(
            scanner.session_state(),
            Some(SessionState::DiscoveringServices)
        );
        assert_eq!(transport.count("discover_services"), 1);
    }

    fn transport_event(choice: u8) -> TransportEvent {
        match choice {
            0 => discovered(-50),
            1 => TransportEvent::Connected { peer: peer() },
            2 => TransportEvent::ServicesFound {
                peer: peer(),
                services: vec![TRANSFER_SERVICE_UUID],
                error: None,
            },
            3 => TransportEvent::CharacteristicsFound {
                peer: peer(),
                service: TRANSFER_SERVICE_UUID,
                characteristics: vec![handle()],
                error: None,
            },
            4 => TransportEvent::NotifyStateChanged {
                peer: peer(),
                characteristic: TRANSFER_CHARACTERISTIC_UUID,
                enabled: true,
                error: None,
            },
            5 => TransportEvent::NotifyStateChanged {
                peer: peer(),
                characteristic: TRANSFER_CHARACTERISTIC_UUID,
                enabled: false,
                error: None,
            },
            6 => TransportEvent::Disconnected {
                peer: peer(),
                error: None,
            },
            7 => TransportEvent::ServicesInvalidated {
                peer: peer(),
                services: vec![TRANSFER_SERVICE_UUID],
            },
            _ => TransportEvent::CentralRestored {
                peripherals: vec![RestoredPeripheral {
                    peer: peer(),
                    characteristic: Some(handle()),
                    notifying: choice % 2 == 0,
                }],
            },
        }
    }

    /// First state reported for a new session.
    fn opens_session(state: SessionState) -> bool {
        matches!(
            state,
            SessionState::Connecting | SessionState::Connected | SessionState::Ready
        )
    }

    proptest! {
        #[test]
        fn event_sequences_only_follow_table(choices in proptest::collection::vec(0u8..10, 0..60)) {
            let transport = Arc::new(SimulatedTransport::new());
            let (scanner, mut rx) = scanner_with(transport, ScannerConfig::default());
            scanner.start_scanning().unwrap();

            for choice in choices {
                scanner.handle_event(transport_event(choice));
            }

            let states: Vec<SessionState> = drain(&mut rx)
                .into_iter()
                .filter_map(|event| match event {
                    LinkEvent::StateChanged { state, .. } => Some(state),
                    _ => None,
                })
                .collect();

            if let Some(first) = states.first() {
                prop_assert!(opens_session(*first), "first state {}", first);
            }
            for pair in states.windows(2) {
                let (from, to) = (pair[0], pair[1]);
                prop_assert!(
                    from.can_transition_to(to) || (from.is_terminal() && opens_session(to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
            if let Some(current) = scanner.session_state() {
                prop_assert_eq!(states.last().copied(), Some(current));
            }
        }
    }
}
