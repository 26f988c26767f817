//! Advertiser controller.
//!
//! Publishes the transfer service, advertises it, and answers requests
//! written by the subscribed scanner. Only one central is served at a time:
//! the most recent subscriber replaces any earlier one.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::session::{PeerSession, SessionState};
use crate::ble::transport::{
    CharacteristicHandle, PeerId, Transport, TransportEvent, TransportState, WriteRequest,
};
use crate::ble::uuids::ServiceDescriptor;
use crate::config::AdvertiserConfig;
use crate::dispatcher::EventHandler;
use crate::error::{Error, ErrorKind, Result};
use crate::observer::{LinkEvent, Notifier};
use crate::protocol::{decode, Direction, Message, MessageKind};

#[derive(Debug, Default)]
struct AdvertiserState {
    wants_advertising: bool,
    is_advertising: bool,
    session: Option<PeerSession>,
    /// Automatic response rejected by a full transmit queue.
    pending: Option<Message>,
}

/// Advertiser-role controller.
pub struct Advertiser {
    transport: Arc<dyn Transport>,
    descriptor: Arc<ServiceDescriptor>,
    config: AdvertiserConfig,
    notifier: Notifier,
    state: Mutex<AdvertiserState>,
}

impl Advertiser {
    /// Create an advertiser. Nothing is published until [`Advertiser::start_advertising`].
    pub fn new(
        transport: Arc<dyn Transport>,
        descriptor: ServiceDescriptor,
        config: AdvertiserConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            transport,
            descriptor: Arc::new(descriptor),
            config,
            notifier,
            state: Mutex::new(AdvertiserState::default()),
        }
    }

    /// Publish the service and start advertising it.
    ///
    /// May be called again to republish. When the radio is not powered on,
    /// observers get [`ErrorKind::TransportUnavailable`] and publishing
    /// happens on the next power-on.
    pub fn start_advertising(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.wants_advertising = true;

        let radio = self.transport.state();
        if !radio.is_ready() {
            warn!("Transport is {}, advertising deferred until powered on", radio);
            self.notifier
                .notify(LinkEvent::Error(ErrorKind::TransportUnavailable));
            return Ok(());
        }

        self.publish(&mut state)
    }

    /// Notify the subscribed scanner with a response.
    ///
    /// Fails with [`Error::SendFailed`] when no scanner is subscribed or the
    /// transport's transmit queue is full.
    pub fn respond(&self, kind: MessageKind) -> Result<()> {
        let state = self.state.lock();
        self.push(&state, Message::Response(kind))
    }

    /// Check if the transport confirmed that advertising started.
    pub fn is_advertising(&self) -> bool {
        self.state.lock().is_advertising
    }

    /// The subscribed scanner, if any.
    pub fn subscribed_peer(&self) -> Option<PeerId> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|session| session.peer().clone())
    }

    /// State of the current session, if any.
    pub fn session_state(&self) -> Option<SessionState> {
        self.state.lock().session.as_ref().map(PeerSession::state)
    }

    /// Check if an automatic response is waiting for transmit queue space.
    pub fn has_pending_response(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Advertiser settings.
    pub fn config(&self) -> &AdvertiserConfig {
        &self.config
    }

    fn publish(&self, state: &mut AdvertiserState) -> Result<()> {
        state.is_advertising = false;

        let result = self
            .transport
            .remove_all_services()
            .and_then(|_| self.transport.publish_service(&self.descriptor))
            .and_then(|_| {
                let advertisement =
                    Advertisement::for_service(&self.descriptor, self.config.local_name.as_deref());
                self.transport.advertise(&advertisement)
            });

        match result {
            Ok(()) => {
                info!(
                    "Publishing service {} and advertising",
                    self.descriptor.service_uuid
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to start advertising: {}", e);
                self.notifier
                    .notify(LinkEvent::Error(ErrorKind::AdvertisingFailed));
                Err(e)
            }
        }
    }

    fn push(&self, state: &AdvertiserState, message: Message) -> Result<()> {
        let peer = state
            .session
            .as_ref()
            .map(|session| session.peer().clone())
            .ok_or_else(|| Error::send_failed("no subscribed peer"))?;

        let payload = message.encode();
        if !self.transport.push_notification(
            self.descriptor.characteristic_uuid,
            &payload,
            &[peer.clone()],
        ) {
            return Err(Error::send_failed("transmit queue full"));
        }

        debug!("Sent {} to {} ({} bytes)", message, peer, payload.len());
        Ok(())
    }

    fn notify_state(&self, session: &PeerSession) {
        self.notifier.notify(LinkEvent::StateChanged {
            peer: session.peer().clone(),
            state: session.state(),
        });
    }

    fn discard(&self, state: &mut AdvertiserState) {
        state.pending = None;
        if let Some(mut session) = state.session.take() {
            if session.transition(SessionState::Disconnected).is_ok() {
                self.notify_state(&session);
            }
            debug!("Session for {} discarded", session.peer());
        }
    }

    /// Make `central` the sole active peer, already subscribed.
    fn adopt(&self, state: &mut AdvertiserState, central: PeerId) {
        if state
            .session
            .as_ref()
            .map_or(false, |session| session.is_peer(&central))
        {
            debug!("Central {} already subscribed", central);
            return;
        }

        self.discard(state);

        let session = PeerSession::rehydrate(
            central.clone(),
            self.descriptor.clone(),
            SessionState::Ready,
            Some(CharacteristicHandle::for_descriptor(&self.descriptor)),
        );
        self.notify_state(&session);
        state.session = Some(session);
        self.notifier.notify(LinkEvent::Connected { peer: central });
    }

    fn on_transport_state(&self, state: &mut AdvertiserState, radio: TransportState) {
        match radio {
            TransportState::PoweredOn => {
                info!("Transport powered on");
                if state.wants_advertising {
                    // Failures are already reported to observers.
                    let _ = self.publish(state);
                }
            }
            TransportState::Unknown | TransportState::Resetting => {
                debug!("Transport state is {}", radio);
            }
            _ => {
                warn!("Transport not available: {}", radio);
                state.is_advertising = false;
                self.discard(state);
                if state.wants_advertising {
                    self.notifier
                        .notify(LinkEvent::Error(ErrorKind::TransportUnavailable));
                }
            }
        }
    }

    fn on_subscribed(&self, state: &mut AdvertiserState, central: PeerId, characteristic: Uuid) {
        if !self.descriptor.is_characteristic(&characteristic) {
            trace!("Ignoring subscription to {}", characteristic);
            return;
        }

        info!("Central {} subscribed to characteristic", central);
        self.adopt(state, central);
    }

    fn on_unsubscribed(&self, state: &mut AdvertiserState, central: PeerId, characteristic: Uuid) {
        let active = state
            .session
            .as_ref()
            .map_or(false, |session| session.is_peer(&central));
        if !active || !self.descriptor.is_characteristic(&characteristic) {
            return;
        }

        info!("Central {} unsubscribed from characteristic", central);
        self.discard(state);
    }

    fn on_write(&self, state: &mut AdvertiserState, requests: Vec<WriteRequest>) {
        for request in requests {
            if !self.descriptor.is_characteristic(&request.characteristic) {
                trace!("Ignoring write to {}", request.characteristic);
                continue;
            }

            let message = match decode(&request.value, Direction::Request) {
                Ok(message) => message,
                Err(e) => {
                    debug!(
                        "Dropping {} bytes from {}: {}",
                        request.value.len(),
                        request.central,
                        e
                    );
                    continue;
                }
            };

            info!("Received {} from {}", message, request.central);
            self.notifier.notify(LinkEvent::MessageReceived(message));

            let Some(response) = message.response() else {
                continue;
            };
            if state.session.is_none() {
                debug!("No subscribed central to answer {}", message);
                continue;
            }
            if let Err(e) = self.push(state, response) {
                warn!("Response {} deferred: {}", response, e);
                state.pending = Some(response);
            }
        }
    }

    fn on_ready_to_update(&self, state: &mut AdvertiserState) {
        let Some(response) = state.pending.take() else {
            return;
        };

        match self.push(state, response) {
            Ok(()) => debug!("Deferred response {} sent", response),
            Err(e) => {
                debug!("Deferred response {} still waiting: {}", response, e);
                if state.session.is_some() {
                    state.pending = Some(response);
                }
            }
        }
    }

    fn on_advertising_started(&self, state: &mut AdvertiserState, reason: Option<String>) {
        if !state.wants_advertising {
            return;
        }

        match reason {
            Some(reason) => {
                error!("Advertising failed to start: {}", reason);
                state.is_advertising = false;
                self.notifier
                    .notify(LinkEvent::Error(ErrorKind::AdvertisingFailed));
            }
            None => {
                info!("Advertising started");
                state.is_advertising = true;
                self.notifier.notify(LinkEvent::AdvertisingStarted);
            }
        }
    }

    fn on_restored(
        &self,
        state: &mut AdvertiserState,
        services: Vec<Uuid>,
        subscribed_centrals: Vec<PeerId>,
    ) {
        if !services.is_empty() && !services.iter().any(|uuid| self.descriptor.is_service(uuid)) {
            debug!("Restored services do not include the transfer service");
            return;
        }

        state.wants_advertising = true;
        if let Some(central) = subscribed_centrals.into_iter().next() {
            info!("Restored subscribed central {}", central);
            self.adopt(state, central);
        }
    }
}

impl EventHandler for Advertiser {
    fn handle_event(&self, event: TransportEvent) {
        let mut state = self.state.lock();
        let state = &mut *state;

        match event {
            TransportEvent::StateChanged(radio) => self.on_transport_state(state, radio),
            TransportEvent::Subscribed {
                central,
                characteristic,
            } => self.on_subscribed(state, central, characteristic),
            TransportEvent::Unsubscribed {
                central,
                characteristic,
            } => self.on_unsubscribed(state, central, characteristic),
            TransportEvent::WriteReceived { requests } => self.on_write(state, requests),
            TransportEvent::ReadyToUpdateSubscribers => self.on_ready_to_update(state),
            TransportEvent::AdvertisingStarted { error } => {
                self.on_advertising_started(state, error)
            }
            TransportEvent::PeripheralRestored {
                services,
                subscribed_centrals,
            } => self.on_restored(state, services, subscribed_centrals),
            other => trace!("Advertiser ignoring {} event", other.name()),
        }
    }
}
