//! Observer interface for UI and application collaborators.
//!
//! Controllers report milestones through a [`Notifier`]; the dispatcher's
//! delivery task hands them to every observer in an [`ObserverRegistry`]
//! and to broadcast subscribers.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::ble::session::SessionState;
use crate::ble::transport::PeerId;
use crate::config::DispatcherConfig;
use crate::error::ErrorKind;
use crate::protocol::Message;

/// Milestones reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The scanner began discovery (or is reconnecting to a known peer).
    ScanningStarted,
    /// The advertiser is publishing and advertising its service.
    AdvertisingStarted,
    /// A link to a peer is up.
    Connected {
        /// The peer.
        peer: PeerId,
    },
    /// The active session changed state.
    StateChanged {
        /// The peer.
        peer: PeerId,
        /// The new state.
        state: SessionState,
    },
    /// A message arrived from the peer.
    MessageReceived(Message),
    /// Something went wrong; the controller has already recovered.
    Error(ErrorKind),
}

/// Receives link milestones.
///
/// All methods default to no-ops so implementors only override what they use.
pub trait Observer: Send + Sync {
    /// Discovery started.
    fn on_scanning_started(&self) {}

    /// Advertising started.
    fn on_advertising_started(&self) {}

    /// A link to `peer` is up.
    fn on_connected(&self, _peer: &PeerId) {}

    /// The active session changed state.
    fn on_state_changed(&self, _peer: &PeerId, _state: SessionState) {}

    /// A message arrived.
    fn on_message_received(&self, _message: Message) {}

    /// An error was recovered from.
    fn on_error(&self, _kind: ErrorKind) {}
}

/// Adapts a closure over [`LinkEvent`] into an [`Observer`].
struct FnObserver<F>(F);

impl<F> FnObserver<F>
where
    F: Fn(&LinkEvent) + Send + Sync,
{
    fn call(&self, event: LinkEvent) {
        (self.0)(&event)
    }
}

impl<F> Observer for FnObserver<F>
where
    F: Fn(&LinkEvent) + Send + Sync,
{
    fn on_scanning_started(&self) {
        self.call(LinkEvent::ScanningStarted)
    }

    fn on_advertising_started(&self) {
        self.call(LinkEvent::AdvertisingStarted)
    }

    fn on_connected(&self, peer: &PeerId) {
        self.call(LinkEvent::Connected { peer: peer.clone() })
    }

    fn on_state_changed(&self, peer: &PeerId, state: SessionState) {
        self.call(LinkEvent::StateChanged {
            peer: peer.clone(),
            state,
        })
    }

    fn on_message_received(&self, message: Message) {
        self.call(LinkEvent::MessageReceived(message))
    }

    fn on_error(&self, kind: ErrorKind) {
        self.call(LinkEvent::Error(kind))
    }
}

/// Callback handle for unregistering observers.
///
/// Dropping the handle unregisters the observer.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Keep the observer registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.unregister_fn = None;
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

type ObserverList = Vec<(u64, Arc<dyn Observer>)>;

/// Registration list of observers plus a broadcast stream of the same events.
#[derive(Clone)]
pub struct ObserverRegistry {
    observers: Arc<RwLock<ObserverList>>,
    callback_counter: Arc<AtomicU64>,
    event_tx: broadcast::Sender<LinkEvent>,
}

impl ObserverRegistry {
    /// Create an empty registry whose broadcast stream buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            observers: Arc::new(RwLock::new(Vec::new())),
            callback_counter: Arc::new(AtomicU64::new(0)),
            event_tx,
        }
    }

    /// Create an empty registry sized by the dispatcher settings.
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.broadcast_capacity)
    }

    /// Register an observer. It stays registered until the handle is dropped.
    pub fn register(&self, observer: Arc<dyn Observer>) -> CallbackHandle {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        self.observers.write().push((callback_id, observer));

        let observers = Arc::downgrade(&self.observers);
        CallbackHandle::new(callback_id, move || {
            if let Some(observers) = observers.upgrade() {
                observers.write().retain(|(id, _)| *id != callback_id);
            }
        })
    }

    /// Register a closure called with every event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        self.register(Arc::new(FnObserver(callback)))
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Check if no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Deliver one event to every observer, in registration order.
    pub fn deliver(&self, event: &LinkEvent) {
        // Snapshot so observers may register or unregister from inside a callback.
        let observers: Vec<Arc<dyn Observer>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        trace!("Delivering {:?} to {} observers", event, observers.len());

        for observer in observers {
            match event {
                LinkEvent::ScanningStarted => observer.on_scanning_started(),
                LinkEvent::AdvertisingStarted => observer.on_advertising_started(),
                LinkEvent::Connected { peer } => observer.on_connected(peer),
                LinkEvent::StateChanged { peer, state } => observer.on_state_changed(peer, *state),
                LinkEvent::MessageReceived(message) => observer.on_message_received(*message),
                LinkEvent::Error(kind) => observer.on_error(*kind),
            }
        }

        let _ = self.event_tx.send(event.clone());
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }
}

/// Sending half used by controllers to report milestones.
///
/// Never blocks and never needs a runtime, so controllers can report from
/// inside the serialized event path.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl Notifier {
    /// Create a notifier and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an event. Dropped silently once the delivery side is gone.
    pub fn notify(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }
}
