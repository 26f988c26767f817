//! Event dispatcher.
//!
//! Transport adapters may post events from any thread. All of them funnel
//! through one [`EventSink`] into a single consumer task that applies them
//! to the controller strictly in arrival order, so session transitions are
//! never observed concurrently. Observer milestones are delivered by a
//! second task on a caller-chosen runtime, decoupling radio timing from
//! presentation timing.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::ble::transport::TransportEvent;
use crate::config::DispatcherConfig;
use crate::observer::{LinkEvent, ObserverRegistry};

/// Consumer of serialized transport events.
pub trait EventHandler: Send + Sync + 'static {
    /// Apply one transport event.
    fn handle_event(&self, event: TransportEvent);

    /// Periodic tick for time-based policy such as handshake watchdogs.
    fn on_tick(&self, _now: Instant) {}
}

/// Cloneable producer handle given to transport adapters.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

/// Receiving half of an [`EventSink`], consumed by [`EventDispatcher::start`].
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventSink {
    /// Create a sink and the queue its events arrive on.
    pub fn channel() -> (Self, EventQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventQueue { rx })
    }

    /// Post an event. Returns `false` once the dispatcher has stopped.
    pub fn post(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

impl EventQueue {
    /// Take the next queued event without waiting.
    ///
    /// Lets tests and simulations drain a queue by hand instead of running
    /// a dispatcher.
    pub fn try_next(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

/// Runs the inbound event loop and the observer delivery loop.
pub struct EventDispatcher {
    is_running: Arc<AtomicBool>,
    inbound_handle: Mutex<Option<JoinHandle<()>>>,
    delivery_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Start dispatching.
    ///
    /// Events from `queue` are applied to `handler` on a task spawned on the
    /// current Tokio runtime. Events from `link_events` are delivered to
    /// `observers` on a task spawned on `delivery`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start<H: EventHandler>(
        queue: EventQueue,
        handler: Arc<H>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        observers: ObserverRegistry,
        delivery: &Handle,
        config: &DispatcherConfig,
    ) -> Self {
        info!("Starting event dispatcher");

        let is_running = Arc::new(AtomicBool::new(true));

        let inbound_handle = tokio::spawn(Self::run_inbound(
            queue,
            handler,
            config.clone(),
            is_running.clone(),
        ));
        let delivery_handle = delivery.spawn(Self::run_delivery(link_events, observers));

        Self {
            is_running,
            inbound_handle: Mutex::new(Some(inbound_handle)),
            delivery_handle: Mutex::new(Some(delivery_handle)),
        }
    }

    /// Check if the dispatcher is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop both loops. Events still queued are dropped.
    pub async fn shutdown(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down event dispatcher");

        let handles = [
            self.inbound_handle.lock().take(),
            self.delivery_handle.lock().take(),
        ];
        for handle in handles.into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn run_inbound<H: EventHandler>(
        mut queue: EventQueue,
        handler: Arc<H>,
        config: DispatcherConfig,
        is_running: Arc<AtomicBool>,
    ) {
        let mut ticker = tokio::time::interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while is_running.load(Ordering::SeqCst) {
            tokio::select! {
                biased;
                event = queue.rx.recv() => match event {
                    Some(event) => {
                        trace!("Dispatching transport event: {}", event.name());
                        handler.handle_event(event);
                    }
                    None => break,
                },
                _ = ticker.tick() => handler.on_tick(Instant::now()),
            }
        }

        debug!("Inbound event loop ended");
    }

    async fn run_delivery(
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        observers: ObserverRegistry,
    ) {
        while let Some(event) = link_events.recv().await {
            observers.deliver(&event);
        }

        debug!("Observer delivery loop ended");
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);

        let handles = [
            self.inbound_handle.lock().take(),
            self.delivery_handle.lock().take(),
        ];
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
    }
}
