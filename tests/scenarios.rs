//! End-to-end scenarios: a scanner and an advertiser talking through the
//! in-memory radio, each behind its own event dispatcher.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use transfer_rust_ble::ble::Command;
use transfer_rust_ble::{
    Advertiser, AdvertiserConfig, DispatcherConfig, Error, EventDispatcher, EventSink, LinkEvent,
    Message, MessageKind, Notifier, ObserverRegistry, PeerId, Scanner, ScannerConfig,
    ServiceDescriptor, SessionState, SimulatedAir, SimulatedTransport, TransportEvent,
};

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Rig {
    air: SimulatedAir,
    scanner: Arc<Scanner>,
    scanner_transport: Arc<SimulatedTransport>,
    scanner_events: broadcast::Receiver<LinkEvent>,
    advertiser: Arc<Advertiser>,
    advertiser_transport: Arc<SimulatedTransport>,
    advertiser_events: broadcast::Receiver<LinkEvent>,
    advertiser_sink: EventSink,
    dispatchers: Vec<EventDispatcher>,
}

impl Rig {
    fn new(rssi: i16) -> Self {
        init_tracing();

        let air = SimulatedAir::new(rssi);
        let config = DispatcherConfig::default().with_tick_interval(Duration::from_millis(10));

        let (advertiser_sink, advertiser_queue) = EventSink::channel();
        let (advertiser_notifier, advertiser_link) = Notifier::channel();
        let advertiser_transport = Arc::new(air.peripheral(advertiser_sink.clone()));
        let advertiser = Arc::new(Advertiser::new(
            advertiser_transport.clone(),
            ServiceDescriptor::default(),
            AdvertiserConfig::default(),
            advertiser_notifier,
        ));
        let advertiser_observers = ObserverRegistry::from_config(&config);
        let advertiser_events = advertiser_observers.subscribe();

        let (scanner_sink, scanner_queue) = EventSink::channel();
        let (scanner_notifier, scanner_link) = Notifier::channel();
        let scanner_transport = Arc::new(air.central(scanner_sink));
        let scanner = Arc::new(Scanner::new(
            scanner_transport.clone(),
            ServiceDescriptor::default(),
            ScannerConfig::default(),
            scanner_notifier,
        ));
        let scanner_observers = ObserverRegistry::from_config(&config);
        let scanner_events = scanner_observers.subscribe();

        let dispatchers = vec![
            EventDispatcher::start(
                advertiser_queue,
                advertiser.clone(),
                advertiser_link,
                advertiser_observers,
                &Handle::current(),
                &config,
            ),
            EventDispatcher::start(
                scanner_queue,
                scanner.clone(),
                scanner_link,
                scanner_observers,
                &Handle::current(),
                &config,
            ),
        ];

        Self {
            air,
            scanner,
            scanner_transport,
            scanner_events,
            advertiser,
            advertiser_transport,
            advertiser_events,
            advertiser_sink,
            dispatchers,
        }
    }

    async fn shutdown(self) {
        for dispatcher in &self.dispatchers {
            dispatcher.shutdown().await;
        }
    }
}

/// Wait until an event matching `predicate` is delivered.
async fn wait_for<F>(events: &mut broadcast::Receiver<LinkEvent>, predicate: F) -> LinkEvent
where
    F: Fn(&LinkEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for link event")
}

fn is_ready(event: &LinkEvent) -> bool {
    matches!(
        event,
        LinkEvent::StateChanged {
            state: SessionState::Ready,
            ..
        }
    )
}

#[tokio::test]
async fn test_hello_round_trip() {
    let mut rig = Rig::new(-50);

    rig.advertiser.start_advertising().unwrap();
    wait_for(&mut rig.advertiser_events, |e| {
        *e == LinkEvent::AdvertisingStarted
    })
    .await;
    assert!(rig.advertiser.is_advertising());

    rig.scanner.start_scanning().unwrap();
    wait_for(&mut rig.scanner_events, |e| *e == LinkEvent::ScanningStarted).await;
    let connected = wait_for(&mut rig.scanner_events, |e| {
        matches!(e, LinkEvent::Connected { .. })
    })
    .await;
    assert_eq!(
        connected,
        LinkEvent::Connected {
            peer: rig.air.peripheral_id()
        }
    );
    wait_for(&mut rig.scanner_events, is_ready).await;
    wait_for(&mut rig.advertiser_events, is_ready).await;
    assert_eq!(rig.advertiser.subscribed_peer(), Some(rig.air.central_id()));

    rig.scanner.send_request(MessageKind::Hello).unwrap();

    let request = wait_for(&mut rig.advertiser_events, |e| {
        matches!(e, LinkEvent::MessageReceived(_))
    })
    .await;
    assert_eq!(
        request,
        LinkEvent::MessageReceived(Message::Request(MessageKind::Hello))
    );

    let response = wait_for(&mut rig.scanner_events, |e| {
        matches!(e, LinkEvent::MessageReceived(_))
    })
    .await;
    assert_eq!(
        response,
        LinkEvent::MessageReceived(Message::Response(MessageKind::Hello))
    );

    assert_eq!(
        rig.scanner_transport.count("write"),
        1,
        "exactly one request written"
    );
    assert_eq!(rig.advertiser_transport.count("push_notification"), 1);

    rig.shutdown().await;
}

#[tokio::test]
async fn test_weak_signal_never_connects() {
    let mut rig = Rig::new(-85);

    rig.advertiser.start_advertising().unwrap();
    rig.scanner.start_scanning().unwrap();
    wait_for(&mut rig.scanner_events, |e| *e == LinkEvent::ScanningStarted).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.scanner.session_state(), None);
    assert!(rig.scanner.is_scanning());
    assert_eq!(rig.scanner_transport.count("connect"), 0);

    rig.shutdown().await;
}

#[tokio::test]
async fn test_link_loss_recovers() {
    let mut rig = Rig::new(-50);

    rig.advertiser.start_advertising().unwrap();
    rig.scanner.start_scanning().unwrap();
    wait_for(&mut rig.scanner_events, is_ready).await;

    rig.air.drop_link();

    wait_for(&mut rig.scanner_events, |e| {
        matches!(
            e,
            LinkEvent::StateChanged {
                state: SessionState::Disconnected,
                ..
            }
        )
    })
    .await;
    // Back to discovery, then straight back to a working session.
    wait_for(&mut rig.scanner_events, |e| *e == LinkEvent::ScanningStarted).await;
    wait_for(&mut rig.scanner_events, is_ready).await;
    assert_eq!(rig.scanner_transport.count("scan"), 2);

    rig.scanner.send_request(MessageKind::Hello).unwrap();
    wait_for(&mut rig.scanner_events, |e| {
        *e == LinkEvent::MessageReceived(Message::Response(MessageKind::Hello))
    })
    .await;

    rig.shutdown().await;
}

#[tokio::test]
async fn test_request_before_ready_is_rejected() {
    let rig = Rig::new(-50);

    let err = rig.scanner.send_request(MessageKind::Hello).unwrap_err();
    assert!(matches!(err, Error::SendFailed { .. }));
    assert_eq!(rig.scanner_transport.count("write"), 0);

    rig.shutdown().await;
}

#[tokio::test]
async fn test_stop_scanning_ends_session() {
    let mut rig = Rig::new(-50);

    rig.advertiser.start_advertising().unwrap();
    rig.scanner.start_scanning().unwrap();
    wait_for(&mut rig.scanner_events, is_ready).await;

    rig.scanner.stop_scanning().unwrap();
    wait_for(&mut rig.scanner_events, |e| {
        matches!(
            e,
            LinkEvent::StateChanged {
                state: SessionState::Disconnected,
                ..
            }
        )
    })
    .await;
    wait_for(&mut rig.advertiser_events, |e| {
        matches!(
            e,
            LinkEvent::StateChanged {
                state: SessionState::Disconnected,
                ..
            }
        )
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.scanner.session_state(), None);
    assert_eq!(rig.advertiser.subscribed_peer(), None);
    assert_eq!(rig.scanner_transport.count("scan"), 1);

    rig.shutdown().await;
}

#[tokio::test]
async fn test_restored_subscriber_can_be_answered() {
    let mut rig = Rig::new(-50);
    let central = PeerId::from("restored-central");

    rig.advertiser_sink
        .post(TransportEvent::PeripheralRestored {
            services: vec![ServiceDescriptor::default().service_uuid],
            subscribed_centrals: vec![central.clone()],
        });
    wait_for(&mut rig.advertiser_events, |e| {
        *e == LinkEvent::Connected {
            peer: central.clone(),
        }
    })
    .await;
    assert_eq!(rig.advertiser.session_state(), Some(SessionState::Ready));

    rig.advertiser.respond(MessageKind::Hello).unwrap();
    let pushes: Vec<Command> = rig
        .advertiser_transport
        .commands()
        .into_iter()
        .filter(|c| c.name() == "push_notification")
        .collect();
    assert_eq!(pushes.len(), 1);
    assert!(matches!(
        &pushes[0],
        Command::PushNotification { subscribers, accepted: true, .. } if *subscribers == vec![central.clone()]
    ));

    rig.shutdown().await;
}
