//! Run a scanner and an advertiser against the in-memory radio
//!
//! Run with: cargo run --example loopback
//!
//! Shows the full handshake and a hello exchange without any hardware.

use std::sync::Arc;
use std::time::Duration;
use transfer_rust_ble::{
    Advertiser, AdvertiserConfig, DispatcherConfig, EventDispatcher, EventSink, LinkEvent,
    Message, MessageKind, Notifier, ObserverRegistry, Result, Scanner, ScannerConfig,
    ServiceDescriptor, SimulatedAir,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("transfer_rust_ble=info".parse().unwrap()),
        )
        .init();

    let air = SimulatedAir::new(-55);
    let runtime = tokio::runtime::Handle::current();
    let config = DispatcherConfig::default();

    // Advertiser side
    let (advertiser_sink, advertiser_queue) = EventSink::channel();
    let (advertiser_notifier, advertiser_link) = Notifier::channel();
    let advertiser = Arc::new(Advertiser::new(
        Arc::new(air.peripheral(advertiser_sink)),
        ServiceDescriptor::default(),
        AdvertiserConfig::default(),
        advertiser_notifier,
    ));
    let advertiser_observers = ObserverRegistry::from_config(&config);
    let _advertiser_log = advertiser_observers.on_event(|event| println!("[advertiser] {:?}", event));
    let advertiser_dispatcher = EventDispatcher::start(
        advertiser_queue,
        advertiser.clone(),
        advertiser_link,
        advertiser_observers,
        &runtime,
        &config,
    );

    // Scanner side
    let (scanner_sink, scanner_queue) = EventSink::channel();
    let (scanner_notifier, scanner_link) = Notifier::channel();
    let scanner = Arc::new(Scanner::new(
        Arc::new(air.central(scanner_sink)),
        ServiceDescriptor::default(),
        ScannerConfig::default(),
        scanner_notifier,
    ));
    let scanner_observers = ObserverRegistry::from_config(&config);
    let _scanner_log = scanner_observers.on_event(|event| println!("[scanner]    {:?}", event));
    let mut scanner_events = scanner_observers.subscribe();
    let scanner_dispatcher = EventDispatcher::start(
        scanner_queue,
        scanner.clone(),
        scanner_link,
        scanner_observers,
        &runtime,
        &config,
    );

    advertiser.start_advertising()?;
    scanner.start_scanning()?;

    let exchange = async {
        while let Ok(event) = scanner_events.recv().await {
            match event {
                LinkEvent::StateChanged { state, .. } if state.is_ready() => {
                    scanner.send_request(MessageKind::Hello)?;
                }
                LinkEvent::MessageReceived(Message::Response(MessageKind::Hello)) => break,
                _ => {}
            }
        }
        Ok::<(), transfer_rust_ble::Error>(())
    };

    match tokio::time::timeout(Duration::from_secs(5), exchange).await {
        Ok(result) => result?,
        Err(_) => println!("Timed out waiting for the hello response"),
    }

    scanner.stop_scanning()?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    scanner_dispatcher.shutdown().await;
    advertiser_dispatcher.shutdown().await;

    Ok(())
}
