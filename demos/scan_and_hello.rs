//! Scan for an advertiser over the host's Bluetooth adapter and say hello
//!
//! Run with: cargo run --example scan_and_hello
//!
//! Needs a peripheral advertising the transfer service nearby.

use std::sync::Arc;
use std::time::Duration;
use transfer_rust_ble::{
    BtleplugTransport, DispatcherConfig, ErrorKind, EventDispatcher, EventSink, LinkEvent,
    Message, MessageKind, Notifier, Observer, ObserverRegistry, PeerId, Result, Scanner,
    ScannerConfig, ServiceDescriptor, SessionState,
};

/// Prints every milestone.
struct Printer;

impl Observer for Printer {
    fn on_scanning_started(&self) {
        println!("Scanning for the transfer service...");
    }

    fn on_connected(&self, peer: &PeerId) {
        println!("Connected to {}", peer);
    }

    fn on_state_changed(&self, peer: &PeerId, state: SessionState) {
        println!("  {} -> {}", peer, state);
    }

    fn on_message_received(&self, message: Message) {
        println!("Received {}", message);
    }

    fn on_error(&self, kind: ErrorKind) {
        println!("Error: {}", kind);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("transfer_rust_ble=debug".parse().unwrap()),
        )
        .init();

    let (sink, queue) = EventSink::channel();
    let (notifier, link_events) = Notifier::channel();
    let transport = Arc::new(BtleplugTransport::new(sink).await?);

    let scanner = Arc::new(Scanner::new(
        transport,
        ServiceDescriptor::default(),
        ScannerConfig::default().with_handshake_timeout(Duration::from_secs(15)),
        notifier,
    ));

    let config = DispatcherConfig::default();
    let observers = ObserverRegistry::from_config(&config);
    let _printer = observers.register(Arc::new(Printer));
    let mut events = observers.subscribe();

    let dispatcher = EventDispatcher::start(
        queue,
        scanner.clone(),
        link_events,
        observers,
        &tokio::runtime::Handle::current(),
        &config,
    );

    scanner.start_scanning()?;

    let exchange = async {
        while let Ok(event) = events.recv().await {
            match event {
                LinkEvent::StateChanged { state, .. } if state.is_ready() => {
                    if let Err(e) = scanner.send_request(MessageKind::Hello) {
                        println!("Could not send hello: {}", e);
                    }
                }
                LinkEvent::MessageReceived(Message::Response(MessageKind::Hello)) => return true,
                _ => {}
            }
        }
        false
    };

    match tokio::time::timeout(Duration::from_secs(60), exchange).await {
        Ok(true) => println!("\nHello exchanged."),
        _ => println!("\nNo hello received within 60 seconds."),
    }

    scanner.stop_scanning()?;
    dispatcher.shutdown().await;

    Ok(())
}
