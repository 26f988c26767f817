// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # transfer-rust-ble
//!
//! Two-role Bluetooth Low Energy link with a tiny request/response protocol.
//!
//! A [`Scanner`] discovers an [`Advertiser`] exposing the transfer service,
//! connects, discovers the transfer characteristic, subscribes to it, and
//! then writes requests. The advertiser answers each recognized request with
//! a notification. Today the only message is `hello`.
//!
//! ## Features
//!
//! - **Single-peer sessions**: each role serves one peer at a time, driven by
//!   an explicit, forward-only session state machine
//! - **Signal filtering**: peers weaker than −70 dBm (configurable) are ignored
//! - **Self-healing**: any failure tears the session down and the scanner
//!   returns to discovery
//! - **Pluggable transport**: `btleplug` for real radios, an in-memory
//!   simulation for tests and demos
//! - **Serialized events**: transport callbacks from any thread are applied
//!   in arrival order; observers are called on a runtime of your choice
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transfer_rust_ble::{
//!     BtleplugTransport, DispatcherConfig, EventDispatcher, EventSink, LinkEvent, MessageKind,
//!     Notifier, ObserverRegistry, Result, Scanner, ScannerConfig, ServiceDescriptor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (sink, queue) = EventSink::channel();
//!     let (notifier, link_events) = Notifier::channel();
//!     let transport = Arc::new(BtleplugTransport::new(sink).await?);
//!
//!     let scanner = Arc::new(Scanner::new(
//!         transport,
//!         ServiceDescriptor::default(),
//!         ScannerConfig::default(),
//!         notifier,
//!     ));
//!
//!     let config = DispatcherConfig::default();
//!     let observers = ObserverRegistry::from_config(&config);
//!     let mut events = observers.subscribe();
//!     let dispatcher = EventDispatcher::start(
//!         queue,
//!         scanner.clone(),
//!         link_events,
//!         observers,
//!         &tokio::runtime::Handle::current(),
//!         &config,
//!     );
//!
//!     scanner.start_scanning()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             LinkEvent::StateChanged { state, .. } if state.is_ready() => {
//!                 scanner.send_request(MessageKind::Hello)?;
//!             }
//!             LinkEvent::MessageReceived(message) => {
//!                 println!("Received {}", message);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! `btleplug` only implements the central role, so [`BtleplugTransport`]
//! drives a [`Scanner`]. An [`Advertiser`] needs a transport that can
//! publish services; [`SimulatedTransport`] does so in memory.
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and
//!   message types

// Public modules
pub mod advertiser;
pub mod ble;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod scanner;

// Re-exports for convenience
pub use advertiser::Advertiser;
pub use config::{AdvertiserConfig, DispatcherConfig, ScannerConfig, DEFAULT_RSSI_THRESHOLD};
pub use dispatcher::{EventDispatcher, EventHandler, EventQueue, EventSink};
pub use error::{Error, ErrorKind, Result};
pub use observer::{CallbackHandle, LinkEvent, Notifier, Observer, ObserverRegistry};
pub use scanner::Scanner;

// Re-export commonly used types from submodules
pub use ble::{
    Advertisement, BtleplugTransport, PeerId, PeerSession, ServiceDescriptor, SessionState,
    SimulatedAir, SimulatedTransport, Transport, TransportEvent, TransportState,
};
pub use protocol::{Direction, Message, MessageKind};
