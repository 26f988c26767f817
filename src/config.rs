//! Controller and dispatcher configuration.

use std::time::Duration;

use crate::ble::uuids::ADVERTISED_LOCAL_NAME;

/// Default minimum signal strength for adopting a discovered peer, in dBm.
pub const DEFAULT_RSSI_THRESHOLD: i16 = -70;

/// Scanner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScannerConfig {
    /// Discovery events weaker than this are ignored.
    pub rssi_threshold: i16,
    /// Force a stalled handshake to disconnect after this long. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Ask the transport to report repeated advertisements of the same peer.
    pub allow_duplicates: bool,
}

impl ScannerConfig {
    /// Set the signal strength threshold.
    pub fn with_rssi_threshold(mut self, rssi_threshold: i16) -> Self {
        self.rssi_threshold = rssi_threshold;
        self
    }

    /// Enable the handshake watchdog.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Set whether duplicate advertisements are reported.
    pub fn with_allow_duplicates(mut self, allow_duplicates: bool) -> Self {
        self.allow_duplicates = allow_duplicates;
        self
    }

    /// Check if a discovery at `rssi` is close enough to adopt.
    pub fn accepts_rssi(&self, rssi: i16) -> bool {
        rssi >= self.rssi_threshold
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rssi_threshold: DEFAULT_RSSI_THRESHOLD,
            handshake_timeout: None,
            allow_duplicates: false,
        }
    }
}

/// Advertiser settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertiserConfig {
    /// Local name placed in the advertisement.
    pub local_name: Option<String>,
}

impl AdvertiserConfig {
    /// Set the advertised local name.
    pub fn with_local_name(mut self, local_name: Option<String>) -> Self {
        self.local_name = local_name;
        self
    }
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self {
            local_name: Some(ADVERTISED_LOCAL_NAME.to_string()),
        }
    }
}

/// Event dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DispatcherConfig {
    /// Interval between watchdog ticks.
    pub tick_interval: Duration,
    /// Events buffered per broadcast subscriber.
    pub broadcast_capacity: usize,
}

impl DispatcherConfig {
    /// Set the tick interval.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Set how many events each broadcast subscriber may lag behind.
    pub fn with_broadcast_capacity(mut self, broadcast_capacity: usize) -> Self {
        self.broadcast_capacity = broadcast_capacity;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            broadcast_capacity: 64,
        }
    }
}
