//! Advertisement packet contents.
//!
//! The advertiser announces the transfer service UUID and an optional local
//! name; the scanner uses the advertised service list to drop peripherals
//! that slipped through a platform scan filter.

use uuid::Uuid;

use crate::ble::uuids::ServiceDescriptor;

/// Data placed in (or parsed from) an advertisement packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
}

impl Advertisement {
    /// Build the advertisement for a service.
    pub fn for_service(descriptor: &ServiceDescriptor, local_name: Option<&str>) -> Self {
        Self {
            local_name: local_name.map(str::to_string),
            service_uuids: vec![descriptor.service_uuid],
        }
    }

    /// Check if the advertisement lists the given service.
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }

    /// Check if a discovered peripheral could expose `descriptor`'s service.
    ///
    /// An empty service list is accepted: some platforms deliver discovery
    /// events before the scan response with the UUID list arrives.
    pub fn matches(&self, descriptor: &ServiceDescriptor) -> bool {
        self.service_uuids.is_empty() || self.advertises(&descriptor.service_uuid)
    }
}
