//! BLE Service and Characteristic UUIDs.
//!
//! Contains the identifiers shared by the scanner and advertiser roles and
//! the [`ServiceDescriptor`] built from them.

use btleplug::api::CharPropFlags;
use uuid::Uuid;

/// Transfer Service UUID.
pub const TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0xe20a39f4_73f5_4bc4_a12f_17d1ad07a961);
/// Transfer Characteristic UUID (Notify, Write Without Response).
pub const TRANSFER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x08590f7e_db05_467e_8757_72f6faeb13d4);

/// Identifier the platform uses to hand back live state after a cold start.
pub const RESTORE_IDENTIFIER: &str = "33458d15-49b3-4188-85fb-50e36aae5cc4";

/// Local name placed in the advertisement packet.
pub const ADVERTISED_LOCAL_NAME: &str = "airkeyfc61";

/// Access permissions on a published characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttributePermissions {
    /// Remote peers may read the value.
    pub readable: bool,
    /// Remote peers may write the value.
    pub writable: bool,
}

/// Immutable description of the service both roles agree on.
///
/// A peer exposing a different service or characteristic identifier is
/// never adopted into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service identifier.
    pub service_uuid: Uuid,
    /// The single characteristic used for requests and responses.
    pub characteristic_uuid: Uuid,
    /// Identifier used to resume state after a cold start.
    pub restore_identifier: String,
    /// Characteristic properties.
    pub properties: CharPropFlags,
    /// Characteristic permissions.
    pub permissions: AttributePermissions,
}

impl ServiceDescriptor {
    /// Create a descriptor for a custom service/characteristic pair.
    pub fn new(service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            characteristic_uuid,
            restore_identifier: RESTORE_IDENTIFIER.to_string(),
            properties: CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE,
            permissions: AttributePermissions {
                readable: true,
                writable: true,
            },
        }
    }

    /// Set the restore identifier.
    pub fn with_restore_identifier(mut self, restore_identifier: impl Into<String>) -> Self {
        self.restore_identifier = restore_identifier.into();
        self
    }

    /// Check whether a service UUID is this descriptor's service.
    pub fn is_service(&self, uuid: &Uuid) -> bool {
        *uuid == self.service_uuid
    }

    /// Check whether a characteristic UUID is this descriptor's characteristic.
    pub fn is_characteristic(&self, uuid: &Uuid) -> bool {
        *uuid == self.characteristic_uuid
    }
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self::new(TRANSFER_SERVICE_UUID, TRANSFER_CHARACTERISTIC_UUID)
    }
}
