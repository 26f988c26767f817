//! BLE transport layer.
//!
//! Service identifiers, advertisement contents, the transport adapter
//! boundary, and the peer session state machine shared by both roles.

pub mod advertising;
pub mod central;
pub mod session;
pub mod simulated;
pub mod transport;
pub mod uuids;

pub use advertising::Advertisement;
pub use central::BtleplugTransport;
pub use session::{PeerSession, SessionState};
pub use simulated::{Command, SimulatedAir, SimulatedTransport};
pub use transport::{
    CharacteristicHandle, PeerId, RestoredPeripheral, Transport, TransportEvent, TransportState,
    WriteRequest,
};
pub use uuids::*;
