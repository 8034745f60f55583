//! The BLE transport boundary (spec.md §4.2).

pub mod ble;
pub mod framing;
pub mod link;
pub mod loopback;

pub use ble::BtlePlugLink;
pub use link::{Link, TransportEvent};
pub use loopback::{LoopbackLink, LoopbackNetwork};
