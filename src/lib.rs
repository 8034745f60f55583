//! An offline, decentralized messenger core carried over Bluetooth Low
//! Energy: envelope codec, crypto, BLE transport, mesh flooding, durable
//! storage and the UI-facing API. See `DESIGN.md` for how each piece maps
//! back to its grounding.

pub mod api;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod mesh;
pub mod persistence;
pub mod runtime;
pub mod transport;

pub use api::{Api, ExportFormat, Subscription, Topic};
pub use config::Config;
pub use error::{MeshError, Result};
pub use identity::{Identity, NodeId};
pub use runtime::Runtime;
