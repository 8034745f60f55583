//! The transport abstraction the mesh dispatcher talks to. Production code
//! runs on [`crate::transport::ble::BtlePlugLink`]; tests wire two or more
//! in-process nodes together with [`crate::transport::loopback::LoopbackLink`]
//! so the end-to-end scenarios don't need real radios (spec.md §4.2).

use async_trait::async_trait;

use crate::error::TransportError;
use crate::identity::NodeId;

/// Something that happened on the transport, surfaced to the Mesh Protocol
/// component (spec.md §4.2).
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerDiscovered(NodeId),
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
    FrameReceived { from: NodeId, bytes: Vec<u8> },
}

/// A BLE-like link: scan, connect, send, and an event stream. `&self`
/// methods so the dispatcher can hold a single `Arc<dyn Link>` without
/// fighting the borrow checker across awaits; implementations use interior
/// mutability where real mutable state (connection pool, pending reads) is
/// needed.
#[async_trait]
pub trait Link: Send + Sync {
    async fn start_scan(&self) -> Result<(), TransportError>;
    async fn connect(&self, peer: NodeId) -> Result<(), TransportError>;
    async fn disconnect(&self, peer: NodeId) -> Result<(), TransportError>;
    async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Pull the next transport event, or `None` once the link is shut down.
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Drop any reassembly state that's been idle too long. A no-op for
    /// links that don't fragment (e.g. the in-process loopback).
    async fn sweep_reassembly(&self) {}
}
