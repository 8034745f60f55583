//! An in-memory [`Link`] implementation wiring two or more nodes together
//! without real BLE hardware. This is how the end-to-end scenarios in
//! spec.md §8 (broadcast across three nodes, a ring topology, etc.) run as
//! ordinary `#[tokio::test]`s.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::link::{Link, TransportEvent};
use crate::error::TransportError;
use crate::identity::NodeId;

/// Shared registry every [`LoopbackLink`] in a test topology joins.
pub struct LoopbackNetwork {
    nodes: Mutex<Vec<(NodeId, mpsc::Sender<TransportEvent>, Arc<AtomicU64>)>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(Vec::new()),
        })
    }

    /// Register `node` and return its link handle. `overflow` should be the
    /// same counter the owning `MeshProtocol`'s `Counters::inbound_queue_overflow`
    /// was built with, so a dropped event and the metric that reports it agree
    /// (spec.md §5).
    pub fn join(self: &Arc<Self>, node: NodeId, capacity: usize, overflow: Arc<AtomicU64>) -> LoopbackLink {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.nodes.lock().unwrap().push((node, tx, overflow));
        LoopbackLink {
            local: node,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            connected: Mutex::new(HashSet::new()),
        }
    }

    fn send_to(&self, peer: NodeId, event: TransportEvent) {
        let nodes = self.nodes.lock().unwrap();
        if let Some((_, tx, overflow)) = nodes.iter().find(|(id, _, _)| *id == peer) {
            if let Err(TrySendError::Full(_)) = tx.try_send(event) {
                overflow.fetch_add(1, Ordering::Relaxed);
                warn!("inbound event queue full, dropping event");
            }
        }
    }

    fn peers_other_than(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, _)| *id)
            .filter(|id| *id != node)
            .collect()
    }
}

pub struct LoopbackLink {
    local: NodeId,
    network: Arc<LoopbackNetwork>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
    connected: Mutex<HashSet<NodeId>>,
}

#[async_trait]
impl Link for LoopbackLink {
    async fn start_scan(&self) -> Result<(), TransportError> {
        for peer in self.network.peers_other_than(self.local) {
            self.network.send_to(self.local, TransportEvent::PeerDiscovered(peer));
        }
        Ok(())
    }

    async fn connect(&self, peer: NodeId) -> Result<(), TransportError> {
        self.connected.lock().unwrap().insert(peer);
        self.network.send_to(self.local, TransportEvent::PeerConnected(peer));
        self.network.send_to(peer, TransportEvent::PeerConnected(self.local));
        Ok(())
    }

    async fn disconnect(&self, peer: NodeId) -> Result<(), TransportError> {
        self.connected.lock().unwrap().remove(&peer);
        self.network.send_to(self.local, TransportEvent::PeerDisconnected(peer));
        self.network.send_to(peer, TransportEvent::PeerDisconnected(self.local));
        Ok(())
    }

    async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.lock().unwrap().contains(&peer) {
            return Err(TransportError::NotConnected(peer));
        }
        self.network.send_to(
            peer,
            TransportEvent::FrameReceived {
                from: self.local,
                bytes,
            },
        );
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.inbox.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_then_send_delivers_frame() {
        let net = LoopbackNetwork::new();
        let a_id = NodeId::random();
        let b_id = NodeId::random();
        let a = net.join(a_id, 1024, Arc::new(AtomicU64::new(0)));
        let b = net.join(b_id, 1024, Arc::new(AtomicU64::new(0)));

        a.connect(b_id).await.unwrap();
        assert!(matches!(
            b.next_event().await,
            Some(TransportEvent::PeerConnected(id)) if id == a_id
        ));
        assert!(matches!(
            a.next_event().await,
            Some(TransportEvent::PeerConnected(id)) if id == b_id
        ));

        a.send(b_id, vec![1, 2, 3]).await.unwrap();
        match b.next_event().await {
            Some(TransportEvent::FrameReceived { from, bytes }) => {
                assert_eq!(from, a_id);
                assert_eq!(bytes, vec![1, 2, 3]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let net = LoopbackNetwork::new();
        let a = net.join(NodeId::random(), 1024, Arc::new(AtomicU64::new(0)));
        let b_id = NodeId::random();
        net.join(b_id, 1024, Arc::new(AtomicU64::new(0)));
        assert!(matches!(
            a.send(b_id, vec![]).await,
            Err(TransportError::NotConnected(_))
        ));
    }
}
