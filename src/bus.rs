//! The message bus: how the mesh dispatcher tells the outside world (UI,
//! tests, other consumers) what happened (spec.md §4.5).
//!
//! `peer_state`, `transport_event`, and `handshake` are coalescing topics —
//! a slow subscriber just misses old events (`broadcast::Receiver::recv`
//! returns `Lagged`, which callers are expected to skip past). `message` is
//! not allowed to silently drop anything, so it's a bounded `mpsc` per
//! subscriber instead of a broadcast channel.

use tokio::sync::{broadcast, mpsc};

use crate::crypto::HandshakeStatus;
use crate::identity::NodeId;
use crate::transport::TransportEvent;

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: NodeId,
    pub origin: NodeId,
    pub body: Vec<u8>,
    pub ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct PeerStateEvent {
    pub peer: NodeId,
    pub state: PeerState,
}

#[derive(Debug, Clone)]
pub struct HandshakeEvent {
    pub peer: NodeId,
    pub status: HandshakeStatus,
}

const BROADCAST_CAPACITY: usize = 256;
/// Default bound for each subscriber's `message` mpsc (spec.md §4.5).
pub const DEFAULT_MESSAGE_CHANNEL_CAPACITY: usize = 256;

pub struct MessageBus {
    peer_state_tx: broadcast::Sender<PeerStateEvent>,
    transport_event_tx: broadcast::Sender<TransportEvent>,
    handshake_tx: broadcast::Sender<HandshakeEvent>,
    message_subscribers: tokio::sync::Mutex<Vec<mpsc::Sender<InboundMessage>>>,
    message_channel_capacity: usize,
}

impl MessageBus {
    pub fn new(message_channel_capacity: usize) -> Self {
        let (peer_state_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (transport_event_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (handshake_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            peer_state_tx,
            transport_event_tx,
            handshake_tx,
            message_subscribers: tokio::sync::Mutex::new(Vec::new()),
            message_channel_capacity,
        }
    }

    pub fn publish_peer_state(&self, event: PeerStateEvent) {
        let _ = self.peer_state_tx.send(event);
    }

    pub fn publish_transport_event(&self, event: TransportEvent) {
        let _ = self.transport_event_tx.send(event);
    }

    pub fn publish_handshake(&self, event: HandshakeEvent) {
        let _ = self.handshake_tx.send(event);
    }

    /// Deliver an inbound message to every `message` subscriber, applying
    /// backpressure rather than dropping (spec.md §4.5). A subscriber whose
    /// channel has been dropped is pruned.
    pub async fn publish_message(&self, message: InboundMessage) {
        let mut subs = self.message_subscribers.lock().await;
        let mut still_alive = Vec::with_capacity(subs.len());
        for sub in subs.drain(..) {
            if sub.send(message.clone()).await.is_ok() {
                still_alive.push(sub);
            }
        }
        *subs = still_alive;
    }

    pub fn subscribe_peer_state(&self) -> broadcast::Receiver<PeerStateEvent> {
        self.peer_state_tx.subscribe()
    }

    pub fn subscribe_transport_event(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport_event_tx.subscribe()
    }

    pub fn subscribe_handshake(&self) -> broadcast::Receiver<HandshakeEvent> {
        self.handshake_tx.subscribe()
    }

    pub async fn subscribe_message(&self) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(self.message_channel_capacity);
        self.message_subscribers.lock().await.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_topic_delivers_to_all_subscribers() {
        let bus = MessageBus::new(DEFAULT_MESSAGE_CHANNEL_CAPACITY);
        let mut a = bus.subscribe_message().await;
        let mut b = bus.subscribe_message().await;

        bus.publish_message(InboundMessage {
            chat_id: NodeId::random(),
            origin: NodeId::random(),
            body: b"hi".to_vec(),
            ts: 0,
        })
        .await;

        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_not_blocking() {
        let bus = MessageBus::new(1);
        {
            let _dropped = bus.subscribe_message().await;
        }
        bus.publish_message(InboundMessage {
            chat_id: NodeId::random(),
            origin: NodeId::random(),
            body: vec![],
            ts: 0,
        })
        .await;
        assert_eq!(bus.message_subscribers.lock().await.len(), 0);
    }

    #[test]
    fn peer_state_broadcast_reaches_late_subscriber_lag_tolerant() {
        let bus = MessageBus::new(DEFAULT_MESSAGE_CHANNEL_CAPACITY);
        let mut rx = bus.subscribe_peer_state();
        bus.publish_peer_state(PeerStateEvent {
            peer: NodeId::random(),
            state: PeerState::Connected,
        });
        assert!(rx.try_recv().is_ok());
    }
}
