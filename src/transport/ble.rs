//! The production [`Link`]: a `btleplug` central that discovers, connects
//! to, and exchanges frames with other mesh nodes over a single GATT
//! service (spec.md §4.2, §6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use lru::LruCache;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::framing::{self, Reassembler};
use super::link::{Link, TransportEvent};
use crate::error::TransportError;
use crate::identity::NodeId;

/// meshcore's GATT service and characteristics (spec.md §6).
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6d657368_636f_7265_0001_000000000000);
/// Central writes frame segments here.
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6d657368_636f_7265_0001_000000000001);
/// Central subscribes to notifications here for inbound segments.
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6d657368_636f_7265_0001_000000000002);

const GATT_MTU: usize = 180;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Undiscovered-peer entries older than this are pruned (spec.md §4.2).
const DISCOVERY_EXPIRY: Duration = Duration::from_secs(5 * 60);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX).min(BACKOFF_CAP.as_secs());
    Duration::from_secs(secs)
}

struct DiscoveredPeer {
    peripheral_id: PeripheralId,
    last_seen: Instant,
}

struct ConnectedPeer {
    peripheral: Peripheral,
    rx_char: Characteristic,
}

struct BackoffState {
    attempts: u32,
    next_attempt_at: Instant,
}

struct Inner {
    discovered: HashMap<NodeId, DiscoveredPeer>,
    connections: LruCache<NodeId, ConnectedPeer>,
    backoff: HashMap<NodeId, BackoffState>,
    reassembler: Reassembler,
    stream_counter: u32,
}

/// A `btleplug`-backed central. Node identity for a discovered peripheral is
/// learned from its advertised local name (set to the hex `NodeId`, matching
/// the advertising side of this same implementation); peripherals that
/// don't advertise a recognizable name are ignored.
pub struct BtlePlugLink {
    adapter: Adapter,
    max_connections: usize,
    packet_size_limit: usize,
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    inbound_queue_overflow: Arc<AtomicU64>,
}

/// Push onto a bounded inbound-event channel without blocking the caller
/// (a GATT notification task, the event pump, or `connect`/`disconnect`
/// themselves); a full queue means the dispatcher is falling behind, so the
/// event is dropped and counted rather than backing up the radio (spec.md §5).
fn try_send_event(
    tx: &mpsc::Sender<TransportEvent>,
    overflow: &AtomicU64,
    event: TransportEvent,
) {
    if let Err(TrySendError::Full(_)) = tx.try_send(event) {
        overflow.fetch_add(1, Ordering::Relaxed);
        warn!("inbound event queue full, dropping event");
    }
}

impl BtlePlugLink {
    pub async fn new(
        max_connections: usize,
        packet_size_limit: u32,
        inbound_queue_capacity: usize,
        inbound_queue_overflow: Arc<AtomicU64>,
    ) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;
        let adapter = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;

        let (events_tx, events_rx) = mpsc::channel(inbound_queue_capacity.max(1));
        let link = Self {
            adapter,
            max_connections: max_connections.max(1),
            packet_size_limit: packet_size_limit as usize,
            inner: Arc::new(Mutex::new(Inner {
                discovered: HashMap::new(),
                connections: LruCache::new(std::num::NonZeroUsize::new(max_connections.max(1)).unwrap()),
                backoff: HashMap::new(),
                reassembler: Reassembler::new(),
                stream_counter: 0,
            })),
            events_tx,
            events_rx: Mutex::new(events_rx),
            inbound_queue_overflow,
        };
        Ok(link)
    }

    fn node_id_from_local_name(name: &str) -> Option<NodeId> {
        if name.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&name[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(NodeId::from_bytes(bytes))
    }

    /// Spawn the task translating adapter-level central events into ours.
    async fn spawn_event_pump(&self) -> Result<(), TransportError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;
        let adapter = self.adapter.clone();
        let events_tx = self.events_tx.clone();
        let overflow = self.inbound_queue_overflow.clone();

        // Discovery bookkeeping lives behind the shared inner lock, so this
        // task only needs a way back into it — callers keep the `BtlePlugLink`
        // alive for the process lifetime, so a raw pointer dance isn't
        // needed: we instead re-derive NodeId from the peripheral's name
        // each time and let `connect` do the heavier lookups.
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if let Ok(peripheral) = adapter.peripheral(&id).await {
                            if let Ok(Some(props)) = peripheral.properties().await {
                                if let Some(name) = props.local_name {
                                    if let Some(node_id) = BtlePlugLink::node_id_from_local_name(&name) {
                                        try_send_event(&events_tx, &overflow, TransportEvent::PeerDiscovered(node_id));
                                    }
                                }
                            }
                        }
                    }
                    CentralEvent::DeviceDisconnected(_) => {
                        debug!("a peripheral dropped its link");
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }

    async fn find_peripheral_id(&self, peer: NodeId) -> Option<PeripheralId> {
        self.inner
            .lock()
            .await
            .discovered
            .get(&peer)
            .map(|d| d.peripheral_id.clone())
    }
}

#[async_trait]
impl Link for BtlePlugLink {
    async fn start_scan(&self) -> Result<(), TransportError> {
        self.spawn_event_pump().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.discovered.retain(|_, d| now.duration_since(d.last_seen) < DISCOVERY_EXPIRY);
        Ok(())
    }

    async fn connect(&self, peer: NodeId) -> Result<(), TransportError> {
        {
            let inner = self.inner.lock().await;
            if let Some(backoff) = inner.backoff.get(&peer) {
                if Instant::now() < backoff.next_attempt_at {
                    return Err(TransportError::NotConnected(peer));
                }
            }
        }

        let peripheral_id = self
            .find_peripheral_id(peer)
            .await
            .ok_or(TransportError::NotConnected(peer))?;
        let peripheral = self
            .adapter
            .peripheral(&peripheral_id)
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;

        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let rx_char = characteristics
            .iter()
            .find(|c| c.uuid == RX_CHAR_UUID)
            .cloned()
            .ok_or_else(|| TransportError::LinkError("RX characteristic not found".into()))?;
        let tx_char = characteristics
            .iter()
            .find(|c| c.uuid == TX_CHAR_UUID)
            .cloned()
            .ok_or_else(|| TransportError::LinkError("TX characteristic not found".into()))?;

        peripheral
            .subscribe(&tx_char)
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::LinkError(e.to_string()))?;
        let events_tx = self.events_tx.clone();
        let overflow = self.inbound_queue_overflow.clone();
        let inner = self.inner.clone();
        let packet_size_limit = self.packet_size_limit;
        tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                let frame = {
                    let mut inner = inner.lock().await;
                    inner.reassembler.accept(peer, &data.value, packet_size_limit)
                };
                if let Some(bytes) = frame {
                    try_send_event(&events_tx, &overflow, TransportEvent::FrameReceived { from: peer, bytes });
                }
            }
        });

        let evicted = {
            let mut inner = self.inner.lock().await;
            inner.backoff.remove(&peer);
            let evicted = if inner.connections.len() >= self.max_connections
                && !inner.connections.contains(&peer)
            {
                inner.connections.pop_lru().map(|(id, _)| id)
            } else {
                None
            };
            inner.connections.put(peer, ConnectedPeer { peripheral, rx_char });
            evicted
        };
        if let Some(evicted_peer) = evicted {
            let _ = self.disconnect(evicted_peer).await;
        }

        try_send_event(&self.events_tx, &self.inbound_queue_overflow, TransportEvent::PeerConnected(peer));
        Ok(())
    }

    async fn disconnect(&self, peer: NodeId) -> Result<(), TransportError> {
        let connected = self.inner.lock().await.connections.pop(&peer);
        if let Some(conn) = connected {
            let _ = conn.peripheral.disconnect().await;
        }
        try_send_event(&self.events_tx, &self.inbound_queue_overflow, TransportEvent::PeerDisconnected(peer));

        let mut inner = self.inner.lock().await;
        let attempts = inner.backoff.get(&peer).map(|b| b.attempts + 1).unwrap_or(1);
        inner.backoff.insert(
            peer,
            BackoffState {
                attempts,
                next_attempt_at: Instant::now() + backoff_delay(attempts),
            },
        );
        Ok(())
    }

    async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let (peripheral, rx_char, stream_id) = {
            let mut inner = self.inner.lock().await;
            let stream_id = inner.stream_counter;
            inner.stream_counter = inner.stream_counter.wrapping_add(1);
            let conn = inner
                .connections
                .get(&peer)
                .ok_or(TransportError::NotConnected(peer))?;
            (conn.peripheral.clone(), conn.rx_char.clone(), stream_id)
        };

        for seg in framing::segment(&bytes, GATT_MTU, stream_id) {
            tokio::time::timeout(
                SEND_TIMEOUT,
                peripheral.write(&rx_char, &seg, WriteType::WithoutResponse),
            )
            .await
            .map_err(|_| TransportError::Timeout(peer))?
            .map_err(|e| TransportError::LinkError(e.to_string()))?;
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn sweep_reassembly(&self) {
        self.inner.lock().await.reassembler.sweep_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), BACKOFF_CAP);
    }

    #[test]
    fn local_name_round_trips_node_id() {
        let id = NodeId::from_bytes([0xab; 16]);
        let name = id.to_string();
        assert_eq!(BtlePlugLink::node_id_from_local_name(&name), Some(id));
    }

    #[test]
    fn malformed_local_name_is_ignored() {
        assert_eq!(BtlePlugLink::node_id_from_local_name("not-a-node-id"), None);
    }
}
