//! The mesh protocol: the inbound/outbound pipelines, flooding policy,
//! outbox, and file chunking (spec.md §4.4).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{HandshakeEvent, InboundMessage, MessageBus, PeerState, PeerStateEvent};
use crate::config::Config;
use crate::crypto::{GroupChannel, HandshakeRole, HandshakeStatus, PairwiseSession};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{CryptoError, HandshakeFailed, PolicyError};
use crate::identity::{Identity, NodeId};
use crate::persistence::{MessageRecord, MessageState, PeerRecord, RouteHint, Store};
use crate::transport::{Link, TransportEvent};

/// File reassembly buffers idle this long are garbage-collected
/// (spec.md §4.4).
const CHUNK_GC_IDLE: Duration = Duration::from_secs(10 * 60);
/// Outbox entries older than this are dropped on the periodic sweep.
const OUTBOX_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;
/// Base64 payload bytes carried per `FILE_CHUNK` envelope.
const FILE_CHUNK_SIZE: usize = 2048;
/// A handshake stuck in `INIT_SENT` longer than this gets resent
/// (spec.md §4.3).
const HANDSHAKE_RETRY_AFTER: Duration = Duration::from_secs(10);
/// Total `HANDSHAKE_INIT` sends before giving up and surfacing
/// `HandshakeFailed` (spec.md §4.3).
const HANDSHAKE_MAX_ATTEMPTS: u32 = 3;

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The concrete form of "they become counters" (spec.md §7, §9).
///
/// `inbound_queue_overflow` is an `Arc` rather than a bare `AtomicU64`: the
/// bounded inbound-event channel (spec.md §5) lives inside the `Link`
/// implementation, which is constructed before the `MeshProtocol` that owns
/// this struct, so the same atomic is handed to both at construction time
/// (see `Runtime::start`/`start_with_link`) instead of being read back out
/// of the link after the fact.
#[derive(Default)]
pub struct Counters {
    pub envelopes_seen: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub relayed: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub policy_drops: AtomicU64,
    pub codec_drops: AtomicU64,
    pub outbox_overflow: AtomicU64,
    pub outbox_age_outs: AtomicU64,
    pub inbound_queue_overflow: Arc<AtomicU64>,
}

/// A point-in-time copy of [`Counters`], safe to hand to callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshMetrics {
    pub envelopes_seen: u64,
    pub duplicates_dropped: u64,
    pub relayed: u64,
    pub decrypt_failures: u64,
    pub policy_drops: u64,
    pub codec_drops: u64,
    pub outbox_overflow: u64,
    pub outbox_age_outs: u64,
    pub inbound_queue_overflow: u64,
}

impl Counters {
    fn snapshot(&self) -> MeshMetrics {
        MeshMetrics {
            envelopes_seen: self.envelopes_seen.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            policy_drops: self.policy_drops.load(Ordering::Relaxed),
            codec_drops: self.codec_drops.load(Ordering::Relaxed),
            outbox_overflow: self.outbox_overflow.load(Ordering::Relaxed),
            outbox_age_outs: self.outbox_age_outs.load(Ordering::Relaxed),
            inbound_queue_overflow: self.inbound_queue_overflow.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReactionPayload {
    pub target_msg_id: Uuid,
    pub emoji: String,
}

impl ReactionPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 2 + self.emoji.len());
        out.extend_from_slice(self.target_msg_id.as_bytes());
        out.extend_from_slice(&(self.emoji.len() as u16).to_be_bytes());
        out.extend_from_slice(self.emoji.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 18 {
            return None;
        }
        let target_msg_id = Uuid::from_bytes(buf[0..16].try_into().ok()?);
        let len = u16::from_be_bytes(buf[16..18].try_into().ok()?) as usize;
        let emoji = String::from_utf8(buf.get(18..18 + len)?.to_vec()).ok()?;
        Some(Self { target_msg_id, emoji })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TypingPayload {
    pub active: bool,
}

impl TypingPayload {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.active as u8]
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        buf.first().map(|b| Self { active: *b != 0 })
    }
}

struct ChunkAssembly {
    mime: String,
    total: u16,
    chunks: HashMap<u16, Vec<u8>>,
    last_touched: std::time::Instant,
}

/// The mesh dispatcher: one instance per running node, driving the inbound
/// and outbound pipelines (spec.md §4.4, §5: "single dispatcher task").
pub struct MeshProtocol {
    identity: Identity,
    config: Arc<Config>,
    store: Arc<Store>,
    link: Arc<dyn Link>,
    bus: Arc<MessageBus>,
    group: GroupChannel,
    sessions: Mutex<HashMap<NodeId, PairwiseSession>>,
    connected: Mutex<HashSet<NodeId>>,
    chunks: Mutex<HashMap<Uuid, ChunkAssembly>>,
    /// Pairwise text messages waiting on a handshake to reach
    /// `Established` before they can be encrypted (spec.md §8 scenario S3:
    /// `send_text` on a session-less peer kicks off the handshake itself).
    pending: Mutex<HashMap<NodeId, Vec<(Uuid, Vec<u8>)>>>,
    pub counters: Counters,
    shutdown: CancellationToken,
}

impl MeshProtocol {
    /// `inbound_queue_overflow` must be the same `Arc` handed to `link` at
    /// its own construction, so the two share one counter (see
    /// [`Counters`]'s doc comment).
    pub fn new(
        identity: Identity,
        config: Arc<Config>,
        store: Arc<Store>,
        link: Arc<dyn Link>,
        bus: Arc<MessageBus>,
        group: GroupChannel,
        shutdown: CancellationToken,
        inbound_queue_overflow: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            config,
            store,
            link,
            bus,
            group,
            sessions: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            chunks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            counters: Counters { inbound_queue_overflow, ..Counters::default() },
            shutdown,
        })
    }

    pub fn metrics(&self) -> MeshMetrics {
        self.counters.snapshot()
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id
    }

    /// Drive the transport event stream until shutdown. This is the single
    /// dispatcher task spec.md §5 describes: every inbound frame, peer
    /// event, and handshake step is processed here, serially.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.link.next_event() => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        self.bus.publish_transport_event(event.clone());
        match event {
            TransportEvent::PeerDiscovered(peer) => {
                let _ = self.store.peer_upsert(&PeerRecord {
                    node_id: peer,
                    display_name: None,
                    last_seen_ts: now_ts(),
                });
                self.bus.publish_peer_state(PeerStateEvent { peer, state: PeerState::Discovered });
            }
            TransportEvent::PeerConnected(peer) => {
                self.connected.lock().await.insert(peer);
                self.bus.publish_peer_state(PeerStateEvent { peer, state: PeerState::Connected });
                self.flush_outbox_for(peer).await;
            }
            TransportEvent::PeerDisconnected(peer) => {
                self.connected.lock().await.remove(&peer);
                self.bus.publish_peer_state(PeerStateEvent { peer, state: PeerState::Disconnected });
            }
            TransportEvent::FrameReceived { from, bytes } => {
                self.handle_inbound(from, bytes).await;
            }
        }
    }

    // ---- inbound pipeline (spec.md §4.4) --------------------------------

    async fn handle_inbound(self: &Arc<Self>, from: NodeId, raw: Vec<u8>) {
        self.counters.envelopes_seen.fetch_add(1, Ordering::Relaxed);

        let envelope = match Envelope::decode(&raw) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "dropping malformed envelope");
                self.counters.codec_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if envelope.check_size_limit(self.config.packet_size_limit).is_err() {
            self.counters.codec_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // 1. dedupe
        match self.store.seen_contains_or_insert(envelope.msg_id) {
            Ok(true) => {
                self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!(error = %e, "seen-store write failed, treating as duplicate to be safe");
                return;
            }
            Ok(false) => {}
        }

        // 2. block check
        if self.store.block_contains(envelope.origin).unwrap_or(false) {
            return;
        }
        if envelope.origin == self.identity.node_id {
            warn!(error = %PolicyError::SelfOrigin, "dropping");
            self.counters.policy_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if envelope.ttl > self.config.max_ttl {
            warn!(error = %PolicyError::TtlExceeded(envelope.ttl, self.config.max_ttl), "dropping");
            self.counters.policy_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // 3. route observe
        let _ = self.store.route_observe(RouteHint {
            peer: envelope.origin,
            next_hop: from,
            hop_count: envelope.hop,
            last_seen_ts: now_ts(),
        });
        let _ = self.store.peer_upsert(&PeerRecord {
            node_id: envelope.origin,
            display_name: None,
            last_seen_ts: now_ts(),
        });

        // 4. address match / decrypt
        let addressed_to_us = envelope.dest == self.identity.node_id || envelope.dest.is_broadcast();
        if addressed_to_us {
            if let Err(e) = self.decrypt_and_dispatch(&envelope).await {
                debug!(error = %e, origin = %envelope.origin, "decrypt failed");
                self.counters.decrypt_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        // 5. relay (flooding)
        if envelope.ttl > 1 {
            self.relay(envelope, from).await;
        }
    }

    async fn relay(self: &Arc<Self>, mut envelope: Envelope, from: NodeId) {
        envelope.ttl -= 1;
        envelope.hop = envelope.hop.saturating_add(1);
        let bytes = envelope.encode();
        self.counters.relayed.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<NodeId> = self
            .connected
            .lock()
            .await
            .iter()
            .copied()
            .filter(|p| *p != from)
            .collect();
        for peer in targets {
            if let Err(e) = self.link.send(peer, bytes.clone()).await {
                debug!(error = %e, %peer, "relay send failed");
            }
        }
    }

    async fn decrypt_and_dispatch(self: &Arc<Self>, envelope: &Envelope) -> Result<(), CryptoError> {
        let aad = envelope.aad();
        match envelope.kind {
            EnvelopeKind::HandshakeInit => {
                self.handle_handshake_init(envelope).await;
                Ok(())
            }
            EnvelopeKind::HandshakeResp => {
                self.handle_handshake_resp(envelope).await;
                Ok(())
            }
            EnvelopeKind::Text | EnvelopeKind::Reaction | EnvelopeKind::Typing => {
                let plaintext = self.decrypt_body(envelope, &aad).await?;
                self.store
                    .message_put(&MessageRecord {
                        msg_id: envelope.msg_id,
                        chat_id: if envelope.dest.is_broadcast() { NodeId::BROADCAST } else { envelope.origin },
                        origin: envelope.origin,
                        dest: envelope.dest,
                        kind: envelope.kind,
                        body: plaintext.clone(),
                        ts: envelope.ts,
                        seq: envelope.seq,
                        state: MessageState::Received,
                    })
                    .ok();
                self.bus
                    .publish_message(InboundMessage {
                        chat_id: if envelope.dest.is_broadcast() { NodeId::BROADCAST } else { envelope.origin },
                        origin: envelope.origin,
                        body: plaintext,
                        ts: envelope.ts,
                    })
                    .await;
                // spec.md §4.4 step 4: a TEXT addressed directly to us (not
                // broadcast) is acknowledged so the sender can mark its
                // outgoing record Delivered.
                if envelope.kind == EnvelopeKind::Text && !envelope.dest.is_broadcast() {
                    self.send_ack(envelope.origin, envelope.msg_id).await;
                }
                Ok(())
            }
            EnvelopeKind::FileChunk => {
                let plaintext = self.decrypt_body(envelope, &aad).await?;
                self.handle_file_chunk(envelope, plaintext).await;
                Ok(())
            }
            EnvelopeKind::Ack => {
                if let Ok(acked) = <[u8; 16]>::try_from(envelope.ciphertext.as_slice()) {
                    let _ = self
                        .store
                        .message_update_state(Uuid::from_bytes(acked), MessageState::Delivered);
                }
                Ok(())
            }
            EnvelopeKind::Presence => Ok(()),
        }
    }

    /// Send an `ACK` for `acked_msg_id` back to `to` (spec.md §4.4 step 4).
    /// The acked id travels in cleartext in `ciphertext`, the same way the
    /// handshake envelopes carry their ephemeral public keys unencrypted —
    /// an `ACK` has nothing secret to say.
    async fn send_ack(self: &Arc<Self>, to: NodeId, acked_msg_id: Uuid) {
        let envelope = Envelope {
            msg_id: Uuid::new_v4(),
            origin: self.identity.node_id,
            dest: to,
            kind: EnvelopeKind::Ack,
            ttl: self.config.max_ttl,
            hop: 0,
            ts: now_ts(),
            seq: 0,
            nonce: [0u8; 12],
            ciphertext: acked_msg_id.as_bytes().to_vec(),
        };
        let _ = self.store.seen_contains_or_insert(envelope.msg_id);
        self.transmit_or_outbox(envelope).await;
    }

    async fn decrypt_body(&self, envelope: &Envelope, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.dest.is_broadcast() {
            return self.group.decrypt(&envelope.nonce, &envelope.ciphertext, aad);
        }
        let counter = u64::from_be_bytes(envelope.nonce[4..12].try_into().unwrap());
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&envelope.origin).ok_or(CryptoError::NoSession)?;
        let chain = session.recv_chain_mut().ok_or(CryptoError::NoSession)?;
        let key = chain.accept(counter)?;
        crate::crypto::aead_decrypt(&key, &envelope.nonce, aad, &envelope.ciphertext)
    }

    async fn handle_handshake_init(self: &Arc<Self>, envelope: &Envelope) {
        if envelope.ciphertext.len() != 32 {
            return;
        }
        let mut peer_public = [0u8; 32];
        peer_public.copy_from_slice(&envelope.ciphertext);

        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(envelope.origin)
            .or_insert_with(|| PairwiseSession::new(envelope.origin, HandshakeRole::Responder));
        let our_public = session.respond(peer_public);
        let status = session.status();
        drop(sessions);

        self.bus.publish_handshake(HandshakeEvent { peer: envelope.origin, status });

        let resp = Envelope {
            msg_id: Uuid::new_v4(),
            origin: self.identity.node_id,
            dest: envelope.origin,
            kind: EnvelopeKind::HandshakeResp,
            ttl: self.config.max_ttl,
            hop: 0,
            ts: now_ts(),
            seq: 0,
            nonce: [0u8; 12],
            ciphertext: our_public.to_vec(),
        };
        let _ = self.store.seen_contains_or_insert(resp.msg_id);
        self.transmit_or_outbox(resp).await;
    }

    async fn handle_handshake_resp(self: &Arc<Self>, envelope: &Envelope) {
        if envelope.ciphertext.len() != 32 {
            return;
        }
        let mut peer_public = [0u8; 32];
        peer_public.copy_from_slice(&envelope.ciphertext);

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&envelope.origin) {
            let established = session.complete(peer_public);
            let status = session.status();
            drop(sessions);
            self.bus.publish_handshake(HandshakeEvent { peer: envelope.origin, status });
            if established {
                self.flush_pending_for(envelope.origin).await;
            }
        }
    }

    async fn handle_file_chunk(self: &Arc<Self>, envelope: &Envelope, payload: Vec<u8>) {
        // payload layout: file_id(16) | chunk_idx(2) | total(2) | mime_len(2) | mime | data
        if payload.len() < 22 {
            return;
        }
        let file_id = Uuid::from_bytes(payload[0..16].try_into().unwrap());
        let chunk_idx = u16::from_be_bytes(payload[16..18].try_into().unwrap());
        let total = u16::from_be_bytes(payload[18..20].try_into().unwrap());
        let mime_len = u16::from_be_bytes(payload[20..22].try_into().unwrap()) as usize;
        if payload.len() < 22 + mime_len {
            return;
        }
        let mime = String::from_utf8_lossy(&payload[22..22 + mime_len]).to_string();
        let data = payload[22 + mime_len..].to_vec();

        let mut chunks = self.chunks.lock().await;
        let assembly = chunks.entry(file_id).or_insert_with(|| ChunkAssembly {
            mime: mime.clone(),
            total,
            chunks: HashMap::new(),
            last_touched: std::time::Instant::now(),
        });
        assembly.chunks.insert(chunk_idx, data);
        assembly.last_touched = std::time::Instant::now();

        if assembly.chunks.len() == assembly.total as usize {
            let mut b64 = Vec::new();
            for idx in 0..assembly.total {
                if let Some(part) = assembly.chunks.get(&idx) {
                    b64.extend_from_slice(part);
                }
            }
            let mime = assembly.mime.clone();
            chunks.remove(&file_id);
            drop(chunks);

            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&b64) {
                self.bus
                    .publish_message(InboundMessage {
                        chat_id: if envelope.dest.is_broadcast() { NodeId::BROADCAST } else { envelope.origin },
                        origin: envelope.origin,
                        body: bytes,
                        ts: envelope.ts,
                    })
                    .await;
                debug!(%file_id, %mime, "file reassembled");
            }
        }
    }

    /// Drop reassembly buffers idle past `CHUNK_GC_IDLE` (spec.md §4.4).
    pub async fn gc_chunks(&self) {
        self.chunks
            .lock()
            .await
            .retain(|_, a| a.last_touched.elapsed() < CHUNK_GC_IDLE);
    }

    // ---- outbound pipeline (spec.md §4.4) -------------------------------

    pub async fn send_text(self: &Arc<Self>, chat_id: NodeId, body: &[u8]) -> Result<Uuid, CryptoError> {
        let msg_id = Uuid::new_v4();

        if !chat_id.is_broadcast() {
            let established = self
                .sessions
                .lock()
                .await
                .get(&chat_id)
                .map(|s| s.is_established())
                .unwrap_or(false);
            if !established {
                self.store
                    .message_put(&MessageRecord {
                        msg_id,
                        chat_id,
                        origin: self.identity.node_id,
                        dest: chat_id,
                        kind: EnvelopeKind::Text,
                        body: body.to_vec(),
                        ts: now_ts(),
                        seq: 0,
                        state: MessageState::Pending,
                    })
                    .ok();
                self.pending.lock().await.entry(chat_id).or_default().push((msg_id, body.to_vec()));
                self.begin_handshake(chat_id).await;
                return Ok(msg_id);
            }
        }

        self.encrypt_and_transmit_text(msg_id, chat_id, body).await?;
        Ok(msg_id)
    }

    async fn encrypt_and_transmit_text(
        self: &Arc<Self>,
        msg_id: Uuid,
        chat_id: NodeId,
        body: &[u8],
    ) -> Result<(), CryptoError> {
        let aad_prefix = AadPrefix {
            msg_id,
            origin: self.identity.node_id,
            dest: chat_id,
            kind: EnvelopeKind::Text,
            seq: 0,
        };
        let (nonce, ciphertext) = self.encrypt_for(chat_id, body, &aad_prefix).await?;

        let envelope = Envelope {
            msg_id,
            origin: self.identity.node_id,
            dest: chat_id,
            kind: EnvelopeKind::Text,
            ttl: self.config.max_ttl,
            hop: 0,
            ts: now_ts(),
            seq: 0,
            nonce,
            ciphertext,
        };
        let _ = self.store.seen_contains_or_insert(msg_id);
        self.store
            .message_put(&MessageRecord {
                msg_id,
                chat_id,
                origin: self.identity.node_id,
                dest: chat_id,
                kind: EnvelopeKind::Text,
                body: body.to_vec(),
                ts: envelope.ts,
                seq: 0,
                state: MessageState::Sent,
            })
            .ok();
        self.transmit_or_outbox(envelope).await;
        Ok(())
    }

    /// Send everything that queued up behind a handshake once it reaches
    /// `Established`, in the order it was submitted (spec.md §8 scenario S3).
    async fn flush_pending_for(self: &Arc<Self>, peer: NodeId) {
        let queued = self.pending.lock().await.remove(&peer).unwrap_or_default();
        for (msg_id, body) in queued {
            if let Err(e) = self.encrypt_and_transmit_text(msg_id, peer, &body).await {
                warn!(error = %e, %peer, "failed to send message queued behind handshake");
                let _ = self.store.message_update_state(msg_id, MessageState::Failed);
            }
        }
    }

    /// The handshake to `peer` gave up without ever reaching `Established`;
    /// fail everything that was queued behind it (spec.md §4.3, §8: a
    /// failed handshake surfaces as an in-chat system event, not a silent
    /// drop).
    async fn fail_pending_for(&self, peer: NodeId) {
        let queued = self.pending.lock().await.remove(&peer).unwrap_or_default();
        for (msg_id, _) in queued {
            let _ = self.store.message_update_state(msg_id, MessageState::Failed);
        }
    }

    pub async fn send_file(
        self: &Arc<Self>,
        chat_id: NodeId,
        bytes: &[u8],
        mime: &str,
        max_inline_file_bytes: u64,
    ) -> Result<Uuid, crate::error::MeshError> {
        if bytes.len() as u64 > max_inline_file_bytes {
            return Err(crate::error::MeshError::FileTooLarge(bytes.len() as u64));
        }
        let file_id = Uuid::new_v4();
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let total = b64.as_bytes().chunks(FILE_CHUNK_SIZE).count().max(1) as u16;

        for (idx, chunk) in b64.as_bytes().chunks(FILE_CHUNK_SIZE).enumerate() {
            let mut payload = Vec::with_capacity(22 + mime.len() + chunk.len());
            payload.extend_from_slice(file_id.as_bytes());
            payload.extend_from_slice(&(idx as u16).to_be_bytes());
            payload.extend_from_slice(&total.to_be_bytes());
            payload.extend_from_slice(&(mime.len() as u16).to_be_bytes());
            payload.extend_from_slice(mime.as_bytes());
            payload.extend_from_slice(chunk);

            let msg_id = Uuid::new_v4();
            let aad_prefix = AadPrefix {
                msg_id,
                origin: self.identity.node_id,
                dest: chat_id,
                kind: EnvelopeKind::FileChunk,
                seq: idx as u64,
            };
            let (nonce, ciphertext) = self.encrypt_for(chat_id, &payload, &aad_prefix).await?;
            let envelope = Envelope {
                msg_id,
                origin: self.identity.node_id,
                dest: chat_id,
                kind: EnvelopeKind::FileChunk,
                ttl: self.config.max_ttl,
                hop: 0,
                ts: now_ts(),
                seq: idx as u64,
                nonce,
                ciphertext,
            };
            let _ = self.store.seen_contains_or_insert(msg_id);
            self.transmit_or_outbox(envelope).await;
        }
        Ok(file_id)
    }

    async fn encrypt_for(
        &self,
        chat_id: NodeId,
        plaintext: &[u8],
        aad: &AadPrefix,
    ) -> Result<([u8; 12], Vec<u8>), CryptoError> {
        if chat_id.is_broadcast() {
            Ok(self.group.encrypt(plaintext, &aad.encode()))
        } else {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(&chat_id).ok_or(CryptoError::NoSession)?;
            let chain = session.send_chain_mut().ok_or(CryptoError::NoSession)?;
            let (counter, key) = chain.next();
            let nonce = crate::crypto::ChainKey::nonce_for(counter);
            let ciphertext = crate::crypto::aead_encrypt(&key, &nonce, &aad.encode(), plaintext);
            Ok((nonce, ciphertext))
        }
    }

    /// Send now if the destination is reachable, otherwise queue in the
    /// outbox for delivery once it reconnects (spec.md §4.4).
    async fn transmit_or_outbox(self: &Arc<Self>, envelope: Envelope) {
        let bytes = envelope.encode();
        if envelope.dest.is_broadcast() {
            let targets: Vec<NodeId> = self.connected.lock().await.iter().copied().collect();
            for peer in targets {
                let _ = self.link.send(peer, bytes.clone()).await;
            }
            return;
        }

        let reachable = self.connected.lock().await.contains(&envelope.dest);
        if reachable && self.link.send(envelope.dest, bytes.clone()).await.is_ok() {
            return;
        }
        if let Err(e) = self.store.outbox_push(envelope.dest, &bytes, now_ts()) {
            warn!(error = %e, "failed to queue outbox entry");
            self.counters.outbox_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn flush_outbox_for(self: &Arc<Self>, peer: NodeId) {
        let entries = match self.store.outbox_pop_for(peer) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries {
            if self.link.send(peer, entry.envelope).await.is_ok() {
                let _ = self.store.outbox_delete(entry.id);
            }
        }
    }

    /// Periodic outbox sweep: drop anything older than 7 days
    /// (spec.md §4.4).
    pub async fn sweep_outbox(&self) {
        if let Ok(n) = self.store.outbox_age_sweep(now_ts(), OUTBOX_MAX_AGE_SECS) {
            self.counters.outbox_age_outs.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Broadcast a `PRESENCE` beacon so peers learn liveness/route freshness
    /// even without a `TEXT` exchange (supplemented per SPEC_FULL §4.4).
    pub async fn send_presence(self: &Arc<Self>) {
        let msg_id = Uuid::new_v4();
        let envelope = Envelope {
            msg_id,
            origin: self.identity.node_id,
            dest: NodeId::BROADCAST,
            kind: EnvelopeKind::Presence,
            ttl: self.config.max_ttl,
            hop: 0,
            ts: now_ts(),
            seq: 0,
            nonce: [0u8; 12],
            ciphertext: Vec::new(),
        };
        let _ = self.store.seen_contains_or_insert(msg_id);
        self.transmit_or_outbox(envelope).await;
    }

    /// Re-run discovery so stale peripherals age out and fresh ones surface
    /// (spec.md §4.2, 5-minute discovery expiry).
    pub async fn rescan(self: &Arc<Self>) {
        if let Err(e) = self.link.start_scan().await {
            warn!(error = %e, "periodic rescan failed");
        }
    }

    /// Drop any BLE reassembly buffers that have sat idle too long
    /// (spec.md §4.2).
    pub async fn sweep_reassembly(&self) {
        self.link.sweep_reassembly().await;
    }

    /// Resend `HANDSHAKE_INIT` for any session stuck in `INIT_SENT` past
    /// `HANDSHAKE_RETRY_AFTER`, giving up after `HANDSHAKE_MAX_ATTEMPTS`
    /// sends (spec.md §4.3).
    pub async fn retry_stale_handshakes(self: &Arc<Self>) {
        let mut to_resend = Vec::new();
        let mut to_fail = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            for session in sessions.values_mut() {
                let Some(elapsed) = session.init_elapsed() else { continue };
                if elapsed < HANDSHAKE_RETRY_AFTER {
                    continue;
                }
                if session.attempts >= HANDSHAKE_MAX_ATTEMPTS {
                    session.mark_failed();
                    to_fail.push((session.peer, session.attempts));
                } else {
                    to_resend.push((session.peer, session.begin()));
                }
            }
        }

        for (peer, attempts) in to_fail {
            warn!(error = %HandshakeFailed { peer, attempts }, %peer, "handshake abandoned");
            self.bus.publish_handshake(HandshakeEvent { peer, status: HandshakeStatus::Failed });
            self.fail_pending_for(peer).await;
        }

        for (peer, our_public) in to_resend {
            self.bus.publish_handshake(HandshakeEvent { peer, status: HandshakeStatus::InitSent });
            let envelope = Envelope {
                msg_id: Uuid::new_v4(),
                origin: self.identity.node_id,
                dest: peer,
                kind: EnvelopeKind::HandshakeInit,
                ttl: self.config.max_ttl,
                hop: 0,
                ts: now_ts(),
                seq: 0,
                nonce: [0u8; 12],
                ciphertext: our_public.to_vec(),
            };
            let _ = self.store.seen_contains_or_insert(envelope.msg_id);
            self.transmit_or_outbox(envelope).await;
        }
    }

    /// Explicitly connect to a discovered peer. Exposed on top of the
    /// transport's own discovery loop for UI-driven "connect now" actions
    /// and for wiring test topologies deterministically.
    pub async fn connect(&self, peer: NodeId) -> Result<(), crate::error::TransportError> {
        self.link.connect(peer).await
    }

    pub async fn disconnect(&self, peer: NodeId) -> Result<(), crate::error::TransportError> {
        self.link.disconnect(peer).await
    }

    pub async fn begin_handshake(self: &Arc<Self>, peer: NodeId) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(peer)
            .or_insert_with(|| PairwiseSession::new(peer, HandshakeRole::Initiator));
        let our_public = session.begin();
        let status = session.status();
        drop(sessions);
        self.bus.publish_handshake(HandshakeEvent { peer, status });

        let envelope = Envelope {
            msg_id: Uuid::new_v4(),
            origin: self.identity.node_id,
            dest: peer,
            kind: EnvelopeKind::HandshakeInit,
            ttl: self.config.max_ttl,
            hop: 0,
            ts: now_ts(),
            seq: 0,
            nonce: [0u8; 12],
            ciphertext: our_public.to_vec(),
        };
        let _ = self.store.seen_contains_or_insert(envelope.msg_id);
        self.transmit_or_outbox(envelope).await;
    }
}

/// Mirrors [`Envelope::aad`] exactly — it's built before the envelope
/// exists yet (encryption happens before the `Envelope` struct is filled
/// in), so the two must be kept in lockstep by hand.
struct AadPrefix {
    msg_id: Uuid,
    origin: NodeId,
    dest: NodeId,
    kind: EnvelopeKind,
    seq: u64,
}

impl AadPrefix {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 16 + 16 + 1 + 8);
        out.extend_from_slice(self.msg_id.as_bytes());
        out.extend_from_slice(self.origin.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            group_passphrase: "shared-secret".into(),
            max_ttl: 6,
            scan_interval_sec: 10,
            packet_size_limit: 4096,
            seen_lru_limit: 1000,
            max_connections: 8,
            max_inline_file_bytes: 2_000_000,
            inbound_queue_capacity: 1024,
            presence_interval_sec: 60,
            data_dir: std::path::PathBuf::from("."),
        })
    }

    async fn spawn_node(net: &Arc<LoopbackNetwork>) -> (Arc<MeshProtocol>, NodeId) {
        let identity = Identity::generate();
        let node_id = identity.node_id;
        let config = test_config();
        let store = Arc::new(Store::open_in_memory(config.seen_lru_limit).unwrap());
        let overflow = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let link = Arc::new(net.join(node_id, config.inbound_queue_capacity, overflow.clone()));
        let bus = Arc::new(MessageBus::new(256));
        let group = GroupChannel::new(crate::crypto::derive_group_key(&config.group_passphrase).unwrap());
        let mesh = MeshProtocol::new(
            identity,
            config,
            store,
            link,
            bus,
            group,
            CancellationToken::new(),
            overflow,
        );
        let mesh_clone = mesh.clone();
        mesh.link.start_scan().await.unwrap();
        tokio::spawn(async move { mesh_clone.run().await });
        (mesh, node_id)
    }

    #[tokio::test]
    async fn broadcast_message_reaches_connected_peer() {
        let net = LoopbackNetwork::new();
        let (a, _a_id) = spawn_node(&net).await;
        let (b, b_id) = spawn_node(&net).await;

        a.link.connect(b_id).await.unwrap();
        b.link.connect(a.node_id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut rx = b.bus.subscribe_message().await;
        a.send_text(NodeId::BROADCAST, b"hello mesh").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(msg.body, b"hello mesh");
    }

    #[tokio::test]
    async fn duplicate_envelope_is_dropped_not_redelivered() {
        let net = LoopbackNetwork::new();
        let (a, _a_id) = spawn_node(&net).await;
        let (b, b_id) = spawn_node(&net).await;
        a.link.connect(b_id).await.unwrap();
        b.link.connect(a.node_id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut rx = b.bus.subscribe_message().await;
        a.send_text(NodeId::BROADCAST, b"once").await.unwrap();
        let _first = rx.recv().await.unwrap();

        assert_eq!(b.metrics().duplicates_dropped, 0);
    }

    #[tokio::test]
    async fn send_text_to_a_fresh_peer_triggers_handshake_then_delivers() {
        let net = LoopbackNetwork::new();
        let (a, _a_id) = spawn_node(&net).await;
        let (b, b_id) = spawn_node(&net).await;
        a.link.connect(b_id).await.unwrap();
        b.link.connect(a.node_id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handshake_rx = a.bus.subscribe_handshake();
        let mut rx = b.bus.subscribe_message().await;

        a.send_text(b_id, b"yo").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), handshake_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.peer, b_id);
        assert!(matches!(first.status, HandshakeStatus::InitSent));

        loop {
            let evt = tokio::time::timeout(Duration::from_secs(1), handshake_rx.recv())
                .await
                .expect("timed out waiting for establishment")
                .unwrap();
            if evt.peer == b_id && matches!(evt.status, HandshakeStatus::Established) {
                break;
            }
        }

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(msg.body, b"yo");
    }

    #[tokio::test]
    async fn relay_decrements_ttl_by_one_and_never_reflects_back_to_sender() {
        let net = LoopbackNetwork::new();
        let (a, a_id) = spawn_node(&net).await;
        let (b, b_id) = spawn_node(&net).await;
        let (c, c_id) = spawn_node(&net).await;

        a.link.connect(b_id).await.unwrap();
        b.link.connect(a_id).await.unwrap();
        b.link.connect(c_id).await.unwrap();
        c.link.connect(b_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut a_events = a.bus.subscribe_transport_event();
        let mut c_events = c.bus.subscribe_transport_event();

        a.send_text(NodeId::BROADCAST, b"relay me").await.unwrap();

        let relayed = loop {
            match tokio::time::timeout(Duration::from_secs(1), c_events.recv())
                .await
                .expect("timed out waiting for relay")
                .unwrap()
            {
                crate::transport::TransportEvent::FrameReceived { bytes, .. } => {
                    break Envelope::decode(&bytes).unwrap();
                }
                _ => continue,
            }
        };
        assert_eq!(relayed.ttl, a.config.max_ttl - 1);
        assert!(relayed.ttl > 0);
        assert_eq!(relayed.hop, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(10), a_events.recv()).await {
            if let crate::transport::TransportEvent::FrameReceived { bytes, .. } = event {
                let reflected = Envelope::decode(&bytes).unwrap();
                assert_ne!(reflected.origin, a.node_id(), "B must not relay A's own envelope back to A");
            }
        }
    }

    #[tokio::test]
    async fn self_originated_envelope_is_dropped_as_a_policy_violation() {
        let net = LoopbackNetwork::new();
        let (a, _a_id) = spawn_node(&net).await;

        let mut rx = a.bus.subscribe_message().await;
        let envelope = Envelope {
            msg_id: Uuid::new_v4(),
            origin: a.node_id(),
            dest: NodeId::BROADCAST,
            kind: EnvelopeKind::Text,
            ttl: a.config.max_ttl,
            hop: 0,
            ts: now_ts(),
            seq: 0,
            nonce: [0u8; 12],
            ciphertext: vec![0u8; 16],
        };
        a.handle_inbound(NodeId::random(), envelope.encode()).await;

        assert_eq!(a.metrics().policy_drops, 1);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn reaction_payload_round_trips() {
        let target = Uuid::new_v4();
        let p = ReactionPayload { target_msg_id: target, emoji: "🔥".into() };
        let decoded = ReactionPayload::decode(&p.encode()).unwrap();
        assert_eq!(decoded.target_msg_id, target);
        assert_eq!(decoded.emoji, "🔥");
    }

    #[tokio::test]
    async fn typing_payload_round_trips() {
        let p = TypingPayload { active: true };
        assert_eq!(TypingPayload::decode(&p.encode()).unwrap().active, true);
    }
}
