//! The UI ↔ core surface (spec.md §6): everything a frontend needs, with
//! no access to `Store`/`Link`/`MeshProtocol` internals.

use std::sync::Arc;

use base64::Engine;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::bus::{HandshakeEvent, InboundMessage, PeerStateEvent};
use crate::error::MeshError;
use crate::identity::NodeId;
use crate::mesh::{MeshMetrics, ReactionPayload, TypingPayload};
use crate::persistence::{MessageRecord, PeerRecord};
use crate::runtime::Runtime;

/// A bus topic a UI can subscribe to (spec.md §6: `subscribe(topic)`).
pub enum Topic {
    Message,
    PeerState,
    Handshake,
}

/// The stream handed back from [`Api::subscribe`]. Each variant wraps the
/// channel type its topic actually uses — `message` is a bounded mpsc
/// (spec.md §4.5: never silently dropped), the others are broadcast
/// receivers that lag-skip under load.
pub enum Subscription {
    Message(mpsc::Receiver<InboundMessage>),
    PeerState(broadcast::Receiver<PeerStateEvent>),
    Handshake(broadcast::Receiver<HandshakeEvent>),
}

/// Export formats named in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Html,
}

/// A thin facade over [`Runtime`] exposing exactly the operations spec.md
/// §6 names. A desktop UI, export renderer, or test harness talks to the
/// core exclusively through this type.
pub struct Api {
    runtime: Arc<Runtime>,
}

impl Api {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub async fn send_text(&self, chat_id: NodeId, body: &[u8]) -> Result<Uuid, MeshError> {
        Ok(self.runtime.mesh.send_text(chat_id, body).await?)
    }

    pub async fn send_file(&self, chat_id: NodeId, bytes: &[u8], mime: &str) -> Result<Uuid, MeshError> {
        self.runtime
            .mesh
            .send_file(chat_id, bytes, mime, self.runtime.config.max_inline_file_bytes)
            .await
    }

    pub async fn send_reaction(&self, chat_id: NodeId, target_msg_id: Uuid, emoji: &str) -> Result<Uuid, MeshError> {
        let payload = ReactionPayload { target_msg_id, emoji: emoji.to_string() };
        Ok(self.runtime.mesh.send_text(chat_id, &payload.encode()).await?)
    }

    pub async fn send_typing(&self, chat_id: NodeId, active: bool) -> Result<Uuid, MeshError> {
        let payload = TypingPayload { active };
        Ok(self.runtime.mesh.send_text(chat_id, &payload.encode()).await?)
    }

    pub async fn subscribe(&self, topic: Topic) -> Subscription {
        match topic {
            Topic::Message => Subscription::Message(self.runtime.bus.subscribe_message().await),
            Topic::PeerState => Subscription::PeerState(self.runtime.bus.subscribe_peer_state()),
            Topic::Handshake => Subscription::Handshake(self.runtime.bus.subscribe_handshake()),
        }
    }

    pub async fn connect(&self, peer: NodeId) -> Result<(), MeshError> {
        Ok(self.runtime.mesh.connect(peer).await?)
    }

    pub async fn disconnect(&self, peer: NodeId) -> Result<(), MeshError> {
        Ok(self.runtime.mesh.disconnect(peer).await?)
    }

    pub fn block(&self, peer_id: NodeId, blocked: bool) -> Result<(), MeshError> {
        Ok(self.runtime.store.block_set(peer_id, blocked)?)
    }

    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, MeshError> {
        Ok(self.runtime.store.peer_list()?)
    }

    /// Substring search over a chat's stored message bodies, newest first.
    /// Bodies are treated as UTF-8 text for matching; binary (file) bodies
    /// never match and are skipped.
    pub fn search(
        &self,
        chat_id: NodeId,
        query: &str,
        limit: u32,
        before_ts: Option<u64>,
    ) -> Result<Vec<MessageRecord>, MeshError> {
        let records = self.runtime.store.message_query(chat_id, limit, before_ts)?;
        let needle = query.to_lowercase();
        Ok(records
            .into_iter()
            .filter(|r| {
                std::str::from_utf8(&r.body)
                    .map(|s| s.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Render a chat's history to the requested format (spec.md §6).
    pub fn export(
        &self,
        chat_id: NodeId,
        format: ExportFormat,
        limit: u32,
        before_ts: Option<u64>,
    ) -> Result<Vec<u8>, MeshError> {
        let records = self.runtime.store.message_query(chat_id, limit, before_ts)?;
        Ok(match format {
            ExportFormat::Json => export_json(&records),
            ExportFormat::Html => export_html(&records).into_bytes(),
        })
    }

    pub fn metrics(&self) -> MeshMetrics {
        self.runtime.metrics()
    }

    pub fn node_id(&self) -> NodeId {
        self.runtime.mesh.node_id()
    }
}

fn export_json(records: &[MessageRecord]) -> Vec<u8> {
    let mut out = Vec::from(b"[".as_slice());
    for (i, r) in records.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(
            format!(
                r#"{{"msg_id":"{}","origin":"{}","ts":{},"body_base64":"{}"}}"#,
                r.msg_id,
                r.origin,
                r.ts,
                base64::engine::general_purpose::STANDARD.encode(&r.body),
            )
            .as_bytes(),
        );
    }
    out.push(b']');
    out
}

fn export_html(records: &[MessageRecord]) -> String {
    let mut out = String::from("<html><body><ul>\n");
    for r in records {
        let body = String::from_utf8_lossy(&r.body);
        out.push_str(&format!(
            "<li data-ts=\"{}\" data-origin=\"{}\">{}</li>\n",
            r.ts,
            r.origin,
            html_escape(&body)
        ));
    }
    out.push_str("</ul></body></html>");
    out
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::LoopbackNetwork;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            group_passphrase: "hello".into(),
            max_ttl: 6,
            scan_interval_sec: 10,
            packet_size_limit: 4096,
            seen_lru_limit: 1000,
            max_connections: 8,
            max_inline_file_bytes: 2_000_000,
            inbound_queue_capacity: 1024,
            presence_interval_sec: 3600,
            data_dir: std::env::temp_dir().join(format!("meshcore-api-test-{}", Uuid::new_v4())),
        }
    }

    async fn spawn_api(net: &Arc<LoopbackNetwork>) -> (Api, NodeId) {
        let identity = crate::identity::Identity::generate();
        let node_id = identity.node_id;
        let overflow = Arc::new(AtomicU64::new(0));
        let link = Arc::new(net.join(node_id, 1024, overflow.clone()));
        let runtime = Runtime::start_with_link(test_config(), identity, link, overflow).await.unwrap();
        (Api::new(Arc::new(runtime)), node_id)
    }

    #[tokio::test]
    async fn broadcast_send_is_searchable_and_exportable() {
        let net = LoopbackNetwork::new();
        let (a, _a_id) = spawn_api(&net).await;

        a.send_text(NodeId::BROADCAST, b"hello from A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let found = a.search(NodeId::BROADCAST, "hello", 10, None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].body, b"hello from A");

        let json = a.export(NodeId::BROADCAST, ExportFormat::Json, 10, None).unwrap();
        assert!(String::from_utf8(json).unwrap().contains("body_base64"));

        let html = a.export(NodeId::BROADCAST, ExportFormat::Html, 10, None).unwrap();
        assert!(String::from_utf8(html).unwrap().contains("<li"));
    }

    #[tokio::test]
    async fn block_and_list_peers_round_trip_through_the_store() {
        let net = LoopbackNetwork::new();
        let (a, _) = spawn_api(&net).await;
        let peer = NodeId::random();

        assert!(a.list_peers().unwrap().is_empty());
        a.block(peer, true).unwrap();
        assert!(a.runtime.store.block_contains(peer).unwrap());
        a.block(peer, false).unwrap();
        assert!(!a.runtime.store.block_contains(peer).unwrap());
    }
}
