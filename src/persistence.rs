//! Durable storage: seen-set, message history, outbox, routing hints, peer
//! records and the block list (spec.md §4.1).
//!
//! One `rusqlite` connection in WAL mode, guarded by a `Mutex` so writers
//! serialize the way spec.md §5 asks ("one connection with a write mutex").
//! SQLite itself is synchronous; callers on the async side should wrap
//! calls in `spawn_blocking` if they're on a latency-sensitive path, but
//! these are all small, indexed, single-row operations in practice.

use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::envelope::EnvelopeKind;
use crate::error::PersistenceError;
use crate::identity::{Identity, LongTermKeypair, NodeId};

type Result<T> = std::result::Result<T, PersistenceError>;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE meta (key TEXT PRIMARY KEY, value BLOB NOT NULL);

    CREATE TABLE seen (
        msg_id BLOB PRIMARY KEY,
        seen_order INTEGER NOT NULL
    );
    CREATE INDEX seen_order_idx ON seen(seen_order);

    CREATE TABLE messages (
        msg_id BLOB PRIMARY KEY,
        chat_id BLOB NOT NULL,
        origin BLOB NOT NULL,
        dest BLOB NOT NULL,
        kind INTEGER NOT NULL,
        body BLOB NOT NULL,
        ts INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        state INTEGER NOT NULL
    );
    CREATE INDEX messages_chat_idx ON messages(chat_id, ts);

    CREATE TABLE outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dest BLOB NOT NULL,
        envelope BLOB NOT NULL,
        enqueued_ts INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX outbox_dest_idx ON outbox(dest);

    CREATE TABLE routes (
        peer BLOB PRIMARY KEY,
        next_hop BLOB NOT NULL,
        hop_count INTEGER NOT NULL,
        last_seen_ts INTEGER NOT NULL
    );

    CREATE TABLE peers (
        node_id BLOB PRIMARY KEY,
        display_name TEXT,
        last_seen_ts INTEGER NOT NULL
    );

    CREATE TABLE blocks (
        node_id BLOB PRIMARY KEY
    );
    "#,
)];

const SEEN_FRONT_CACHE_CAP: usize = 4096;

/// In-memory mirror of `messages.state`. Transitions `Pending → Sent →
/// Delivered | Failed` (spec.md §3); `Received` is the terminal state for
/// envelopes that originated elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Sent,
    Pending,
    Failed,
    Delivered,
}

impl MessageState {
    fn as_i64(self) -> i64 {
        match self {
            MessageState::Received => 0,
            MessageState::Sent => 1,
            MessageState::Pending => 2,
            MessageState::Failed => 3,
            MessageState::Delivered => 4,
        }
    }

    fn from_i64(v: i64) -> Self {
        match v {
            0 => MessageState::Received,
            1 => MessageState::Sent,
            2 => MessageState::Pending,
            4 => MessageState::Delivered,
            _ => MessageState::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub msg_id: Uuid,
    pub chat_id: NodeId,
    pub origin: NodeId,
    pub dest: NodeId,
    pub kind: EnvelopeKind,
    pub body: Vec<u8>,
    pub ts: u64,
    pub seq: u64,
    pub state: MessageState,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub dest: NodeId,
    pub envelope: Vec<u8>,
    pub enqueued_ts: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteHint {
    pub peer: NodeId,
    pub next_hop: NodeId,
    pub hop_count: u8,
    pub last_seen_ts: u64,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub display_name: Option<String>,
    pub last_seen_ts: u64,
}

/// Routing hints older than this are no longer offered as a relay bias
/// (spec.md §9 Open Question, resolved: 24h staleness).
pub const ROUTE_STALE_AFTER_SECS: u64 = 24 * 60 * 60;

pub struct Store {
    conn: Mutex<Connection>,
    seen_cache: Mutex<LruCache<Uuid, ()>>,
    seen_lru_limit: u64,
}

fn node_id_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NodeId> {
    let bytes: Vec<u8> = row.get(idx)?;
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, "node_id".into(), rusqlite::types::Type::Blob))?;
    Ok(NodeId::from_bytes(arr))
}

impl Store {
    /// Open (creating if absent) the database at `path`, running any
    /// migrations not yet applied, and set up the seen front-cache.
    pub fn open(path: &Path, seen_lru_limit: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Store {
            conn: Mutex::new(conn),
            seen_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(SEEN_FRONT_CACHE_CAP).unwrap(),
            )),
            seen_lru_limit,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory(seen_lru_limit: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            conn: Mutex::new(conn),
            seen_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(SEEN_FRONT_CACHE_CAP).unwrap(),
            )),
            seen_lru_limit,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Checkpoint the WAL file back into the main database (spec.md §4.1
    /// autosave tick).
    pub fn checkpoint_wal(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.pragma_query(None, "wal_checkpoint", |_row| Ok(()))?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_info (version INTEGER NOT NULL)",
        )?;
        let current: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_info", [], |r| r.get(0))
            .unwrap_or(0);
        for (version, sql) in MIGRATIONS {
            if *version > current {
                conn.execute_batch(sql)
                    .map_err(|e| PersistenceError::Migration(*version, e.to_string()))?;
                conn.execute("INSERT INTO schema_info (version) VALUES (?1)", params![version])?;
            }
        }
        Ok(())
    }

    // ---- meta / identity --------------------------------------------

    pub fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    pub fn meta_set(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn identity_load(&self) -> Result<Identity> {
        let node_id_bytes = self.meta_get("identity.node_id")?.ok_or(PersistenceError::NoIdentity)?;
        let secret_bytes = self.meta_get("identity.secret")?.ok_or(PersistenceError::NoIdentity)?;
        let node_id = NodeId::from_bytes(
            node_id_bytes
                .try_into()
                .map_err(|_| PersistenceError::NoIdentity)?,
        );
        let secret: [u8; 32] = secret_bytes.try_into().map_err(|_| PersistenceError::NoIdentity)?;
        Ok(Identity {
            node_id,
            keypair: LongTermKeypair::from_bytes(secret),
        })
    }

    pub fn identity_store(&self, identity: &Identity) -> Result<()> {
        self.meta_set("identity.node_id", identity.node_id.as_bytes())?;
        self.meta_set("identity.secret", identity.keypair.secret.as_slice())?;
        Ok(())
    }

    // ---- seen ----------------------------------------------------------

    /// Returns `true` if `msg_id` was already present (a duplicate).
    pub fn seen_contains_or_insert(&self, msg_id: Uuid) -> Result<bool> {
        {
            let mut cache = self.seen_cache.lock().unwrap();
            if cache.get(&msg_id).is_some() {
                return Ok(true);
            }
        }
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT seen_order FROM seen WHERE msg_id = ?1",
                params![msg_id.as_bytes().to_vec()],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            drop(conn);
            self.seen_cache.lock().unwrap().put(msg_id, ());
            return Ok(true);
        }

        let next_order: i64 = conn
            .query_row("SELECT COALESCE(MAX(seen_order), 0) + 1 FROM seen", [], |r| r.get(0))?;
        conn.execute(
            "INSERT INTO seen (msg_id, seen_order) VALUES (?1, ?2)",
            params![msg_id.as_bytes().to_vec(), next_order],
        )?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM seen", [], |r| r.get(0))?;
        if count as u64 > self.seen_lru_limit {
            let evict = count as u64 - self.seen_lru_limit;
            conn.execute(
                "DELETE FROM seen WHERE seen_order IN (
                    SELECT seen_order FROM seen ORDER BY seen_order ASC LIMIT ?1
                )",
                params![evict as i64],
            )?;
        }
        drop(conn);
        self.seen_cache.lock().unwrap().put(msg_id, ());
        Ok(false)
    }

    // ---- messages --------------------------------------------------------

    pub fn message_put(&self, record: &MessageRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (msg_id, chat_id, origin, dest, kind, body, ts, seq, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(msg_id) DO UPDATE SET state = excluded.state",
            params![
                record.msg_id.as_bytes().to_vec(),
                record.chat_id.as_bytes().to_vec(),
                record.origin.as_bytes().to_vec(),
                record.dest.as_bytes().to_vec(),
                record.kind.as_u8(),
                record.body,
                record.ts as i64,
                record.seq as i64,
                record.state.as_i64(),
            ],
        )?;
        Ok(())
    }

    pub fn message_update_state(&self, msg_id: Uuid, state: MessageState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET state = ?1 WHERE msg_id = ?2",
            params![state.as_i64(), msg_id.as_bytes().to_vec()],
        )?;
        Ok(())
    }

    /// `before_ts`, when set, restricts results to strictly older than that
    /// timestamp so a caller can page back through a long chat history
    /// (spec.md §4.1: `message_query(chat_id, limit, before_ts)`).
    pub fn message_query(
        &self,
        chat_id: NodeId,
        limit: u32,
        before_ts: Option<u64>,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT msg_id, chat_id, origin, dest, kind, body, ts, seq, state FROM messages
             WHERE chat_id = ?1 AND (?3 IS NULL OR ts < ?3) ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![chat_id.as_bytes().to_vec(), limit, before_ts.map(|ts| ts as i64)],
            |row| {
                let msg_id_bytes: Vec<u8> = row.get(0)?;
                let kind_byte: i64 = row.get(4)?;
                Ok(MessageRecord {
                    msg_id: Uuid::from_bytes(msg_id_bytes.try_into().unwrap_or([0u8; 16])),
                    chat_id: node_id_col(row, 1)?,
                    origin: node_id_col(row, 2)?,
                    dest: node_id_col(row, 3)?,
                    kind: EnvelopeKind::try_from(kind_byte as u8).unwrap_or(EnvelopeKind::Text),
                    body: row.get(5)?,
                    ts: row.get::<_, i64>(6)? as u64,
                    seq: row.get::<_, i64>(7)? as u64,
                    state: MessageState::from_i64(row.get(8)?),
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ---- outbox ------------------------------------------------------

    pub fn outbox_push(&self, dest: NodeId, envelope: &[u8], now_ts: u64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outbox (dest, envelope, enqueued_ts, attempts) VALUES (?1, ?2, ?3, 0)",
            params![dest.as_bytes().to_vec(), envelope, now_ts as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn outbox_pop_for(&self, dest: NodeId) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, dest, envelope, enqueued_ts, attempts FROM outbox WHERE dest = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![dest.as_bytes().to_vec()], |row| {
            Ok(OutboxEntry {
                id: row.get(0)?,
                dest: node_id_col(row, 1)?,
                envelope: row.get(2)?,
                enqueued_ts: row.get::<_, i64>(3)? as u64,
                attempts: row.get::<_, i64>(4)? as u32,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn outbox_delete(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Drop entries older than 7 days (spec.md §4.4 outbox age-out).
    pub fn outbox_age_sweep(&self, now_ts: u64, max_age_secs: u64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let cutoff = now_ts.saturating_sub(max_age_secs) as i64;
        let n = conn.execute("DELETE FROM outbox WHERE enqueued_ts < ?1", params![cutoff])?;
        Ok(n as u64)
    }

    // ---- routing hints --------------------------------------------------

    pub fn route_observe(&self, hint: RouteHint) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO routes (peer, next_hop, hop_count, last_seen_ts) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(peer) DO UPDATE SET
                next_hop = excluded.next_hop,
                hop_count = excluded.hop_count,
                last_seen_ts = excluded.last_seen_ts
             WHERE excluded.hop_count <= routes.hop_count OR excluded.last_seen_ts > routes.last_seen_ts + 60",
            params![
                hint.peer.as_bytes().to_vec(),
                hint.next_hop.as_bytes().to_vec(),
                hint.hop_count,
                hint.last_seen_ts as i64,
            ],
        )?;
        Ok(())
    }

    /// Best known route to `peer`, or `None` if unknown or stale.
    pub fn route_best(&self, peer: NodeId, now_ts: u64) -> Result<Option<RouteHint>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT peer, next_hop, hop_count, last_seen_ts FROM routes WHERE peer = ?1",
                params![peer.as_bytes().to_vec()],
                |row| {
                    Ok(RouteHint {
                        peer: node_id_col(row, 0)?,
                        next_hop: node_id_col(row, 1)?,
                        hop_count: row.get(2)?,
                        last_seen_ts: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row.filter(|hint| now_ts.saturating_sub(hint.last_seen_ts) < ROUTE_STALE_AFTER_SECS))
    }

    // ---- peers -----------------------------------------------------------

    pub fn peer_upsert(&self, peer: &PeerRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO peers (node_id, display_name, last_seen_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(node_id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, peers.display_name),
                last_seen_ts = excluded.last_seen_ts",
            params![peer.node_id.as_bytes().to_vec(), peer.display_name, peer.last_seen_ts as i64],
        )?;
        Ok(())
    }

    pub fn peer_list(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT node_id, display_name, last_seen_ts FROM peers")?;
        let rows = stmt.query_map([], |row| {
            Ok(PeerRecord {
                node_id: node_id_col(row, 0)?,
                display_name: row.get(1)?,
                last_seen_ts: row.get::<_, i64>(2)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ---- blocks ---------------------------------------------------------

    pub fn block_set(&self, node_id: NodeId, blocked: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if blocked {
            conn.execute(
                "INSERT OR IGNORE INTO blocks (node_id) VALUES (?1)",
                params![node_id.as_bytes().to_vec()],
            )?;
        } else {
            conn.execute("DELETE FROM blocks WHERE node_id = ?1", params![node_id.as_bytes().to_vec()])?;
        }
        Ok(())
    }

    pub fn block_contains(&self, node_id: NodeId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM blocks WHERE node_id = ?1",
                params![node_id.as_bytes().to_vec()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}
