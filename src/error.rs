//! Typed error kinds for every library-level failure mode.
//!
//! Each kind maps to the propagation policy in the spec: inbound-pipeline
//! errors are caught and counted by the dispatcher (see `mesh.rs`), outbound
//! errors are returned to the caller, and startup errors carry an exit code
//! (see `bin/meshd.rs`).

use thiserror::Error;

/// BLE-level failure, recoverable by retry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0:?} is not connected")]
    NotConnected(crate::identity::NodeId),
    #[error("send to {0:?} timed out")]
    Timeout(crate::identity::NodeId),
    #[error("link error: {0}")]
    LinkError(String),
    #[error("no BLE adapter available")]
    NoAdapter,
    #[error("connection pool is at capacity ({0})")]
    PoolFull(u32),
}

/// A malformed envelope on the wire. Always dropped silently by the pipeline.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("short buffer: need at least {need} bytes, got {got}")]
    ShortBuffer { need: usize, got: usize },
    #[error("bad magic: {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported version: {0}")]
    BadVersion(u8),
    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),
    #[error("ciphertext length {0} exceeds packet_size_limit")]
    CiphertextTooLarge(u32),
}

/// Decrypt/authentication failure. Dropped, logged at debug.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD authentication failed")]
    AuthFailed,
    #[error("no established session with peer")]
    NoSession,
    #[error("counter {counter} outside receive window (rx={rx})")]
    OutsideWindow { counter: u64, rx: u64 },
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

/// Pairwise handshake failed to establish. Surfaced to the UI layer.
#[derive(Debug, Error)]
#[error("handshake with {peer:?} failed after {attempts} attempts")]
pub struct HandshakeFailed {
    pub peer: crate::identity::NodeId,
    pub attempts: u32,
}

/// Durable-store failure. Fatal only for writes to `seen`; otherwise logged
/// and the caller continues.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration {0} failed: {1}")]
    Migration(i64, String),
    #[error("identity not yet initialized")]
    NoIdentity,
}

/// An envelope violates a protocol invariant (e.g. `ttl > max_ttl`, self-origin
/// relay). Dropped, logged at warn.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("ttl {0} exceeds max_ttl {1}")]
    TtlExceeded(u8, u8),
    #[error("refusing to relay our own origin")]
    SelfOrigin,
    #[error("dest is not self and not broadcast; refusing to decrypt")]
    NotAddressedToUs,
}

/// Config file/env parse or validation failure. Maps to exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Umbrella error returned from the public `meshcore` API.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Handshake(#[from] HandshakeFailed),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("file too large: {0} bytes exceeds max_inline_file_bytes")]
    FileTooLarge(u64),
    #[error("shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, MeshError>;
