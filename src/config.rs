//! Layered configuration: a TOML file with `MESHCORE_*` environment
//! overrides, validated before `Runtime::start` ever touches the disk or
//! the radio (spec.md §6).

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

fn default_max_ttl() -> u8 {
    6
}
fn default_scan_interval_sec() -> u32 {
    10
}
fn default_packet_size_limit() -> u32 {
    512
}
fn default_seen_lru_limit() -> u64 {
    50_000
}
fn default_max_connections() -> usize {
    8
}
fn default_max_inline_file_bytes() -> u64 {
    2_000_000
}
fn default_inbound_queue_capacity() -> usize {
    1024
}
fn default_presence_interval_sec() -> u64 {
    60
}
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshcore")
}

/// The seven tunables named in spec.md §6 (`max_ttl` is `ttl_default`'s name
/// in this struct), plus `data_dir`, which the distilled spec assumes but
/// never names (every persistence path needs somewhere to live on disk), and
/// `inbound_queue_capacity`/`presence_interval_sec`, ambient additions the
/// distillation doesn't name but the bounded inbound queue (spec.md §5) and
/// the presence beacon (SPEC_FULL §4.4) both need a tunable for.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub group_passphrase: String,

    #[serde(default = "default_max_ttl")]
    pub max_ttl: u8,

    #[serde(default = "default_scan_interval_sec")]
    pub scan_interval_sec: u32,

    #[serde(default = "default_packet_size_limit")]
    pub packet_size_limit: u32,

    #[serde(default = "default_seen_lru_limit")]
    pub seen_lru_limit: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_inline_file_bytes")]
    pub max_inline_file_bytes: u64,

    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,

    #[serde(default = "default_presence_interval_sec")]
    pub presence_interval_sec: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Config {
    /// Load `path` as TOML, then apply any `MESHCORE_*` environment
    /// overrides, then validate. `MESHCORE_GROUP_PASSPHRASE`,
    /// `MESHCORE_MAX_TTL`, etc. — the env var name is the field name
    /// upper-cased with the `MESHCORE_` prefix.
    pub fn from_file_and_env(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = toml::from_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MESHCORE_GROUP_PASSPHRASE") {
            self.group_passphrase = v;
        }
        if let Ok(v) = env::var("MESHCORE_MAX_TTL") {
            if let Ok(n) = v.parse() {
                self.max_ttl = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_SCAN_INTERVAL_SEC") {
            if let Ok(n) = v.parse() {
                self.scan_interval_sec = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_PACKET_SIZE_LIMIT") {
            if let Ok(n) = v.parse() {
                self.packet_size_limit = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_SEEN_LRU_LIMIT") {
            if let Ok(n) = v.parse() {
                self.seen_lru_limit = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.max_connections = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_MAX_INLINE_FILE_BYTES") {
            if let Ok(n) = v.parse() {
                self.max_inline_file_bytes = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_INBOUND_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.inbound_queue_capacity = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_PRESENCE_INTERVAL_SEC") {
            if let Ok(n) = v.parse() {
                self.presence_interval_sec = n;
            }
        }
        if let Ok(v) = env::var("MESHCORE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.group_passphrase.is_empty() {
            return Err(ConfigError::Invalid {
                key: "group_passphrase",
                reason: "must not be empty".into(),
            });
        }
        if self.max_ttl == 0 {
            return Err(ConfigError::Invalid {
                key: "max_ttl",
                reason: "must be at least 1".into(),
            });
        }
        if self.scan_interval_sec == 0 {
            return Err(ConfigError::Invalid {
                key: "scan_interval_sec",
                reason: "must be at least 1".into(),
            });
        }
        if self.packet_size_limit < 64 {
            return Err(ConfigError::Invalid {
                key: "packet_size_limit",
                reason: "must be at least 64 bytes".into(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "max_connections",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
