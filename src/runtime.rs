//! Process wiring: startup order, background tasks, and coordinated
//! shutdown (spec.md §4.6).

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bus::MessageBus;
use crate::config::Config;
use crate::crypto::{derive_group_key, GroupChannel};
use crate::error::MeshError;
use crate::identity::Identity;
use crate::mesh::{MeshMetrics, MeshProtocol};
use crate::persistence::Store;
use crate::transport::{BtlePlugLink, Link};

/// The shutdown grace period after which Runtime proceeds anyway
/// (spec.md §4.6).
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const CHUNK_GC_INTERVAL: Duration = Duration::from_secs(60);
const REASSEMBLY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Owns every component for one running node. No process-wide singletons
/// (spec.md §9) — everything a background task needs is handed to it
/// explicitly when it's spawned.
pub struct Runtime {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub mesh: Arc<MeshProtocol>,
    pub bus: Arc<MessageBus>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Config → Persistence → Crypto → Transport → Mesh → Bus, exactly the
    /// order spec.md §4.6 specifies.
    pub async fn start(config: Config) -> Result<Self, MeshError> {
        init_tracing();

        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir).map_err(|source| crate::error::ConfigError::Io {
            path: config.data_dir.display().to_string(),
            source,
        })?;
        let db_path = config.data_dir.join("meshcore.db");
        let store = Arc::new(Store::open(&db_path, config.seen_lru_limit)?);

        let identity = match store.identity_load() {
            Ok(identity) => identity,
            Err(crate::error::PersistenceError::NoIdentity) => {
                let identity = Identity::generate();
                store.identity_store(&identity)?;
                identity
            }
            Err(e) => return Err(e.into()),
        };
        info!(node_id = %identity.node_id, "identity loaded");

        let passphrase = config.group_passphrase.clone();
        let group_key = tokio::task::spawn_blocking(move || derive_group_key(&passphrase))
            .await
            .map_err(|e| crate::error::CryptoError::Kdf(e.to_string()))??;
        let group = GroupChannel::new(group_key);

        let inbound_queue_overflow = Arc::new(AtomicU64::new(0));
        let link: Arc<dyn Link> = Arc::new(
            BtlePlugLink::new(
                config.max_connections,
                config.packet_size_limit,
                config.inbound_queue_capacity,
                inbound_queue_overflow.clone(),
            )
            .await
            .map_err(MeshError::Transport)?,
        );
        link.start_scan().await.map_err(MeshError::Transport)?;

        let bus = Arc::new(MessageBus::new(crate::bus::DEFAULT_MESSAGE_CHANNEL_CAPACITY));
        let shutdown = CancellationToken::new();
        let mesh = MeshProtocol::new(
            identity,
            config.clone(),
            store.clone(),
            link,
            bus.clone(),
            group,
            shutdown.clone(),
            inbound_queue_overflow,
        );

        let mut runtime = Runtime {
            config,
            store,
            mesh,
            bus,
            shutdown,
            tasks: Vec::new(),
        };
        runtime.spawn_background_tasks();
        Ok(runtime)
    }

    /// Build a runtime over an already-constructed transport link, bypassing
    /// BLE adapter discovery. Used by in-process tests wiring a
    /// [`crate::transport::LoopbackLink`] topology together. `identity`'s
    /// `node_id` must match whatever id `link` was registered under with its
    /// network (e.g. the id passed to `LoopbackNetwork::join`) — the mesh
    /// dispatcher addresses peers by `NodeId`, and the link routes by the
    /// same id, so the two have to agree.
    pub async fn start_with_link(
        config: Config,
        identity: Identity,
        link: Arc<dyn Link>,
        inbound_queue_overflow: Arc<AtomicU64>,
    ) -> Result<Self, MeshError> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir).map_err(|source| crate::error::ConfigError::Io {
            path: config.data_dir.display().to_string(),
            source,
        })?;
        let store = Arc::new(Store::open_in_memory(config.seen_lru_limit)?);
        store.identity_store(&identity)?;

        let group = GroupChannel::new(derive_group_key(&config.group_passphrase)?);
        link.start_scan().await.map_err(MeshError::Transport)?;

        let bus = Arc::new(MessageBus::new(crate::bus::DEFAULT_MESSAGE_CHANNEL_CAPACITY));
        let shutdown = CancellationToken::new();
        let mesh = MeshProtocol::new(
            identity,
            config.clone(),
            store.clone(),
            link,
            bus.clone(),
            group,
            shutdown.clone(),
            inbound_queue_overflow,
        );

        let mut runtime = Runtime { config, store, mesh, bus, shutdown, tasks: Vec::new() };
        runtime.spawn_background_tasks();
        Ok(runtime)
    }

    fn spawn_background_tasks(&mut self) {
        let dispatcher_mesh = self.mesh.clone();
        self.tasks.push(tokio::spawn(async move { dispatcher_mesh.run().await }));

        self.tasks.push(spawn_ticker(self.shutdown.clone(), OUTBOX_SWEEP_INTERVAL, {
            let mesh = self.mesh.clone();
            move || {
                let mesh = mesh.clone();
                async move { mesh.sweep_outbox().await }
            }
        }));

        self.tasks.push(spawn_ticker(self.shutdown.clone(), CHUNK_GC_INTERVAL, {
            let mesh = self.mesh.clone();
            move || {
                let mesh = mesh.clone();
                async move { mesh.gc_chunks().await }
            }
        }));

        self.tasks.push(spawn_ticker(
            self.shutdown.clone(),
            Duration::from_secs(self.config.presence_interval_sec),
            {
                let mesh = self.mesh.clone();
                move || {
                    let mesh = mesh.clone();
                    async move { mesh.send_presence().await }
                }
            },
        ));

        self.tasks.push(spawn_ticker(self.shutdown.clone(), AUTOSAVE_INTERVAL, {
            let store = self.store.clone();
            move || {
                let store = store.clone();
                async move {
                    if let Err(e) = store.checkpoint_wal() {
                        warn!(error = %e, "wal checkpoint failed");
                    }
                }
            }
        }));

        self.tasks.push(spawn_ticker(
            self.shutdown.clone(),
            Duration::from_secs(self.config.scan_interval_sec as u64),
            {
                let mesh = self.mesh.clone();
                move || {
                    let mesh = mesh.clone();
                    async move { mesh.rescan().await }
                }
            },
        ));

        self.tasks.push(spawn_ticker(self.shutdown.clone(), REASSEMBLY_SWEEP_INTERVAL, {
            let mesh = self.mesh.clone();
            move || {
                let mesh = mesh.clone();
                async move { mesh.sweep_reassembly().await }
            }
        }));

        self.tasks.push(spawn_ticker(self.shutdown.clone(), HANDSHAKE_RETRY_INTERVAL, {
            let mesh = self.mesh.clone();
            move || {
                let mesh = mesh.clone();
                async move { mesh.retry_stale_handshakes().await }
            }
        }));
    }

    /// Wait on `ctrl_c` or an explicit cancel, then fan out shutdown with a
    /// hard deadline (spec.md §4.6).
    pub async fn run_until_shutdown(mut self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
            }
            _ = self.shutdown.cancelled() => {}
        }
        self.shutdown().await;
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        let deadline = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        });
        if deadline.await.is_err() {
            warn!("shutdown deadline exceeded, proceeding anyway");
        }
    }

    pub fn metrics(&self) -> MeshMetrics {
        self.mesh.metrics()
    }
}

fn spawn_ticker<F, Fut>(shutdown: CancellationToken, period: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => f().await,
            }
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Exit codes named in spec.md §6.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 2;
    pub const PERSISTENCE: i32 = 3;
    pub const NO_ADAPTER: i32 = 4;
}

pub fn exit_code_for(error: &MeshError) -> i32 {
    match error {
        MeshError::Config(_) => exit_code::CONFIG,
        MeshError::Persistence(_) => exit_code::PERSISTENCE,
        MeshError::Transport(crate::error::TransportError::NoAdapter) => exit_code::NO_ADAPTER,
        _ => exit_code::PERSISTENCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(exit_code::OK, 0);
        assert_eq!(exit_code::CONFIG, 2);
        assert_eq!(exit_code::PERSISTENCE, 3);
        assert_eq!(exit_code::NO_ADAPTER, 4);
    }
}
