// ABOUTME: Command implementations behind the dual-replicator CLI
// ABOUTME: Shared bootstrap wiring settings, stores, queue and engine together

pub mod full_sync;
pub mod queue;
pub mod watch;

pub use full_sync::full_sync;
pub use queue::{drain, enqueue, history, keygen, purge, retry, stats};
pub use watch::watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sync_queue::{QueueStore, StoreSide};

use crate::codec::Codec;
use crate::connectivity::Connectivity;
use crate::engine::ReplicationEngine;
use crate::offline::OfflineQueue;
use crate::settings::Settings;
use crate::store::{DocumentStore, RelationalStore};

/// Options shared by every command.
#[derive(Debug, Clone)]
pub struct CommonOptions {
    pub config_path: PathBuf,
    /// Overrides `[queue] path`.
    pub queue_path: Option<PathBuf>,
}

impl CommonOptions {
    pub fn load_settings(&self) -> Result<Settings> {
        Settings::load(&self.config_path)
    }
}

/// Open the local queue file without touching either store.
pub fn open_queue_store(settings: &Settings, options: &CommonOptions) -> Result<QueueStore> {
    let path = match &options.queue_path {
        Some(path) => crate::utils::expand_home(path.clone())?,
        None => settings.queue_path()?,
    };
    QueueStore::open(&path).with_context(|| format!("Failed to open queue at {}", path.display()))
}

/// Fully wired queue, engine and stores.
pub struct Runtime {
    pub settings: Settings,
    pub queue: Arc<OfflineQueue>,
}

impl Runtime {
    /// Build the runtime. Stores connect lazily, so this succeeds offline;
    /// the initial connectivity state comes from pinging both stores.
    pub async fn connect(options: &CommonOptions) -> Result<Self> {
        let settings = options.load_settings()?;
        let registry = Arc::new(settings.registry()?);

        let codec = Codec::from_env(&settings.codec.key_env)
            .with_context(|| format!("Invalid key in ${}", settings.codec.key_env))?;
        if !codec.has_key() && registry.configs().any(|config| config.encrypted) {
            bail!(
                "Some entity types are encrypted but ${} is not set (generate one with `dual-replicator keygen`)",
                settings.codec.key_env
            );
        }

        let queue_store = Arc::new(open_queue_store(&settings, options)?);
        let store_a = Arc::new(
            DocumentStore::connect(&settings.store_a.uri, &settings.store_a.database).await?,
        );
        let store_b = Arc::new(RelationalStore::new(
            &settings.store_b.url,
            settings.store_b.allow_self_signed_certs,
        ));

        let engine = Arc::new(ReplicationEngine::new(
            Arc::clone(&registry),
            codec,
            queue_store,
            store_a.clone(),
            store_b.clone(),
            settings.engine_config(),
        ));

        let online = match engine.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Starting offline: {}", e);
                false
            }
        };

        if online {
            for config in registry.configs() {
                if settings.store_a.ensure_collections {
                    store_a.ensure_collection(config.target(StoreSide::A)).await?;
                }
                if settings.store_b.ensure_tables {
                    store_b.ensure_table(config.target(StoreSide::B)).await?;
                }
            }
        }

        let queue = Arc::new(OfflineQueue::new(
            engine,
            Connectivity::new(online),
            settings.queue_config(),
        ));
        Ok(Self { settings, queue })
    }
}
