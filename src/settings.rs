// ABOUTME: TOML configuration file for stores, queue, timings and entity types
// ABOUTME: Every section except [[entity]] has defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::daemon::DaemonConfig;
use crate::engine::EngineConfig;
use crate::offline::QueueConfig;
use crate::reconcile::ReconcileConfig;
use crate::registry::{SyncConfig, SyncRegistry};
use crate::utils::{expand_home, state_dir};

pub const DEFAULT_KEY_ENV: &str = "DUAL_REPLICATOR_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub store_a: DocumentStoreSettings,
    pub store_b: RelationalStoreSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub codec: CodecSettings,
    #[serde(default, rename = "entity")]
    pub entities: Vec<SyncConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentStoreSettings {
    pub uri: String,
    pub database: String,
    /// Create unique key indexes and enable pre-images at startup.
    #[serde(default = "default_true")]
    pub ensure_collections: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationalStoreSettings {
    pub url: String,
    #[serde(default)]
    pub allow_self_signed_certs: bool,
    /// Create tables and change triggers at startup.
    #[serde(default = "default_true")]
    pub ensure_tables: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub path: Option<PathBuf>,
    pub retention_days: u32,
    pub batch_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: None,
            retention_days: 7,
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    pub call_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileSettings {
    pub pace_ms: u64,
    pub page_size: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            pace_ms: 100,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    pub drain_interval_secs: u64,
    pub stabilization_delay_ms: u64,
    /// 0 disables the ping probe; connectivity then stays online.
    pub probe_interval_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            drain_interval_secs: 30,
            stabilization_delay_ms: 2000,
            probe_interval_secs: 15,
            purge_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodecSettings {
    /// Environment variable holding the base64 payload key.
    pub key_env: String,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            key_env: DEFAULT_KEY_ENV.to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Default config file location (`~/.dual-replicator/config.toml`).
    pub fn default_path() -> Result<PathBuf> {
        Ok(state_dir()?.join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut settings: Settings = toml::from_str(contents)?;
        settings.queue.path = settings.queue.path.take().map(expand_home).transpose()?;
        Ok(settings)
    }

    /// Queue file: the configured path, or `~/.dual-replicator/queue.db`.
    pub fn queue_path(&self) -> Result<PathBuf> {
        match &self.queue.path {
            Some(path) => Ok(path.clone()),
            None => Ok(state_dir()?.join("queue.db")),
        }
    }

    pub fn registry(&self) -> Result<SyncRegistry> {
        SyncRegistry::new(self.entities.iter().cloned()).context("Invalid [[entity]] configuration")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            call_timeout: Duration::from_secs(self.engine.call_timeout_secs),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            batch_size: self.queue.batch_size,
            retention: Duration::from_secs(u64::from(self.queue.retention_days) * 24 * 60 * 60),
            ..QueueConfig::default()
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            pace: Duration::from_millis(self.reconcile.pace_ms),
            page_size: self.reconcile.page_size.max(1),
        }
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            drain_interval: Duration::from_secs(self.daemon.drain_interval_secs.max(1)),
            stabilization_delay: Duration::from_millis(self.daemon.stabilization_delay_ms),
            probe_interval: match self.daemon.probe_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            purge_interval: Duration::from_secs(self.daemon.purge_interval_secs.max(1)),
        }
    }
}
