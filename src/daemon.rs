// ABOUTME: Long-running supervisor owning listeners, the reconnect trigger and timers
// ABOUTME: Drains periodically, purges old synced records and shuts down cleanly

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sync_queue::StoreSide;
use tokio::time::interval;

use crate::connectivity::{ConnectivityProbe, ConnectivityTrigger};
use crate::engine::Subscription;
use crate::error::SyncResult;
use crate::offline::OfflineQueue;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub drain_interval: Duration,
    /// Wait after coming back online before draining.
    pub stabilization_delay: Duration,
    /// Ping both stores at this interval to derive connectivity. `None`
    /// leaves connectivity to whoever owns the [`Connectivity`](crate::connectivity::Connectivity) handle.
    pub probe_interval: Option<Duration>,
    pub purge_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(30),
            stabilization_delay: Duration::from_secs(2),
            probe_interval: Some(Duration::from_secs(15)),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

pub struct SyncDaemon {
    queue: Arc<OfflineQueue>,
    config: DaemonConfig,
}

impl SyncDaemon {
    pub fn new(queue: Arc<OfflineQueue>, config: DaemonConfig) -> Self {
        Self { queue, config }
    }

    /// Subscribe to every store each configured entity type may flow out of.
    pub async fn start_subscriptions(&self) -> SyncResult<Vec<Subscription>> {
        let engine = self.queue.engine();
        let mut subscriptions = Vec::new();
        for config in engine.registry().configs() {
            for side in [StoreSide::A, StoreSide::B] {
                if !config.direction.allows(side) {
                    continue;
                }
                let entity_type = config.entity_type.clone();
                let subscription = engine
                    .subscribe(side, &config.entity_type, move |event| {
                        tracing::debug!(
                            "{} {} '{}' on store {}",
                            entity_type,
                            event.kind.as_str(),
                            event.id,
                            event.source
                        );
                    })
                    .await;
                match subscription {
                    Ok(subscription) => subscriptions.push(subscription),
                    Err(e) => {
                        // Release what was opened so far.
                        for subscription in subscriptions {
                            subscription.cancel().await;
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(subscriptions)
    }

    /// Open all listeners, or none when a store is unreachable so the caller
    /// can try again once connectivity returns.
    async fn open_listeners(&self) -> Result<Vec<Subscription>> {
        match self.start_subscriptions().await {
            Ok(subscriptions) => {
                tracing::info!("{} change listeners active", subscriptions.len());
                Ok(subscriptions)
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("Change listeners not started yet: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting SyncDaemon with drain_interval={:?}, probe_interval={:?}, purge_interval={:?}",
            self.config.drain_interval,
            self.config.probe_interval,
            self.config.purge_interval
        );

        let mut subscriptions = self.open_listeners().await?;

        let trigger = ConnectivityTrigger::spawn(
            Arc::clone(&self.queue),
            self.config.stabilization_delay,
        );
        let probe = self.config.probe_interval.map(|every| {
            ConnectivityProbe::spawn(
                Arc::clone(self.queue.engine()),
                self.queue.connectivity().clone(),
                every,
            )
        });

        let mut drain_interval = interval(self.config.drain_interval);
        let mut purge_interval = interval(self.config.purge_interval);
        let mut drains = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = drain_interval.tick() => {
                    if !self.queue.connectivity().is_online() {
                        tracing::debug!("Offline; skipping periodic drain");
                        continue;
                    }
                    if subscriptions.is_empty() {
                        subscriptions = self.open_listeners().await?;
                    }
                    drains += 1;
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during drain, aborting");
                            break;
                        }
                        result = self.queue.drain() => match result {
                            Ok(report) if report.attempted > 0 => tracing::info!(
                                "Periodic drain {}: {} synced, {} failed, {} pending retries",
                                drains,
                                report.synced,
                                report.failed,
                                report.retried
                            ),
                            Ok(_) => {}
                            Err(e) => tracing::error!("Periodic drain {} aborted: {}", drains, e),
                        }
                    }
                }
                _ = purge_interval.tick() => {
                    if let Err(e) = self.queue.purge_expired() {
                        tracing::error!("Purge of synced records failed: {}", e);
                    }
                }
            }
        }

        for subscription in subscriptions {
            subscription.cancel().await;
        }
        trigger.stop().await;
        if let Some(probe) = probe {
            probe.stop().await;
        }
        tracing::info!("SyncDaemon stopped");
        Ok(())
    }
}
