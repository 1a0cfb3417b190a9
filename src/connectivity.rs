// ABOUTME: Online/offline state, the drain trigger on reconnect and a ping probe
// ABOUTME: Connectivity is a watch channel shared by the queue and background tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::engine::ReplicationEngine;
use crate::offline::OfflineQueue;
use crate::task::BackgroundTask;

/// Shared online flag. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn set_online(&self) -> bool {
        self.set(true)
    }

    pub fn set_offline(&self) -> bool {
        self.set(false)
    }

    /// Returns whether the state changed.
    pub fn set(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Drains the queue each time connectivity comes back.
///
/// After an online transition the trigger waits `stabilization_delay` and
/// drains only if still online. Offline transitions do nothing; writes keep
/// accumulating in the queue.
pub struct ConnectivityTrigger {
    task: BackgroundTask,
}

impl ConnectivityTrigger {
    pub fn spawn(queue: Arc<OfflineQueue>, stabilization_delay: Duration) -> Self {
        let mut changes = queue.connectivity().subscribe();
        let task = BackgroundTask::spawn("connectivity-trigger", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown => break,

                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *changes.borrow_and_update();
                        if !online {
                            tracing::debug!("Offline; writes will be queued");
                            continue;
                        }

                        tracing::info!("Back online; draining in {:?}", stabilization_delay);
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(stabilization_delay) => {}
                        }
                        if !queue.connectivity().is_online() {
                            continue;
                        }
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => {
                                tracing::info!("Stopping during reconnect drain");
                                break;
                            }
                            result = queue.drain() => match result {
                                Ok(report) => tracing::info!(
                                    "Reconnect drain: {} synced, {} failed, {} pending retries",
                                    report.synced,
                                    report.failed,
                                    report.retried
                                ),
                                Err(e) => tracing::error!("Reconnect drain aborted: {}", e),
                            }
                        }
                    }
                }
            }
        });
        Self { task }
    }

    pub async fn stop(self) {
        self.task.stop().await;
    }
}

/// Derives connectivity from periodic pings of both stores.
pub struct ConnectivityProbe {
    task: BackgroundTask,
}

impl ConnectivityProbe {
    pub fn spawn(
        engine: Arc<ReplicationEngine>,
        connectivity: Connectivity,
        interval: Duration,
    ) -> Self {
        let task = BackgroundTask::spawn("connectivity-probe", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown => break,

                    _ = ticker.tick() => {
                        match engine.ping().await {
                            Ok(()) => {
                                connectivity.set_online();
                            }
                            Err(e) => {
                                if connectivity.set_offline() {
                                    tracing::warn!("Store ping failed: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        });
        Self { task }
    }

    pub async fn stop(self) {
        self.task.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_transitions_only() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());
        assert!(connectivity.set_online());
        assert!(!connectivity.set_online());
        assert!(connectivity.is_online());
        assert!(connectivity.set_offline());
    }

    #[tokio::test]
    async fn clones_share_state_and_notify() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();
        let clone = connectivity.clone();
        clone.set_online();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(connectivity.is_online());
    }
}
