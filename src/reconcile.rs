// ABOUTME: Full one-directional reconciliation between the two stores
// ABOUTME: Pages through the source by key and mirrors every item with fixed pacing

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::engine::{MirrorMode, MirrorOutcome, ReplicationEngine};
use crate::registry::{Flow, SyncConfig};
use crate::store::{ChangeKind, StoreChange};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Delay after every item, bounding the request rate against both stores.
    pub pace: Duration,
    pub page_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pace: Duration::from_millis(100),
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityReport {
    pub entity_type: String,
    pub success: u64,
    pub failed: u64,
    /// Items copied because the destination was missing or different.
    pub written: u64,
    /// Set when a page could not be fetched and the entity's pass stopped early.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub flow: String,
    pub success: u64,
    pub failed: u64,
    pub entities: Vec<EntityReport>,
    pub duration: Duration,
}

impl ReconcileReport {
    pub fn items_processed(&self) -> u64 {
        self.success + self.failed
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().filter_map(|e| e.error.as_deref())
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errors().next().is_none()
    }
}

/// Bulk repair job. Continues past individual failures.
pub struct Reconciler {
    engine: Arc<ReplicationEngine>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(engine: Arc<ReplicationEngine>, config: ReconcileConfig) -> Self {
        Self { engine, config }
    }

    /// Copy every entity type whose direction allows `flow` from the source
    /// store to the destination.
    ///
    /// Items equal at the destination count as successes without a write.
    pub async fn full_sync(&self, flow: Flow) -> ReconcileReport {
        let started = Instant::now();
        tracing::info!("Starting full sync {}", flow);

        let mut entities = Vec::new();
        for config in self.engine.registry().compatible_with(flow) {
            let report = self.reconcile_entity(config, flow).await;
            tracing::info!(
                "Full sync {} of '{}': {} ok ({} written), {} failed",
                flow,
                report.entity_type,
                report.success,
                report.written,
                report.failed
            );
            entities.push(report);
        }

        let report = ReconcileReport {
            flow: flow.to_string(),
            success: entities.iter().map(|e| e.success).sum(),
            failed: entities.iter().map(|e| e.failed).sum(),
            entities,
            duration: started.elapsed(),
        };
        tracing::info!(
            "Full sync {} finished: {} ok, {} failed in {:?}",
            flow,
            report.success,
            report.failed,
            report.duration
        );
        report
    }

    async fn reconcile_entity(&self, config: &SyncConfig, flow: Flow) -> EntityReport {
        let source = flow.source();
        let store = self.engine.store(source);
        let target = config.target(source);
        let mut report = EntityReport {
            entity_type: config.entity_type.clone(),
            ..Default::default()
        };
        let mut after: Option<String> = None;

        loop {
            let page = match self
                .engine
                .call(
                    source,
                    store.fetch_page(target, after.as_deref(), self.config.page_size),
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(
                        "Full sync of '{}' stopped: cannot read page after {:?}: {}",
                        config.entity_type,
                        after,
                        e
                    );
                    report.error = Some(e.to_string());
                    break;
                }
            };
            let page_len = page.len();
            let Some(last) = page.last().map(|(id, _)| id.clone()) else {
                break;
            };

            for (id, envelope) in page {
                let change = StoreChange {
                    kind: ChangeKind::Update,
                    id,
                    envelope: Some(envelope),
                };
                let id = change.id.clone();
                match self
                    .engine
                    .mirror(config, source, change, MirrorMode::Reconcile)
                    .await
                {
                    Ok(outcome) => {
                        report.success += 1;
                        if outcome == MirrorOutcome::Written {
                            report.written += 1;
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            "Full sync of {} '{}' failed: {}",
                            config.entity_type,
                            id,
                            e
                        );
                    }
                }
                tokio::time::sleep(self.config.pace).await;
            }

            if page_len < self.config.page_size {
                break;
            }
            after = Some(last);
        }

        report
    }
}
