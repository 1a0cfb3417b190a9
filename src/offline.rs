// ABOUTME: Offline write-ahead queue facade used by applications
// ABOUTME: Enqueues writes durably and drains them to the stores in FIFO order

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sync_queue::{NewRecord, QueueStore, RecordKey, SyncRecord, SyncStats};
use tokio::sync::Mutex;

use crate::connectivity::Connectivity;
use crate::engine::{record_id, AttemptOutcome, ReplicationEngine};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Records attempted between connectivity checks and progress logs.
    pub batch_size: usize,
    /// Wait before the second drain pass; doubles for each further pass.
    pub pass_backoff: Duration,
    pub max_pass_backoff: Duration,
    /// Age after which synced records are purged.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            pass_backoff: Duration::from_secs(1),
            max_pass_backoff: Duration::from_secs(30),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Totals of one [`OfflineQueue::drain`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub passes: u32,
    pub attempted: u64,
    pub synced: u64,
    pub failed: u64,
    /// Attempts that ended with the record still pending.
    pub retried: u64,
    pub superseded: u64,
    /// Connectivity dropped before the queue was empty.
    pub interrupted: bool,
    pub errors: Vec<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Duration,
}

impl DrainReport {
    fn record(&mut self, outcome: &AttemptOutcome, key: &RecordKey) {
        self.attempted += 1;
        match outcome {
            AttemptOutcome::Synced { .. } => self.synced += 1,
            AttemptOutcome::RetryScheduled { .. } => self.retried += 1,
            AttemptOutcome::Failed { reason } => {
                self.failed += 1;
                self.errors.push(format!("{}: {}", key, reason));
            }
            AttemptOutcome::Superseded => self.superseded += 1,
        }
    }
}

/// Durable buffer of application writes.
///
/// Writes are persisted before any network call. Attempts from `enqueue` and
/// from draining are serialized, so one record is never applied twice
/// concurrently and the drain order is the enqueue order.
pub struct OfflineQueue {
    engine: Arc<ReplicationEngine>,
    connectivity: Connectivity,
    attempt_lock: Mutex<()>,
    config: QueueConfig,
}

impl OfflineQueue {
    pub fn new(
        engine: Arc<ReplicationEngine>,
        connectivity: Connectivity,
        config: QueueConfig,
    ) -> Self {
        Self {
            engine,
            connectivity,
            attempt_lock: Mutex::new(()),
            config,
        }
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn store(&self) -> &QueueStore {
        self.engine.queue()
    }

    /// Persist a write and, when online, attempt it once right away.
    ///
    /// A record without its unique key field gets a generated UUID, written
    /// back into the payload. Only unknown entity types, invalid records,
    /// encryption failures and local storage failures are returned as errors.
    /// Store-side failures end up in the record's status.
    pub async fn enqueue(&self, entity_type: &str, record: Value) -> SyncResult<RecordKey> {
        let config = self.engine.registry().resolve(entity_type)?;
        let mut record = record;
        let id = match record_id(config, &record)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Some(object) = record.as_object_mut() {
                    object.insert(config.unique_key_field.clone(), Value::String(id.clone()));
                }
                id
            }
        };

        let payload = self.engine.encode_payload(config, &record)?;
        let stored = self.store().put(&NewRecord {
            entity_type: config.entity_type.clone(),
            id,
            payload,
            encrypted: config.encrypted,
            max_retries: config.max_retries,
            origin: None,
        })?;
        tracing::debug!("Enqueued {} (revision {})", stored.key(), stored.revision);

        if self.connectivity.is_online() {
            match self.attempt(&stored).await {
                Ok(outcome) => tracing::debug!("Immediate attempt of {}: {:?}", stored.key(), outcome),
                Err(e) => tracing::warn!("Immediate attempt of {} failed: {}", stored.key(), e),
            }
        }
        Ok(stored.key())
    }

    /// Attempt one record under the attempt lock, using its latest revision.
    pub async fn attempt(&self, record: &SyncRecord) -> SyncResult<AttemptOutcome> {
        let _guard = self.attempt_lock.lock().await;
        let current = match self.store().get(&record.key())? {
            Some(current) if current.is_pending() => current,
            _ => return Ok(AttemptOutcome::Superseded),
        };
        self.engine.attempt_sync(&current).await
    }

    pub fn list_pending(&self, entity_type: Option<&str>) -> SyncResult<Vec<SyncRecord>> {
        Ok(self.store().list_pending(entity_type, None)?)
    }

    pub fn get(&self, key: &RecordKey) -> SyncResult<Option<SyncRecord>> {
        Ok(self.store().get(key)?)
    }

    pub fn history(&self, limit: usize) -> SyncResult<Vec<SyncRecord>> {
        Ok(self.store().history(limit)?)
    }

    pub fn get_sync_stats(&self, entity_type: Option<&str>) -> SyncResult<SyncStats> {
        Ok(self.store().stats(entity_type)?)
    }

    /// Delete synced records older than `older_than`.
    pub fn purge_old(&self, older_than: Duration) -> SyncResult<u64> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| SyncError::Queue(anyhow::anyhow!("retention out of range: {}", e)))?;
        let purged = self.store().purge_synced_before(Utc::now() - age)?;
        if purged > 0 {
            tracing::info!("Purged {} synced records older than {:?}", purged, older_than);
        }
        Ok(purged)
    }

    /// Purge with the configured retention.
    pub fn purge_expired(&self) -> SyncResult<u64> {
        self.purge_old(self.config.retention)
    }

    /// Re-pend a failed record with a fresh retry budget and attempt it if online.
    pub async fn retry_failed(&self, key: &RecordKey) -> SyncResult<Option<AttemptOutcome>> {
        let Some(reset) = self.store().reset_for_retry(key)? else {
            return Ok(None);
        };
        tracing::info!("Record {} reset for retry", key);
        if !self.connectivity.is_online() {
            return Ok(Some(AttemptOutcome::RetryScheduled {
                retry_count: 0,
                reason: "offline".to_string(),
            }));
        }
        self.attempt(&reset).await.map(Some)
    }

    /// Drain the queue until nothing is pending or connectivity drops.
    ///
    /// Each pass attempts every pending record once in enqueue order. Passes
    /// repeat with backoff while records remain pending with retries left.
    /// Failed records are left alone; see [`retry_failed`](Self::retry_failed).
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let started = Instant::now();
        let mut report = DrainReport::default();
        let mut backoff = self.config.pass_backoff;

        loop {
            if !self.connectivity.is_online() {
                report.interrupted = true;
                break;
            }

            let pending = self.store().list_pending(None, None)?;
            if pending.is_empty() {
                break;
            }
            report.passes += 1;
            tracing::info!("Drain pass {}: {} pending records", report.passes, pending.len());

            let retried_before = report.retried;
            for batch in pending.chunks(self.config.batch_size.max(1)) {
                if !self.connectivity.is_online() {
                    report.interrupted = true;
                    break;
                }
                for record in batch {
                    let outcome = self.attempt(record).await?;
                    report.record(&outcome, &record.key());
                }
                tracing::debug!(
                    "Drain progress: {} attempted, {} synced, {} failed",
                    report.attempted,
                    report.synced,
                    report.failed
                );
            }
            if report.interrupted {
                break;
            }

            // Re-enqueued records are picked up by the next pass without delay.
            if report.retried > retried_before {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_pass_backoff);
            }
        }

        report.finished_at = Some(Utc::now());
        report.duration = started.elapsed();
        if report.interrupted {
            tracing::warn!(
                "Drain interrupted by connectivity loss after {} attempts",
                report.attempted
            );
        } else if report.attempted > 0 {
            tracing::info!(
                "Drain complete: {} synced, {} failed in {:?}",
                report.synced,
                report.failed,
                report.duration
            );
        }
        Ok(report)
    }
}
