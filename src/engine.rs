// ABOUTME: Replication engine applying queued writes and mirroring live changes
// ABOUTME: Tags replicated writes with provenance so echoes are not re-propagated

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sync_queue::{NewRecord, QueueStore, RecordStatus, StoreSide, SyncRecord, Transition};

use crate::codec::Codec;
use crate::error::{SyncError, SyncResult};
use crate::provenance::Envelope;
use crate::registry::{SyncConfig, SyncRegistry};
use crate::store::{ChangeKind, RemoteChangeEvent, RemoteStore, StoreChange};
use crate::task::BackgroundTask;

const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for every call to a remote store.
    pub call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// What one attempt did to a queued record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Synced { target: StoreSide },
    RetryScheduled { retry_count: u32, reason: String },
    Failed { reason: String },
    /// The record was re-enqueued or resolved while the attempt ran. The newer
    /// revision is attempted on its own.
    Superseded,
}

/// What mirroring one change into the opposite store did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Written,
    /// The destination already holds an identical payload.
    Unchanged,
    /// The change is the echo of a write replicated out of the destination.
    LoopSuppressed,
    Deleted,
    AlreadyAbsent,
    DirectionNotAuthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorMode {
    /// Live change events; echoes of replicated writes are suppressed.
    Live,
    /// Reconciliation; every source item is compared and copied if different.
    Reconcile,
}

pub struct ReplicationEngine {
    registry: Arc<SyncRegistry>,
    codec: Codec,
    queue: Arc<QueueStore>,
    store_a: Arc<dyn RemoteStore>,
    store_b: Arc<dyn RemoteStore>,
    config: EngineConfig,
}

impl ReplicationEngine {
    pub fn new(
        registry: Arc<SyncRegistry>,
        codec: Codec,
        queue: Arc<QueueStore>,
        store_a: Arc<dyn RemoteStore>,
        store_b: Arc<dyn RemoteStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            codec,
            queue,
            store_a,
            store_b,
            config,
        }
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    pub fn store(&self, side: StoreSide) -> &Arc<dyn RemoteStore> {
        match side {
            StoreSide::A => &self.store_a,
            StoreSide::B => &self.store_b,
        }
    }

    /// Run a remote call under the per-call timeout.
    pub async fn call<T, F>(&self, side: StoreSide, operation: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                store: side,
                timeout: self.config.call_timeout,
            }),
        }
    }

    /// Check that both stores answer.
    pub async fn ping(&self) -> SyncResult<()> {
        self.call(StoreSide::A, self.store_a.ping()).await?;
        self.call(StoreSide::B, self.store_b.ping()).await
    }

    /// Apply one queued record to its target store.
    ///
    /// Every store-side outcome is recorded on the record. The `Err` path is
    /// reserved for failures of the local queue itself.
    pub async fn attempt_sync(&self, record: &SyncRecord) -> SyncResult<AttemptOutcome> {
        if !record.is_pending() {
            return Ok(AttemptOutcome::Superseded);
        }

        let config = match self.registry.resolve(&record.entity_type) {
            Ok(config) => config,
            Err(err) => return self.fail(record, &err.to_string()),
        };

        let payload = match self.decode_payload(record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("Record {} cannot be decoded: {}", record.key(), err);
                return self.fail(record, &err.to_string());
            }
        };

        let Some(target) = config.write_target(record.origin) else {
            let reason = format!(
                "direction {} does not allow writes originating on store {}",
                config.direction.as_str(),
                record.origin.map(|side| side.as_str()).unwrap_or("?")
            );
            return self.fail(record, &reason);
        };

        // A record that came from one store is a replica in the other.
        let envelope = match record.origin {
            Some(origin) => Envelope::tagged(payload, origin),
            None => Envelope::untagged(payload),
        };

        let store = self.store(target);
        let result = self
            .call(target, store.upsert(config.target(target), &record.id, &envelope))
            .await;

        match result {
            Ok(()) => match self.queue.mark_synced(&record.key(), record.revision)? {
                Transition::Applied { .. } => {
                    tracing::debug!("Record {} synced to store {}", record.key(), target);
                    Ok(AttemptOutcome::Synced { target })
                }
                Transition::Stale => Ok(AttemptOutcome::Superseded),
            },
            Err(err) if err.is_retryable() => {
                let reason = err.to_string();
                match self
                    .queue
                    .increment_retry(&record.key(), record.revision, &reason)?
                {
                    Transition::Applied {
                        status: RecordStatus::Failed,
                        retry_count,
                    } => {
                        tracing::warn!(
                            "Record {} failed after {} attempts: {}",
                            record.key(),
                            retry_count,
                            reason
                        );
                        Ok(AttemptOutcome::Failed { reason })
                    }
                    Transition::Applied { retry_count, .. } => {
                        tracing::warn!(
                            "Record {} attempt {}/{} failed: {}",
                            record.key(),
                            retry_count,
                            record.max_retries,
                            reason
                        );
                        Ok(AttemptOutcome::RetryScheduled {
                            retry_count,
                            reason,
                        })
                    }
                    Transition::Stale => Ok(AttemptOutcome::Superseded),
                }
            }
            Err(err) => {
                tracing::warn!("Record {} rejected: {}", record.key(), err);
                self.fail(record, &err.to_string())
            }
        }
    }

    fn fail(&self, record: &SyncRecord, reason: &str) -> SyncResult<AttemptOutcome> {
        match self.queue.mark_failed(&record.key(), record.revision, reason)? {
            Transition::Applied { .. } => Ok(AttemptOutcome::Failed {
                reason: reason.to_string(),
            }),
            Transition::Stale => Ok(AttemptOutcome::Superseded),
        }
    }

    fn decode_payload(&self, record: &SyncRecord) -> SyncResult<Value> {
        if record.encrypted {
            self.codec
                .decrypt(&record.payload)
                .map_err(SyncError::Decryption)
        } else {
            serde_json::from_slice(&record.payload)
                .map_err(|e| SyncError::InvalidRecord(format!("stored payload is not JSON: {}", e)))
        }
    }

    /// Serialize `record` for the queue, encrypting when the entity type asks for it.
    pub fn encode_payload(&self, config: &SyncConfig, record: &Value) -> SyncResult<Vec<u8>> {
        if config.encrypted {
            self.codec.encrypt(record).map_err(SyncError::Encryption)
        } else {
            serde_json::to_vec(record).map_err(|e| SyncError::InvalidRecord(e.to_string()))
        }
    }

    /// Mirror one change from `source` into the opposite store.
    pub async fn mirror(
        &self,
        config: &SyncConfig,
        source: StoreSide,
        change: StoreChange,
        mode: MirrorMode,
    ) -> SyncResult<MirrorOutcome> {
        if !config.direction.allows(source) {
            return Ok(MirrorOutcome::DirectionNotAuthorized);
        }
        let destination = source.other();
        let target = config.target(destination);
        let store = self.store(destination);

        let envelope = match (change.kind, change.envelope) {
            (ChangeKind::Delete, _) => {
                let removed = self
                    .call(destination, store.delete(target, &change.id))
                    .await?;
                return Ok(if removed {
                    MirrorOutcome::Deleted
                } else {
                    MirrorOutcome::AlreadyAbsent
                });
            }
            (_, Some(envelope)) => envelope,
            (_, None) => return Ok(MirrorOutcome::Unchanged),
        };

        if mode == MirrorMode::Live && envelope.is_replica_from(destination) {
            return Ok(MirrorOutcome::LoopSuppressed);
        }

        let digest = envelope.digest();
        if let Some(existing) = self.call(destination, store.get(target, &change.id)).await? {
            if existing.digest() == digest {
                return Ok(MirrorOutcome::Unchanged);
            }
        }

        let outgoing = Envelope::tagged(envelope.payload, source);
        self.call(destination, store.upsert(target, &change.id, &outgoing))
            .await?;
        Ok(MirrorOutcome::Written)
    }

    /// Replicate `record`, which was written on `source`, into the other store.
    pub async fn sync_bidirectional(
        &self,
        entity_type: &str,
        record: Value,
        source: StoreSide,
    ) -> SyncResult<MirrorOutcome> {
        let config = self.registry.resolve(entity_type)?;
        if !config.direction.allows(source) {
            return Ok(MirrorOutcome::DirectionNotAuthorized);
        }
        let id = record_id(config, &record)?
            .ok_or_else(|| {
                SyncError::InvalidRecord(format!(
                    "record has no '{}' field",
                    config.unique_key_field
                ))
            })?;
        let change = StoreChange {
            kind: ChangeKind::Update,
            id,
            envelope: Some(Envelope::untagged(record)),
        };
        self.mirror(config, source, change, MirrorMode::Live).await
    }

    pub async fn subscribe_to_store_a_changes<F>(
        self: &Arc<Self>,
        entity_type: &str,
        on_change: F,
    ) -> SyncResult<Subscription>
    where
        F: Fn(&RemoteChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(StoreSide::A, entity_type, on_change).await
    }

    pub async fn subscribe_to_store_b_changes<F>(
        self: &Arc<Self>,
        entity_type: &str,
        on_change: F,
    ) -> SyncResult<Subscription>
    where
        F: Fn(&RemoteChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(StoreSide::B, entity_type, on_change).await
    }

    /// Start a listener for `entity_type` on `side`.
    ///
    /// The feed is open when this returns. If it ends unexpectedly the
    /// listener reopens it with backoff until cancelled.
    pub async fn subscribe<F>(
        self: &Arc<Self>,
        side: StoreSide,
        entity_type: &str,
        on_change: F,
    ) -> SyncResult<Subscription>
    where
        F: Fn(&RemoteChangeEvent) + Send + Sync + 'static,
    {
        let config = self.registry.resolve(entity_type)?.clone();
        let store = Arc::clone(self.store(side));
        let feed = self
            .call(side, store.subscribe(config.target(side)))
            .await?;
        tracing::info!(
            "Listening for '{}' changes on store {} ({})",
            config.entity_type,
            side,
            config.location(side)
        );

        let engine = Arc::clone(self);
        let task = BackgroundTask::spawn("change-listener", move |mut shutdown| async move {
            let mut feed = feed;
            let mut delay = RESUBSCRIBE_INITIAL_DELAY;
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown => break,

                    change = feed.next() => match change {
                        Some(change) => {
                            delay = RESUBSCRIBE_INITIAL_DELAY;
                            engine.handle_change(&config, side, change, &on_change).await;
                        }
                        None => {
                            tracing::warn!(
                                "Change feed for '{}' on store {} closed; reopening in {:?}",
                                config.entity_type,
                                side,
                                delay
                            );
                            tokio::select! {
                                biased;
                                _ = &mut shutdown => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
                            match engine.call(side, store.subscribe(config.target(side))).await {
                                Ok(reopened) => feed = reopened,
                                Err(e) => tracing::warn!(
                                    "Failed to reopen change feed for '{}' on store {}: {}",
                                    config.entity_type,
                                    side,
                                    e
                                ),
                            }
                        }
                    },
                }
            }
            tracing::debug!(
                "Listener for '{}' on store {} stopped",
                config.entity_type,
                side
            );
        });

        Ok(Subscription {
            side,
            entity_type: entity_type.to_string(),
            task: Some(task),
        })
    }

    async fn handle_change<F>(
        &self,
        config: &SyncConfig,
        side: StoreSide,
        change: StoreChange,
        on_change: &F,
    ) where
        F: Fn(&RemoteChangeEvent),
    {
        let event = RemoteChangeEvent {
            source: side,
            kind: change.kind,
            entity_type: config.entity_type.clone(),
            id: change.id.clone(),
            payload: change.envelope.as_ref().map(|e| e.payload.clone()),
        };
        on_change(&event);

        let payload = event.payload;
        match self.mirror(config, side, change, MirrorMode::Live).await {
            Ok(outcome) => tracing::debug!(
                "{} of {} '{}' from store {}: {:?}",
                event.kind.as_str(),
                config.entity_type,
                event.id,
                side,
                outcome
            ),
            Err(err) => {
                tracing::warn!(
                    "Failed to mirror {} '{}' from store {}: {}",
                    config.entity_type,
                    event.id,
                    side,
                    err
                );
                match payload {
                    Some(payload) if err.is_retryable() => {
                        self.defer(config, side, &event.id, &payload)
                    }
                    _ => {}
                }
            }
        }
    }

    /// Queue a live change whose mirroring failed transiently, so the drain
    /// worker retries it with the usual retry budget.
    fn defer(&self, config: &SyncConfig, origin: StoreSide, id: &str, payload: &Value) {
        let encoded = match self.encode_payload(config, payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Cannot queue '{}' for retry: {}", id, e);
                return;
            }
        };
        let record = NewRecord {
            entity_type: config.entity_type.clone(),
            id: id.to_string(),
            payload: encoded,
            encrypted: config.encrypted,
            max_retries: config.max_retries,
            origin: Some(origin),
        };
        match self.queue.put_unless_local_pending(&record) {
            Ok(Some(stored)) => tracing::info!("Queued {} for retry", stored.key()),
            Ok(None) => tracing::warn!(
                "Not queueing change to {} from store {}: an undelivered local write is pending",
                record.key(),
                origin
            ),
            Err(e) => tracing::error!("Cannot queue '{}' for retry: {:#}", id, e),
        }
    }
}

/// Unique key value of `record`, if present.
///
/// Strings are used as-is and integers are rendered in decimal. Any other
/// non-null value is rejected.
pub fn record_id(config: &SyncConfig, record: &Value) -> SyncResult<Option<String>> {
    let object = record
        .as_object()
        .ok_or_else(|| SyncError::InvalidRecord("record must be a JSON object".to_string()))?;
    match object.get(&config.unique_key_field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if !id.is_empty() => Ok(Some(id.clone())),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Some(n.to_string())),
        Some(other) => Err(SyncError::InvalidRecord(format!(
            "'{}' must be a non-empty string or an integer, got {}",
            config.unique_key_field, other
        ))),
    }
}

/// A live listener on one store for one entity type.
///
/// Dropping the subscription stops the listener; [`cancel`](Self::cancel)
/// also waits for it to finish.
pub struct Subscription {
    side: StoreSide,
    entity_type: String,
    task: Option<BackgroundTask>,
}

impl Subscription {
    pub fn side(&self) -> StoreSide {
        self.side
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub async fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
        tracing::debug!(
            "Cancelled subscription for '{}' on store {}",
            self.entity_type,
            self.side
        );
    }
}
