// ABOUTME: In-process store backend with a broadcast change feed
// ABOUTME: Used for tests and dry runs; supports injected faults and latency

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sync_queue::StoreSide;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::broadcast::error::RecvError;

use super::{ChangeFeed, ChangeKind, RemoteStore, StoreChange, StoreTarget, FEED_BUFFER};
use crate::error::{SyncError, SyncResult};
use crate::provenance::Envelope;

/// Failure injected into every call until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unreachable,
    AccessDenied,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Envelope>>,
    writes: u64,
    fault: Option<Fault>,
    latency: Option<Duration>,
}

pub struct MemoryStore {
    side: StoreSide,
    state: Mutex<State>,
    changes: broadcast::Sender<(String, StoreChange)>,
}

impl MemoryStore {
    pub fn new(side: StoreSide) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            side,
            state: Mutex::new(State::default()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fault(&self, fault: Option<Fault>) {
        self.lock().fault = fault;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Upserts and deletes applied through [`RemoteStore`].
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Stored envelope including provenance.
    pub fn raw(&self, collection: &str, id: &str) -> Option<Envelope> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Simulate a write made by an application directly against this store.
    pub fn write_direct(&self, collection: &str, id: &str, payload: Value) {
        let change = self.apply_upsert(collection, id, Envelope::untagged(payload));
        self.publish(collection, change);
    }

    pub fn delete_direct(&self, collection: &str, id: &str) {
        if self.apply_delete(collection, id) {
            self.publish(
                collection,
                StoreChange {
                    kind: ChangeKind::Delete,
                    id: id.to_string(),
                    envelope: None,
                },
            );
        }
    }

    fn apply_upsert(&self, collection: &str, id: &str, envelope: Envelope) -> StoreChange {
        let mut state = self.lock();
        let rows = state.collections.entry(collection.to_string()).or_default();
        let kind = if rows.contains_key(id) {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        rows.insert(id.to_string(), envelope.clone());
        StoreChange {
            kind,
            id: id.to_string(),
            envelope: Some(envelope),
        }
    }

    fn apply_delete(&self, collection: &str, id: &str) -> bool {
        self.lock()
            .collections
            .get_mut(collection)
            .map(|rows| rows.remove(id).is_some())
            .unwrap_or(false)
    }

    fn publish(&self, collection: &str, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send((collection.to_string(), change));
    }

    async fn enter(&self) -> SyncResult<()> {
        let (fault, latency) = {
            let state = self.lock();
            (state.fault, state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            None => Ok(()),
            Some(Fault::Unreachable) => Err(SyncError::transient(self.side, "connection refused")),
            Some(Fault::AccessDenied) => Err(SyncError::PermanentAuth {
                store: self.side,
                message: "permission denied".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn side(&self) -> StoreSide {
        self.side
    }

    async fn ping(&self) -> SyncResult<()> {
        self.enter().await
    }

    async fn get(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<Option<Envelope>> {
        self.enter().await?;
        Ok(self.raw(target.name, id))
    }

    async fn upsert(
        &self,
        target: StoreTarget<'_>,
        id: &str,
        envelope: &Envelope,
    ) -> SyncResult<()> {
        self.enter().await?;
        if !envelope.payload.is_object() {
            return Err(SyncError::Rejected {
                store: self.side,
                message: "payload must be an object".to_string(),
            });
        }
        let change = self.apply_upsert(target.name, id, envelope.clone());
        self.lock().writes += 1;
        self.publish(target.name, change);
        Ok(())
    }

    async fn delete(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<bool> {
        self.enter().await?;
        let removed = self.apply_delete(target.name, id);
        self.lock().writes += 1;
        if removed {
            self.publish(
                target.name,
                StoreChange {
                    kind: ChangeKind::Delete,
                    id: id.to_string(),
                    envelope: None,
                },
            );
        }
        Ok(removed)
    }

    async fn fetch_page(
        &self,
        target: StoreTarget<'_>,
        after: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<(String, Envelope)>> {
        self.enter().await?;
        let state = self.lock();
        let Some(rows) = state.collections.get(target.name) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };
        Ok(rows
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, envelope)| (id.clone(), envelope.clone()))
            .collect())
    }

    async fn subscribe(&self, target: StoreTarget<'_>) -> SyncResult<ChangeFeed> {
        self.enter().await?;
        let mut changes = self.changes.subscribe();
        let collection = target.name.to_string();
        let side = self.side;
        let (tx, events) = mpsc::channel(FEED_BUFFER);

        let producer = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok((name, change)) if name == collection => {
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "store {} feed for '{}' lagged; {} changes dropped",
                            side,
                            collection,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(ChangeFeed::new(events, producer))
    }
}
