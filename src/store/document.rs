// ABOUTME: MongoDB backend (store A) addressing documents by their unique key field
// ABOUTME: Change feed built from collection change streams

use anyhow::{Context, Result};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::{StreamExt, TryStreamExt};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{
    ClientOptions, FullDocumentBeforeChangeType, FullDocumentType, IndexOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};
use sync_queue::StoreSide;
use tokio::sync::mpsc;

use super::{ChangeFeed, ChangeKind, RemoteStore, StoreChange, StoreTarget, FEED_BUFFER};
use crate::error::{SyncError, SyncResult};
use crate::provenance::{Envelope, ProvenanceTag, PROVENANCE_FIELD};
use crate::utils::sanitize_url;

/// Store A.
///
/// Documents are matched on `key_field`, which carries a unique index. The
/// provenance tag is stored in a `_provenance` subdocument and removed again
/// when documents are read back.
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let options = ClientOptions::parse(uri)
            .await
            .with_context(|| format!("Invalid store A connection string {}", sanitize_url(uri)))?;
        let client = Client::with_options(options).context("Failed to create store A client")?;
        tracing::info!(
            "Connected to store A at {} (database '{}')",
            sanitize_url(uri),
            database
        );
        Ok(Self {
            db: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }

    /// Create the unique key index and enable pre-images for delete events.
    ///
    /// Pre-images need MongoDB 6.0. Without them, deletes of documents whose
    /// `_id` is not the key value cannot be mirrored.
    pub async fn ensure_collection(&self, target: StoreTarget<'_>) -> Result<()> {
        tracing::info!("Ensuring collection '{}' exists on store A", target.name);
        let index = IndexModel::builder()
            .keys(field_doc(target.key_field, 1))
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection(target.name)
            .create_index(index)
            .await
            .with_context(|| {
                format!(
                    "Failed to create unique index on '{}.{}'",
                    target.name, target.key_field
                )
            })?;

        if let Err(e) = self
            .db
            .run_command(doc! {
                "collMod": target.name,
                "changeStreamPreAndPostImages": { "enabled": true },
            })
            .await
        {
            tracing::warn!(
                "Could not enable change stream pre-images on '{}': {}",
                target.name,
                e
            );
        }
        Ok(())
    }

    fn classify(&self, err: mongodb::error::Error) -> SyncError {
        SyncError::from_mongo(StoreSide::A, &err)
    }
}

const PAGE_KEY: &str = "_page_key";

/// Single-field document keyed by a runtime field name.
fn field_doc(field: &str, value: impl Into<Bson>) -> Document {
    let mut document = Document::new();
    document.insert(field, value);
    document
}

/// Filter matching the document whose key renders as `id`.
///
/// Integer keys are stored as numbers, so a decimal id also matches the
/// numeric form.
fn key_filter(field: &str, id: &str) -> Document {
    match id.parse::<i64>() {
        Ok(n) if n.to_string() == id => field_doc(field, doc! { "$in": [id, n] }),
        _ => field_doc(field, id),
    }
}

/// String form of a key value.
fn key_string(value: &Bson) -> Option<String> {
    match value {
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        _ => None,
    }
}

/// Split a stored document into its payload and provenance tag.
fn into_envelope(mut document: Document, key_field: &str) -> Envelope {
    if key_field != "_id" {
        document.remove("_id");
    }
    let provenance = match document.remove(PROVENANCE_FIELD) {
        Some(tag) => bson::from_bson::<ProvenanceTag>(tag).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable provenance tag: {}", e);
            ProvenanceTag::default()
        }),
        None => ProvenanceTag::default(),
    };
    Envelope {
        payload: Bson::Document(document).into_relaxed_extjson(),
        provenance,
    }
}

fn into_document(envelope: &Envelope, key_field: &str, id: &str) -> SyncResult<Document> {
    let rejected = |message: String| SyncError::Rejected {
        store: StoreSide::A,
        message,
    };
    let mut document = match bson::to_bson(&envelope.payload) {
        Ok(Bson::Document(document)) => document,
        Ok(_) => return Err(rejected("payload must be an object".to_string())),
        Err(e) => return Err(rejected(e.to_string())),
    };
    if key_field != "_id" {
        document.remove("_id");
    }
    // The payload keeps its own key value so its digest survives the write.
    if document.get(key_field).and_then(key_string).as_deref() != Some(id) {
        document.insert(key_field, id);
    }
    let provenance = bson::to_bson(&envelope.provenance).map_err(|e| rejected(e.to_string()))?;
    document.insert(PROVENANCE_FIELD, provenance);
    Ok(document)
}

/// Keyset page over the string form of the key, which is the order the
/// other stores page in. String and integer keys may be mixed.
fn page_pipeline(key_field: &str, after: Option<&str>, limit: usize) -> Vec<Document> {
    let mut pipeline = vec![
        doc! { "$match": field_doc(key_field, doc! { "$exists": true }) },
        doc! { "$addFields": { PAGE_KEY: { "$toString": format!("${key_field}") } } },
    ];
    if let Some(after) = after {
        pipeline.push(doc! { "$match": { PAGE_KEY: { "$gt": after } } });
    }
    pipeline.push(doc! { "$sort": { PAGE_KEY: 1 } });
    pipeline.push(doc! { "$limit": limit as i64 });
    pipeline
}

fn change_from_event(event: ChangeStreamEvent<Document>, key_field: &str) -> Option<StoreChange> {
    match event.operation_type {
        OperationType::Delete => {
            let from_pre_image = event
                .full_document_before_change
                .as_ref()
                .and_then(|doc| doc.get(key_field))
                .and_then(key_string);
            let from_document_key = event
                .document_key
                .as_ref()
                .and_then(|key| key.get("_id"))
                .filter(|_| key_field == "_id" || from_pre_image.is_none())
                .and_then(key_string);
            let id = from_pre_image.or(from_document_key)?;
            Some(StoreChange {
                kind: ChangeKind::Delete,
                id,
                envelope: None,
            })
        }
        OperationType::Insert | OperationType::Update | OperationType::Replace => {
            let kind = if matches!(event.operation_type, OperationType::Insert) {
                ChangeKind::Insert
            } else {
                ChangeKind::Update
            };
            // Update lookups return no document when it was deleted meanwhile.
            let document = event.full_document?;
            let id = document.get(key_field).and_then(key_string)?;
            Some(StoreChange {
                kind,
                id,
                envelope: Some(into_envelope(document, key_field)),
            })
        }
        _ => None,
    }
}

#[async_trait]
impl RemoteStore for DocumentStore {
    fn side(&self) -> StoreSide {
        StoreSide::A
    }

    async fn ping(&self) -> SyncResult<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| self.classify(e))?;
        Ok(())
    }

    async fn get(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<Option<Envelope>> {
        let found = self
            .collection(target.name)
            .find_one(key_filter(target.key_field, id))
            .await
            .map_err(|e| self.classify(e))?;
        Ok(found.map(|document| into_envelope(document, target.key_field)))
    }

    async fn upsert(
        &self,
        target: StoreTarget<'_>,
        id: &str,
        envelope: &Envelope,
    ) -> SyncResult<()> {
        let document = into_document(envelope, target.key_field, id)?;
        self.collection(target.name)
            .replace_one(key_filter(target.key_field, id), document)
            .upsert(true)
            .await
            .map_err(|e| self.classify(e))?;
        Ok(())
    }

    async fn delete(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<bool> {
        let result = self
            .collection(target.name)
            .delete_one(key_filter(target.key_field, id))
            .await
            .map_err(|e| self.classify(e))?;
        Ok(result.deleted_count > 0)
    }

    async fn fetch_page(
        &self,
        target: StoreTarget<'_>,
        after: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<(String, Envelope)>> {
        let documents: Vec<Document> = self
            .collection(target.name)
            .aggregate(page_pipeline(target.key_field, after, limit))
            .await
            .map_err(|e| self.classify(e))?
            .try_collect()
            .await
            .map_err(|e| self.classify(e))?;

        Ok(documents
            .into_iter()
            .filter_map(|mut document| {
                let id = match document.remove(PAGE_KEY) {
                    Some(Bson::String(id)) => id,
                    _ => return None,
                };
                Some((id, into_envelope(document, target.key_field)))
            })
            .collect())
    }

    async fn subscribe(&self, target: StoreTarget<'_>) -> SyncResult<ChangeFeed> {
        let mut stream = self
            .collection(target.name)
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .full_document_before_change(FullDocumentBeforeChangeType::WhenAvailable)
            .await
            .map_err(|e| self.classify(e))?;

        let collection = target.name.to_string();
        let key_field = target.key_field.to_string();
        let (tx, events) = mpsc::channel(FEED_BUFFER);

        let producer = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(event) => {
                        let Some(change) = change_from_event(event, &key_field) else {
                            continue;
                        };
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Store A change stream on '{}' failed: {}", collection, e);
                        break;
                    }
                }
            }
        });

        Ok(ChangeFeed::new(events, producer))
    }
}
