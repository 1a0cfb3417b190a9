// ABOUTME: PostgreSQL backend (store B) keeping each entity as a JSONB row
// ABOUTME: Change feed built from a row trigger and LISTEN/NOTIFY

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use postgres_native_tls::MakeTlsConnector;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sync_queue::StoreSide;
use tokio::sync::{mpsc, Mutex};
use tokio_postgres::{AsyncMessage, Client};

use super::{
    AbortOnDrop, ChangeFeed, ChangeKind, RemoteStore, StoreChange, StoreTarget, FEED_BUFFER,
};
use crate::error::{SyncError, SyncResult};
use crate::provenance::{Envelope, PROVENANCE_FIELD};
use crate::utils::{quote_ident, quote_literal, sanitize_url, validate_identifier};

const NOTIFY_FUNCTION: &str = "dual_replicator_notify";
const NOTIFY_TRIGGER: &str = "dual_replicator_changes";

/// Store B.
///
/// Each entity type maps to a table of the form:
/// - `<key_field>`: TEXT PRIMARY KEY (unique key value)
/// - `data`: JSONB NOT NULL (complete record)
/// - `_provenance`: JSONB (replication tag, NULL for application writes)
/// - `_updated_at`: TIMESTAMPTZ NOT NULL DEFAULT NOW()
///
/// Table and key names are interpolated into SQL and must have passed
/// [`validate_identifier`]; the registry guarantees this for configured
/// entity types.
pub struct RelationalStore {
    url: String,
    allow_self_signed_certs: bool,
    client: Mutex<Option<Arc<Client>>>,
}

impl RelationalStore {
    /// Create a store that connects on first use and reconnects after the
    /// connection drops.
    pub fn new(url: &str, allow_self_signed_certs: bool) -> Self {
        Self {
            url: url.to_string(),
            allow_self_signed_certs,
            client: Mutex::new(None),
        }
    }

    /// Create a store and connect right away.
    pub async fn connect(url: &str, allow_self_signed_certs: bool) -> Result<Self> {
        let store = Self::new(url, allow_self_signed_certs);
        store
            .client()
            .await
            .with_context(|| format!("Failed to connect to store B at {}", sanitize_url(url)))?;
        Ok(store)
    }

    async fn client(&self) -> SyncResult<Arc<Client>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            tracing::info!("Store B connection closed; reconnecting");
        }
        let client = Arc::new(connect_client(&self.url, self.allow_self_signed_certs).await?);
        tracing::info!("Connected to store B at {}", sanitize_url(&self.url));
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Create the table, its index and the change trigger if missing.
    pub async fn ensure_table(&self, target: StoreTarget<'_>) -> Result<()> {
        validate_identifier(target.name).context("Invalid table name")?;
        validate_identifier(target.key_field).context("Invalid key column name")?;

        let table = quote_ident(target.name);
        let key = quote_ident(target.key_field);
        tracing::info!("Ensuring table '{}' exists on store B", target.name);
        let client = self.client().await?;

        let create_table_sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                {key} TEXT PRIMARY KEY,
                data JSONB NOT NULL,
                {provenance} JSONB,
                _updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table = table,
            key = key,
            provenance = PROVENANCE_FIELD,
        );
        client
            .batch_execute(&create_table_sql)
            .await
            .with_context(|| format!("Failed to create table '{}'", target.name))?;

        let function_sql = format!(
            r#"
            CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$
            DECLARE
                row_id TEXT;
            BEGIN
                IF TG_OP = 'DELETE' THEN
                    row_id := to_jsonb(OLD) ->> TG_ARGV[0];
                ELSE
                    row_id := to_jsonb(NEW) ->> TG_ARGV[0];
                END IF;
                PERFORM pg_notify(
                    TG_ARGV[1],
                    json_build_object('op', lower(TG_OP), 'id', row_id)::text
                );
                RETURN NULL;
            END;
            $$ LANGUAGE plpgsql
            "#,
            function = NOTIFY_FUNCTION,
        );
        client
            .batch_execute(&function_sql)
            .await
            .context("Failed to create change notification function")?;

        let trigger_sql = format!(
            r#"
            DROP TRIGGER IF EXISTS {trigger} ON {table};
            CREATE TRIGGER {trigger}
                AFTER INSERT OR UPDATE OR DELETE ON {table}
                FOR EACH ROW EXECUTE FUNCTION {function}({key_arg}, {channel_arg});
            "#,
            trigger = NOTIFY_TRIGGER,
            table = table,
            function = NOTIFY_FUNCTION,
            key_arg = quote_literal(target.key_field),
            channel_arg = quote_literal(&notify_channel(target.name)),
        );
        client
            .batch_execute(&trigger_sql)
            .await
            .with_context(|| format!("Failed to install change trigger on '{}'", target.name))?;

        Ok(())
    }

    fn classify(&self, err: tokio_postgres::Error) -> SyncError {
        SyncError::from_postgres(StoreSide::B, &err)
    }
}

/// Connect and spawn the connection driver.
async fn connect_client(url: &str, allow_self_signed_certs: bool) -> SyncResult<Client> {
    let tls = make_tls(allow_self_signed_certs)
        .map_err(|e| SyncError::transient(StoreSide::B, format!("{:#}", e)))?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .map_err(|e| SyncError::from_postgres(StoreSide::B, &e))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Store B connection error: {}", e);
        }
    });
    Ok(client)
}

fn make_tls(allow_self_signed_certs: bool) -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed_certs)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// NOTIFY channel for a table.
///
/// Channel names are identifiers and would be truncated past 63 bytes, so the
/// name is derived from a hash of the table name.
fn notify_channel(table: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(table.as_bytes()));
    format!("dr_{}", &digest[..24])
}

#[derive(Debug, Deserialize)]
struct Notice {
    op: String,
    id: Option<String>,
}

async fn fetch_envelope(
    client: &Client,
    table: &str,
    key_field: &str,
    id: &str,
) -> SyncResult<Option<Envelope>> {
    let sql = format!(
        "SELECT data, {} FROM {} WHERE {} = $1",
        PROVENANCE_FIELD,
        quote_ident(table),
        quote_ident(key_field)
    );
    let row = client
        .query_opt(&sql, &[&id])
        .await
        .map_err(|e| SyncError::from_postgres(StoreSide::B, &e))?;
    Ok(row.map(|row| {
        let data: Value = row.get(0);
        let provenance: Option<Value> = row.get(1);
        Envelope::from_parts(data, provenance)
    }))
}

#[async_trait]
impl RemoteStore for RelationalStore {
    fn side(&self) -> StoreSide {
        StoreSide::B
    }

    async fn ping(&self) -> SyncResult<()> {
        self.client()
            .await?
            .simple_query("SELECT 1")
            .await
            .map_err(|e| self.classify(e))?;
        Ok(())
    }

    async fn get(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<Option<Envelope>> {
        let client = self.client().await?;
        fetch_envelope(&client, target.name, target.key_field, id).await
    }

    async fn upsert(
        &self,
        target: StoreTarget<'_>,
        id: &str,
        envelope: &Envelope,
    ) -> SyncResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} ({key}, data, {provenance})
            VALUES ($1, $2, $3)
            ON CONFLICT ({key}) DO UPDATE
            SET data = EXCLUDED.data,
                {provenance} = EXCLUDED.{provenance},
                _updated_at = NOW()
            "#,
            table = quote_ident(target.name),
            key = quote_ident(target.key_field),
            provenance = PROVENANCE_FIELD,
        );
        let provenance = envelope.provenance_value();
        self.client()
            .await?
            .execute(&sql, &[&id, &envelope.payload, &provenance])
            .await
            .map_err(|e| self.classify(e))?;
        Ok(())
    }

    async fn delete(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(target.name),
            quote_ident(target.key_field)
        );
        let removed = self
            .client()
            .await?
            .execute(&sql, &[&id])
            .await
            .map_err(|e| self.classify(e))?;
        Ok(removed > 0)
    }

    async fn fetch_page(
        &self,
        target: StoreTarget<'_>,
        after: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<(String, Envelope)>> {
        let sql = format!(
            r#"
            SELECT {key}, data, {provenance}
            FROM {table}
            WHERE $1::text IS NULL OR {key} > $1
            ORDER BY {key}
            LIMIT $2
            "#,
            table = quote_ident(target.name),
            key = quote_ident(target.key_field),
            provenance = PROVENANCE_FIELD,
        );
        let limit = limit as i64;
        let rows = self
            .client()
            .await?
            .query(&sql, &[&after, &limit])
            .await
            .map_err(|e| self.classify(e))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: String = row.get(0);
                let data: Value = row.get(1);
                let provenance: Option<Value> = row.get(2);
                (id, Envelope::from_parts(data, provenance))
            })
            .collect())
    }

    async fn subscribe(&self, target: StoreTarget<'_>) -> SyncResult<ChangeFeed> {
        let tls = make_tls(self.allow_self_signed_certs)
            .map_err(|e| SyncError::transient(StoreSide::B, format!("{:#}", e)))?;
        let (listener, mut connection) = tokio_postgres::connect(&self.url, tls)
            .await
            .map_err(|e| self.classify(e))?;

        let (notice_tx, mut notices) = mpsc::unbounded_channel::<String>();
        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if notice_tx.send(notification.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Store B change feed connection error: {}", e);
                        break;
                    }
                }
            }
        });
        let driver = AbortOnDrop(driver);

        let channel = notify_channel(target.name);
        listener
            .batch_execute(&format!("LISTEN {}", quote_ident(&channel)))
            .await
            .map_err(|e| self.classify(e))?;
        tracing::debug!("Listening on '{}' for table '{}'", channel, target.name);

        let table = target.name.to_string();
        let key_field = target.key_field.to_string();
        let (tx, events) = mpsc::channel(FEED_BUFFER);

        let producer = tokio::spawn(async move {
            // The LISTEN session also serves the row reads.
            let _driver = driver;

            while let Some(raw) = notices.recv().await {
                let notice: Notice = match serde_json::from_str(&raw) {
                    Ok(notice) => notice,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed notification on '{}': {}", table, e);
                        continue;
                    }
                };
                let Some(id) = notice.id else {
                    continue;
                };

                let change = match notice.op.as_str() {
                    "delete" => StoreChange {
                        kind: ChangeKind::Delete,
                        id,
                        envelope: None,
                    },
                    op => {
                        let kind = if op == "insert" {
                            ChangeKind::Insert
                        } else {
                            ChangeKind::Update
                        };
                        match fetch_envelope(&listener, &table, &key_field, &id).await {
                            Ok(Some(envelope)) => StoreChange {
                                kind,
                                id,
                                envelope: Some(envelope),
                            },
                            // Deleted again before we read it; the delete notice follows.
                            Ok(None) => continue,
                            Err(e) => {
                                tracing::warn!(
                                    "Failed to read changed row '{}' from '{}': {}",
                                    id,
                                    table,
                                    e
                                );
                                continue;
                            }
                        }
                    }
                };

                if tx.send(change).await.is_err() {
                    break;
                }
            }
        });

        Ok(ChangeFeed::new(events, producer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_channel_is_a_short_stable_identifier() {
        let channel = notify_channel("motos");
        assert_eq!(channel, notify_channel("motos"));
        assert_ne!(channel, notify_channel("vendors"));
        assert!(channel.len() <= 63);
        assert!(validate_identifier(&channel).is_ok());
        assert!(notify_channel(&"t".repeat(63)).len() <= 63);
    }

    #[test]
    fn notice_payload_parses() {
        let notice: Notice = serde_json::from_str(r#"{"op":"update","id":"m1"}"#).unwrap();
        assert_eq!(notice.op, "update");
        assert_eq!(notice.id.as_deref(), Some("m1"));

        let notice: Notice = serde_json::from_str(r#"{"op":"delete","id":null}"#).unwrap();
        assert!(notice.id.is_none());
    }
}
