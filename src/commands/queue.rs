// ABOUTME: Queue commands: enqueue, drain, stats, history, retry, purge and keygen
// ABOUTME: Local-only commands never connect to the stores

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sync_queue::{RecordKey, SyncRecord};

use super::{open_queue_store, CommonOptions, Runtime};
use crate::codec::EncryptionKey;
use crate::engine::AttemptOutcome;

/// Queue one record; with `offline`, skip the immediate attempt.
pub async fn enqueue(
    options: &CommonOptions,
    entity_type: &str,
    record_json: &str,
    offline: bool,
) -> Result<()> {
    let record: Value = serde_json::from_str(record_json).context("Record is not valid JSON")?;
    let runtime = Runtime::connect(options).await?;
    if offline {
        runtime.queue.connectivity().set_offline();
    }

    let key = runtime.queue.enqueue(entity_type, record).await?;
    let stored = runtime
        .queue
        .get(&key)?
        .context("Enqueued record disappeared from the queue")?;
    println!("{} {}", key, stored.status);
    if let Some(error) = stored.last_error {
        println!("  last error: {}", error);
    }
    Ok(())
}

pub async fn drain(options: &CommonOptions) -> Result<()> {
    let runtime = Runtime::connect(options).await?;
    if !runtime.queue.connectivity().is_online() {
        bail!("Stores are unreachable; nothing drained");
    }
    let report = runtime.queue.drain().await?;
    runtime.queue.purge_expired()?;

    println!(
        "Drained in {} pass(es): {} synced, {} failed, {} still pending retries",
        report.passes, report.synced, report.failed, report.retried
    );
    for error in &report.errors {
        println!("  {}", error);
    }
    if report.interrupted {
        println!("Connectivity was lost before the queue was empty");
    }
    Ok(())
}

pub fn stats(options: &CommonOptions, entity_type: Option<&str>) -> Result<()> {
    let settings = options.load_settings()?;
    if let Some(entity_type) = entity_type {
        settings.registry()?.resolve(entity_type)?;
    }
    let store = open_queue_store(&settings, options)?;
    let stats = store.stats(entity_type)?;
    println!("total:   {}", stats.total);
    println!("pending: {}", stats.pending);
    println!("synced:  {}", stats.synced);
    println!("failed:  {}", stats.failed);
    Ok(())
}

pub fn history(options: &CommonOptions, limit: usize) -> Result<()> {
    let settings = options.load_settings()?;
    let store = open_queue_store(&settings, options)?;
    for record in store.history(limit)? {
        print_record(&record);
    }
    Ok(())
}

pub async fn retry(options: &CommonOptions, entity_type: &str, id: &str) -> Result<()> {
    let runtime = Runtime::connect(options).await?;
    let key = RecordKey::new(entity_type, id);
    match runtime.queue.retry_failed(&key).await? {
        None => bail!("{} is not a failed record", key),
        Some(AttemptOutcome::Synced { target }) => println!("{} synced to store {}", key, target),
        Some(AttemptOutcome::Failed { reason }) => println!("{} failed again: {}", key, reason),
        Some(AttemptOutcome::RetryScheduled { reason, .. }) => {
            println!("{} pending ({})", key, reason)
        }
        Some(AttemptOutcome::Superseded) => println!("{} was superseded", key),
    }
    Ok(())
}

pub fn purge(options: &CommonOptions, older_than_days: Option<u32>) -> Result<()> {
    let settings = options.load_settings()?;
    let store = open_queue_store(&settings, options)?;
    let days = older_than_days.unwrap_or(settings.queue.retention_days);
    let age = chrono::Duration::days(i64::from(days));
    let purged = store.purge_synced_before(chrono::Utc::now() - age)?;
    println!("Purged {} synced records older than {} days", purged, days);
    Ok(())
}

/// Print a fresh base64 payload key.
pub fn keygen() -> Result<()> {
    println!("{}", EncryptionKey::generate().to_base64());
    Ok(())
}

fn print_record(record: &SyncRecord) {
    println!(
        "{:<40} {:<8} retries {}/{}  updated {}{}",
        record.key().to_string(),
        record.status.as_str(),
        record.retry_count,
        record.max_retries,
        record.updated_at.format("%Y-%m-%d %H:%M:%S"),
        record
            .last_error
            .as_deref()
            .map(|e| format!("  ({})", e))
            .unwrap_or_default()
    );
}
