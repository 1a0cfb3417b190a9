// ABOUTME: full-sync command running one reconciliation pass in one direction
// ABOUTME: Prints per-entity counts and exits non-zero when anything failed

use anyhow::{bail, Result};

use super::{CommonOptions, Runtime};
use crate::reconcile::Reconciler;
use crate::registry::Flow;

pub async fn full_sync(options: &CommonOptions, flow: Flow) -> Result<()> {
    let runtime = Runtime::connect(options).await?;
    if !runtime.queue.connectivity().is_online() {
        bail!("Stores are unreachable; cannot run full sync");
    }

    let reconciler = Reconciler::new(
        runtime.queue.engine().clone(),
        runtime.settings.reconcile_config(),
    );
    let report = reconciler.full_sync(flow).await;

    println!("Full sync {} finished in {:?}", report.flow, report.duration);
    for entity in &report.entities {
        println!(
            "  {:<24} {} ok ({} written), {} failed{}",
            entity.entity_type,
            entity.success,
            entity.written,
            entity.failed,
            entity
                .error
                .as_deref()
                .map(|e| format!(", stopped early: {}", e))
                .unwrap_or_default()
        );
    }
    println!("Total: {} ok, {} failed", report.success, report.failed);

    if !report.is_clean() {
        bail!("Full sync completed with failures");
    }
    Ok(())
}
