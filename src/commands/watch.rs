// ABOUTME: watch command running the sync daemon in the foreground
// ABOUTME: Stops on Ctrl+C after cancelling every listener

use anyhow::Result;

use super::{CommonOptions, Runtime};
use crate::daemon::SyncDaemon;

pub async fn watch(options: &CommonOptions) -> Result<()> {
    let runtime = Runtime::connect(options).await?;
    let daemon = SyncDaemon::new(runtime.queue.clone(), runtime.settings.daemon_config());

    tracing::info!("Starting sync daemon...");
    tracing::info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    daemon.run(shutdown_rx).await
}
