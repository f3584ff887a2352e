//! Periodic sweep of finished jobs.
//!
//! The job store is an in-memory working set; terminal jobs older than the
//! retention period are dropped on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use kiln_comfyui::engine::JobEngine;
use tokio_util::sync::CancellationToken;

/// Run the job retention loop until `cancel` is triggered.
pub async fn run(
    jobs: Arc<JobEngine>,
    retention: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = every.as_secs(),
        "Job retention sweep started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention sweep stopping");
                break;
            }
            _ = interval.tick() => {
                let removed = jobs.cleanup(retention).await;
                if removed > 0 {
                    tracing::info!(removed, "Job retention: dropped finished jobs");
                } else {
                    tracing::debug!("Job retention: nothing to drop");
                }
            }
        }
    }
}
