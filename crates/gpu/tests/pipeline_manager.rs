//! Pipeline manager lifecycle.

use std::sync::Arc;

use assert_matches::assert_matches;
use kiln_core::catalog::{ModelCatalog, Precision};
use kiln_core::pipeline::{GpuSettings, PipelineMetrics, PipelineStatus, PipelineStep};
use kiln_gpu::pipeline::{PipelineError, PipelineEvent, PipelineManager};

fn manager() -> PipelineManager {
    PipelineManager::new(Arc::new(ModelCatalog::builtin()), 22.0)
}

fn settings() -> GpuSettings {
    GpuSettings {
        vram_ceiling_gb: 8.0,
        batch_size: 2,
        precision: Precision::Fp16,
    }
}

fn depth_steps() -> Vec<PipelineStep> {
    vec![
        PipelineStep::new("depth_anything_v2_small"),
        PipelineStep::new("realesrgan_x4"),
    ]
}

// ---------------------------------------------------------------------------
// Test: create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_stores_idle_pipeline_and_publishes() {
    let mgr = manager();
    let mut rx = mgr.subscribe();

    let pipeline = mgr.create("depth", depth_steps(), settings()).await.unwrap();

    assert_eq!(pipeline.status, PipelineStatus::Idle);
    assert_eq!(pipeline.metrics.vram_total_gb, 8.0);
    assert_eq!(mgr.get(&pipeline.id).await, Some(pipeline.clone()));
    assert_matches!(rx.recv().await, Ok(PipelineEvent::Created { id, .. }) if id == pipeline.id);
}

#[tokio::test]
async fn create_rejects_step_over_ceiling() {
    let mgr = manager();
    let result = mgr
        .create("video", vec![PipelineStep::new("svd_xt")], settings())
        .await;

    assert_matches!(result, Err(PipelineError::Invalid(_)));
    assert!(mgr.list().await.is_empty());
}

// ---------------------------------------------------------------------------
// Test: lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_stop_restart() {
    let mgr = manager();
    let id = mgr.create("depth", depth_steps(), settings()).await.unwrap().id;

    assert_eq!(mgr.start(&id).await.unwrap().status, PipelineStatus::Running);
    assert_matches!(
        mgr.start(&id).await,
        Err(PipelineError::InvalidTransition {
            from: PipelineStatus::Running,
            to: PipelineStatus::Starting
        })
    );
    assert_eq!(mgr.stop(&id).await.unwrap().status, PipelineStatus::Stopped);
    assert_eq!(mgr.start(&id).await.unwrap().status, PipelineStatus::Running);
}

#[tokio::test]
async fn status_changes_are_published_in_order() {
    let mgr = manager();
    let id = mgr.create("depth", depth_steps(), settings()).await.unwrap().id;
    let mut rx = mgr.subscribe();

    mgr.start(&id).await.unwrap();

    assert_matches!(
        rx.recv().await,
        Ok(PipelineEvent::StatusChanged { from: PipelineStatus::Idle, to: PipelineStatus::Starting, .. })
    );
    assert_matches!(
        rx.recv().await,
        Ok(PipelineEvent::StatusChanged { from: PipelineStatus::Starting, to: PipelineStatus::Running, .. })
    );
}

#[tokio::test]
async fn fail_records_reason_and_allows_restart() {
    let mgr = manager();
    let id = mgr.create("depth", depth_steps(), settings()).await.unwrap().id;
    mgr.start(&id).await.unwrap();

    let failed = mgr.fail(&id, "CUDA out of memory").await.unwrap();
    assert_eq!(failed.status, PipelineStatus::Error);
    assert_eq!(failed.error.as_deref(), Some("CUDA out of memory"));

    let restarted = mgr.start(&id).await.unwrap();
    assert_eq!(restarted.status, PipelineStatus::Running);
    assert!(restarted.error.is_none());
}

#[tokio::test]
async fn metrics_are_replaced() {
    let mgr = manager();
    let id = mgr.create("depth", depth_steps(), settings()).await.unwrap().id;

    let metrics = PipelineMetrics {
        fps: 24.0,
        latency_ms: 41.0,
        vram_used_gb: 2.4,
        vram_total_gb: 8.0,
        frames_processed: 240,
        frames_dropped: 1,
    };
    let updated = mgr.update_metrics(&id, metrics.clone()).await.unwrap();
    assert_eq!(updated.metrics, metrics);

    assert_matches!(
        mgr.update_metrics("missing", PipelineMetrics::default()).await,
        Err(PipelineError::NotFound(_))
    );
}

// ---------------------------------------------------------------------------
// Test: destroy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_pipeline_cannot_be_destroyed() {
    let mgr = manager();
    let id = mgr.create("depth", depth_steps(), settings()).await.unwrap().id;
    mgr.start(&id).await.unwrap();

    assert_matches!(mgr.destroy(&id).await, Err(PipelineError::Busy { .. }));

    mgr.stop(&id).await.unwrap();
    mgr.destroy(&id).await.unwrap();
    assert!(mgr.get(&id).await.is_none());
    assert_matches!(mgr.destroy(&id).await, Err(PipelineError::NotFound(_)));
}
