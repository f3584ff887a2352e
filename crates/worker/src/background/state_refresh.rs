//! Periodic GPU state refresh.
//!
//! Re-probes every local service on a fixed interval so the budget
//! manager's snapshot tracks services started or stopped outside the
//! orchestrator. A change in the resident set is published on the event
//! bus as `gpu_state_changed`.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::types::ServiceId;
use kiln_core::vram::GpuState;
use kiln_events::{EventBus, PlatformEvent};
use kiln_gpu::manager::VramBudgetManager;
use tokio_util::sync::CancellationToken;

pub const GPU_STATE_CHANGED: &str = "gpu_state_changed";

/// Resident services and their models, in a comparable form.
fn residents(state: &GpuState) -> Vec<(ServiceId, Option<String>)> {
    let mut out: Vec<_> = state
        .active
        .iter()
        .map(|a| (a.service, a.model.clone()))
        .collect();
    out.sort();
    out
}

pub fn state_event(state: &GpuState) -> PlatformEvent {
    PlatformEvent::new(GPU_STATE_CHANGED)
        .with_payload(serde_json::to_value(state).unwrap_or_default())
        .at(state.refreshed_at)
}

/// Run the refresh loop until `cancel` is triggered.
pub async fn run(
    budget: Arc<VramBudgetManager>,
    bus: Arc<EventBus>,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = every.as_secs(), "GPU state refresh started");

    let mut interval = tokio::time::interval(every);
    let mut last: Option<Vec<(ServiceId, Option<String>)>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("GPU state refresh stopping");
                break;
            }
            _ = interval.tick() => {
                let state = budget.refresh_state().await;
                let current = residents(&state);
                if last.as_ref() != Some(&current) {
                    tracing::info!(
                        active = current.len(),
                        used_gb = state.total_vram_used_gb,
                        status = ?state.status,
                        "GPU resident set changed"
                    );
                    bus.publish(state_event(&state));
                    last = Some(current);
                }
            }
        }
    }
}
