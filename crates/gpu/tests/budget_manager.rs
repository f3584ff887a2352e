//! Budget manager behaviour against in-process fake services.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use kiln_core::failure::FailureKind;
use kiln_core::types::ServiceId;
use kiln_core::vram::{BudgetConfig, GpuStatus, ServiceProfile, SwitchAction, SwitchRequest};
use kiln_gpu::backend::{BackendError, ProbeReport, ServiceBackend};
use kiln_gpu::manager::{BudgetError, VramBudgetManager};

// ---------------------------------------------------------------------------
// Fake service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    up: bool,
    model: Option<String>,
    vram_gb: Option<f64>,
    loading: bool,
    stay_loading: bool,
    fail_activate: bool,
    fail_unload: bool,
    /// Activation cannot reach the service at all.
    activate_unreachable: bool,
    /// The service stops answering once activated.
    down_after_activate: bool,
    /// VRAM the service reports once activated.
    activated_vram_gb: Option<f64>,
    unload_calls: usize,
    activate_calls: usize,
}

struct FakeService {
    service: ServiceId,
    state: Mutex<FakeState>,
    activate_delay: Duration,
}

impl FakeService {
    fn idle(service: ServiceId) -> Arc<Self> {
        Arc::new(Self {
            service,
            state: Mutex::new(FakeState {
                up: true,
                ..FakeState::default()
            }),
            activate_delay: Duration::ZERO,
        })
    }

    fn resident(service: ServiceId, model: &str, vram_gb: f64) -> Arc<Self> {
        let fake = Self::idle(service);
        {
            let mut s = fake.state.lock().unwrap();
            s.model = Some(model.to_string());
            s.vram_gb = Some(vram_gb);
        }
        fake
    }

    fn down(service: ServiceId) -> Arc<Self> {
        Arc::new(Self {
            service,
            state: Mutex::new(FakeState::default()),
            activate_delay: Duration::ZERO,
        })
    }

    fn slow(service: ServiceId, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            service,
            state: Mutex::new(FakeState {
                up: true,
                ..FakeState::default()
            }),
            activate_delay: delay,
        })
    }

    fn configure(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }

    fn unload_calls(&self) -> usize {
        self.state.lock().unwrap().unload_calls
    }

    fn activate_calls(&self) -> usize {
        self.state.lock().unwrap().activate_calls
    }

    fn is_resident(&self) -> bool {
        self.state.lock().unwrap().model.is_some()
    }
}

#[async_trait]
impl ServiceBackend for FakeService {
    fn service(&self) -> ServiceId {
        self.service
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let s = self.state.lock().unwrap();
        if !s.up {
            return Err(BackendError::Payload("connection refused".into()));
        }
        let mut report = ProbeReport::reachable(self.service);
        if let Some(model) = &s.model {
            report = report.with_model(model.clone());
        }
        report.vram_used_gb = s.vram_gb;
        report.loading = s.loading;
        Ok(report)
    }

    async fn unload(&self) -> Result<(), BackendError> {
        let mut s = self.state.lock().unwrap();
        s.unload_calls += 1;
        if s.fail_unload {
            return Err(BackendError::Status {
                status: 500,
                body: "unload failed".into(),
            });
        }
        s.model = None;
        s.vram_gb = None;
        Ok(())
    }

    async fn activate(&self, model: Option<&str>) -> Result<(), BackendError> {
        if !self.activate_delay.is_zero() {
            tokio::time::sleep(self.activate_delay).await;
        }
        let unreachable = self.state.lock().unwrap().activate_unreachable;
        if unreachable {
            self.state.lock().unwrap().activate_calls += 1;
            // Nothing listens on the discard port.
            let err = reqwest::get("http://127.0.0.1:9").await.unwrap_err();
            return Err(BackendError::Request(err));
        }
        let mut s = self.state.lock().unwrap();
        s.activate_calls += 1;
        if s.fail_activate {
            return Err(BackendError::Status {
                status: 500,
                body: "checkpoint not found: missing".into(),
            });
        }
        s.model = Some(model.unwrap_or("default").to_string());
        s.vram_gb = s.activated_vram_gb;
        s.loading = s.stay_loading;
        if s.down_after_activate {
            s.up = false;
        }
        Ok(())
    }
}

/// 12 GB card, 1 GB margin: 11 GB usable.
fn twelve_gb_config() -> BudgetConfig {
    BudgetConfig::new(12.0)
        .with_safety_margin(1.0)
        .with_profiles(vec![
            ServiceProfile::new(ServiceId::ImageDiffusion, 5.5),
            ServiceProfile::new(ServiceId::WorkflowEngine, 8.0),
            ServiceProfile::new(ServiceId::InferenceLlm, 4.0).with_model("llama3.1:8b", 6.5),
            ServiceProfile::new(ServiceId::Embeddings, 1.0),
        ])
}

fn manager(backends: Vec<Arc<FakeService>>) -> VramBudgetManager {
    let backends: Vec<Arc<dyn ServiceBackend>> = backends
        .into_iter()
        .map(|b| b as Arc<dyn ServiceBackend>)
        .collect();
    VramBudgetManager::new(twelve_gb_config(), backends)
        .with_probe_timeout(Duration::from_millis(500))
}

// ---------------------------------------------------------------------------
// Test: refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refresh_counts_only_active_services() {
    let diffusion = FakeService::resident(ServiceId::ImageDiffusion, "sd", 5.5);
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    let llm = FakeService::down(ServiceId::InferenceLlm);
    let mgr = manager(vec![diffusion, comfy, llm]);

    let state = mgr.refresh_state().await;

    assert_eq!(state.active.len(), 1);
    assert!(state.is_active(ServiceId::ImageDiffusion));
    assert!((state.total_vram_used_gb - 5.5).abs() < 1e-9);
    assert!((state.available_vram_gb - 5.5).abs() < 1e-9);
    assert_eq!(state.status, GpuStatus::Active);
    assert_eq!(mgr.snapshot().await, state);
}

#[tokio::test]
async fn table_value_wins_over_measured_usage() {
    let llm = FakeService::resident(ServiceId::InferenceLlm, "llama3.1:8b", 9.0);
    let mgr = manager(vec![llm]);

    let state = mgr.refresh_state().await;
    let active = state.find(ServiceId::InferenceLlm).unwrap();
    assert!((active.vram_usage_gb - 6.5).abs() < 1e-9);
}

#[tokio::test]
async fn started_at_survives_refresh_while_model_unchanged() {
    let diffusion = FakeService::resident(ServiceId::ImageDiffusion, "sd", 5.5);
    let mgr = manager(vec![diffusion.clone()]);

    let first = mgr.refresh_state().await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = mgr.refresh_state().await;
    assert_eq!(
        first.find(ServiceId::ImageDiffusion).unwrap().started_at,
        second.find(ServiceId::ImageDiffusion).unwrap().started_at
    );

    diffusion.configure(|s| s.model = Some("sdxl".into()));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = mgr.refresh_state().await;
    assert!(
        third.find(ServiceId::ImageDiffusion).unwrap().started_at
            > first.find(ServiceId::ImageDiffusion).unwrap().started_at
    );
}

// ---------------------------------------------------------------------------
// Test: can_activate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn can_activate_plans_against_snapshot() {
    let diffusion = FakeService::resident(ServiceId::ImageDiffusion, "sd", 5.5);
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    let mgr = manager(vec![diffusion.clone(), comfy]);
    mgr.refresh_state().await;

    let plan = mgr.can_activate(ServiceId::WorkflowEngine, None).await;

    assert!(plan.can_activate);
    assert_eq!(plan.requires_unload, vec![ServiceId::ImageDiffusion]);
    assert_eq!(diffusion.unload_calls(), 0);
}

// ---------------------------------------------------------------------------
// Test: switch_to
// ---------------------------------------------------------------------------

#[tokio::test]
async fn switch_unloads_diffusion_for_workflow_engine() {
    let diffusion = FakeService::resident(ServiceId::ImageDiffusion, "sd", 5.5);
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    comfy.configure(|s| s.activated_vram_gb = Some(8.0));
    let mgr = manager(vec![diffusion.clone(), comfy.clone()]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Switched);
    assert_eq!(result.unloaded, vec![ServiceId::ImageDiffusion]);
    assert!((result.vram_before_gb - 5.5).abs() < 1e-9);
    assert!((result.vram_after_gb - 8.0).abs() < 1e-9);
    assert!(!diffusion.is_resident());
    assert_eq!(comfy.activate_calls(), 1);

    let state = mgr.snapshot().await;
    assert!(state.is_active(ServiceId::WorkflowEngine));
    assert!(!state.is_active(ServiceId::ImageDiffusion));
    assert!(state.total_vram_used_gb <= mgr.config().usable_vram_gb());
}

#[tokio::test]
async fn switch_without_unload_is_activated() {
    let embeddings = FakeService::resident(ServiceId::Embeddings, "bge", 1.0);
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    comfy.configure(|s| s.activated_vram_gb = Some(8.0));
    let mgr = manager(vec![embeddings.clone(), comfy]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Activated);
    assert!(result.unloaded.is_empty());
    assert_eq!(embeddings.unload_calls(), 0);
}

#[tokio::test]
async fn already_active_target_is_left_alone() {
    let llm = FakeService::resident(ServiceId::InferenceLlm, "llama3.1:8b", 6.5);
    let mgr = manager(vec![llm.clone()]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::InferenceLlm).with_model("llama3.1:8b"))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::AlreadyActive);
    assert_eq!(llm.activate_calls(), 0);
    assert_eq!(llm.unload_calls(), 0);
}

#[tokio::test]
async fn model_change_reloads_target() {
    let llm = FakeService::resident(ServiceId::InferenceLlm, "small", 4.0);
    let mgr = manager(vec![llm.clone()]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::InferenceLlm).with_model("llama3.1:8b"))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Activated);
    assert_eq!(llm.unload_calls(), 1);
    assert_eq!(llm.activate_calls(), 1);
    assert_eq!(
        mgr.snapshot()
            .await
            .find(ServiceId::InferenceLlm)
            .unwrap()
            .model
            .as_deref(),
        Some("llama3.1:8b")
    );
}

#[tokio::test]
async fn infeasible_switch_has_no_side_effects() {
    let config = twelve_gb_config().with_profiles(vec![
        ServiceProfile::new(ServiceId::WorkflowEngine, 20.0),
        ServiceProfile::new(ServiceId::ImageDiffusion, 5.5),
    ]);
    let diffusion = FakeService::resident(ServiceId::ImageDiffusion, "sd", 5.5);
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    let mgr = VramBudgetManager::new(
        config,
        vec![
            diffusion.clone() as Arc<dyn ServiceBackend>,
            comfy.clone() as Arc<dyn ServiceBackend>,
        ],
    );

    let err = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap_err();

    assert_matches!(err, BudgetError::BudgetExceeded { service: ServiceId::WorkflowEngine, ref reason } if reason.contains("short by"));
    assert_eq!(diffusion.unload_calls(), 0);
    assert_eq!(comfy.activate_calls(), 0);
    assert!(diffusion.is_resident());
}

#[tokio::test]
async fn unknown_service_is_rejected() {
    let mgr = manager(vec![FakeService::idle(ServiceId::WorkflowEngine)]);
    assert_matches!(
        mgr.switch_to(&SwitchRequest::new(ServiceId::Embeddings)).await,
        Err(BudgetError::UnknownService(ServiceId::Embeddings))
    );
}

#[tokio::test]
async fn activation_failure_is_reported_as_failed_result() {
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    comfy.configure(|s| s.fail_activate = true);
    let mgr = manager(vec![comfy]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Failed);
    assert!(result.message.contains("No compatible model"), "{}", result.message);
    assert_eq!(result.failure, Some(FailureKind::MisconfiguredBackend));
}

#[tokio::test]
async fn unreachable_activation_keeps_its_kind() {
    let diffusion = FakeService::idle(ServiceId::ImageDiffusion);
    diffusion.configure(|s| s.activate_unreachable = true);
    let mgr = manager(vec![diffusion.clone()]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::ImageDiffusion).with_model("sd"))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Failed);
    assert_eq!(result.failure, Some(FailureKind::Unreachable));
    assert_eq!(diffusion.activate_calls(), 1);
}

#[tokio::test]
async fn silent_target_after_activation_is_unreachable() {
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    comfy.configure(|s| s.down_after_activate = true);
    let mgr = manager(vec![comfy]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Failed);
    assert!(result.message.contains("did not respond"));
    assert_eq!(result.failure, Some(FailureKind::Unreachable));
}

#[tokio::test]
async fn still_loading_target_is_queued() {
    let diffusion = FakeService::idle(ServiceId::ImageDiffusion);
    diffusion.configure(|s| {
        s.stay_loading = true;
        s.activated_vram_gb = Some(5.5);
    });
    let mgr = manager(vec![diffusion]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::ImageDiffusion).with_model("sd"))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Queued);
    assert!(!result.is_success());
}

#[tokio::test]
async fn failed_unload_is_logged_and_switch_continues() {
    let embeddings = FakeService::resident(ServiceId::Embeddings, "bge", 1.0);
    embeddings.configure(|s| s.fail_unload = true);
    let diffusion = FakeService::resident(ServiceId::ImageDiffusion, "sd", 5.5);
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    comfy.configure(|s| s.activated_vram_gb = Some(8.0));
    let mgr = manager(vec![embeddings.clone(), diffusion.clone(), comfy.clone()]);

    // 11 - 6.5 = 4.5 available; embeddings then diffusion are planned.
    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();

    assert_eq!(embeddings.unload_calls(), 1);
    assert_eq!(diffusion.unload_calls(), 1);
    assert_eq!(comfy.activate_calls(), 1);
    assert_eq!(result.unloaded, vec![ServiceId::ImageDiffusion]);
    // 1.0 (embeddings still resident) + 8.0 fits the 11 GB ceiling.
    assert_eq!(result.action, SwitchAction::Switched);
}

#[tokio::test]
async fn usage_over_ceiling_after_activation_fails() {
    let embeddings = FakeService::resident(ServiceId::Embeddings, "bge", 1.0);
    let comfy = FakeService::idle(ServiceId::WorkflowEngine);
    // Reports far more than its table value once running.
    comfy.configure(|s| s.activated_vram_gb = Some(10.5));
    let mgr = manager(vec![embeddings, comfy]);

    let result = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::Failed);
    assert!(result.message.contains("above the usable"));
    assert_eq!(result.failure, Some(FailureKind::ResourceExhausted));
}

#[tokio::test]
async fn concurrent_switch_to_same_target_fails_fast() {
    let comfy = FakeService::slow(ServiceId::WorkflowEngine, Duration::from_millis(200));
    let mgr = Arc::new(manager(vec![comfy.clone()]));

    let first = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move {
            mgr.switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await;
    assert_matches!(second, Err(BudgetError::SwitchInProgress(ServiceId::WorkflowEngine)));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.action, SwitchAction::Activated);
    assert_eq!(comfy.activate_calls(), 1);

    // The guard is released once the first switch returns.
    let third = mgr
        .switch_to(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();
    assert_eq!(third.action, SwitchAction::AlreadyActive);
}

// ---------------------------------------------------------------------------
// Test: ensure_resident
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ensure_resident_skips_switch_for_resident_target() {
    let comfy = FakeService::resident(ServiceId::WorkflowEngine, "animatediff", 8.0);
    let mgr = manager(vec![comfy.clone()]);
    mgr.refresh_state().await;

    let result = mgr
        .ensure_resident(&SwitchRequest::new(ServiceId::WorkflowEngine))
        .await
        .unwrap();

    assert_eq!(result.action, SwitchAction::AlreadyActive);
    assert_eq!(comfy.activate_calls(), 0);
    assert_eq!(comfy.unload_calls(), 0);
}

#[tokio::test]
async fn ensure_resident_waits_out_a_concurrent_switch() {
    let comfy = FakeService::slow(ServiceId::WorkflowEngine, Duration::from_millis(200));
    comfy.configure(|s| s.activated_vram_gb = Some(8.0));
    let mgr = Arc::new(manager(vec![comfy.clone()]));

    let request = SwitchRequest::new(ServiceId::WorkflowEngine);
    let (first, second) = tokio::join!(
        mgr.ensure_resident(&request),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            mgr.ensure_resident(&request).await
        }
    );

    assert_eq!(first.unwrap().action, SwitchAction::Activated);
    assert_eq!(second.unwrap().action, SwitchAction::AlreadyActive);
    assert_eq!(comfy.activate_calls(), 1);
}
