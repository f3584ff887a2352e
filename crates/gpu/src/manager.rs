//! VRAM budget manager.
//!
//! [`VramBudgetManager`] owns the live [`GpuState`] snapshot. It refreshes
//! the snapshot by probing every registered [`ServiceBackend`], answers
//! "can this service fit?" with the planner from `kiln-core`, and performs
//! switches: unload what the plan names, activate the target, re-probe.
//!
//! Switches are serialized per target service. A second
//! [`switch_to`](VramBudgetManager::switch_to) on a service whose switch is
//! still running fails fast with [`BudgetError::SwitchInProgress`].
//! [`ensure_resident`](VramBudgetManager::ensure_resident) is the caller-side
//! entry point: it skips the switch when the target is already resident and
//! waits out a concurrent switch before planning again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use kiln_core::failure::FailureKind;
use kiln_core::types::ServiceId;
use kiln_core::vram::{
    plan_activation, ActivationPlan, ActiveService, BudgetConfig, GpuState, SwitchAction,
    SwitchRequest, SwitchResult,
};
use tokio::sync::{Notify, RwLock};

use crate::backend::{ProbeReport, ServiceBackend};
use crate::probe::{probe_all, PROBE_TIMEOUT};

/// Tolerance when comparing re-probed usage against the ceiling.
const CEILING_TOLERANCE_GB: f64 = 1e-6;

pub struct VramBudgetManager {
    backends: Vec<Arc<dyn ServiceBackend>>,
    config: BudgetConfig,
    state: RwLock<GpuState>,
    /// Targets with a switch currently running.
    in_flight: Mutex<HashSet<ServiceId>>,
    /// Woken whenever a switch releases its target.
    switch_done: Notify,
    probe_timeout: Duration,
}

impl VramBudgetManager {
    /// Create a manager over `backends`. The initial snapshot is empty;
    /// call [`refresh_state`](Self::refresh_state) to populate it.
    pub fn new(config: BudgetConfig, backends: Vec<Arc<dyn ServiceBackend>>) -> Self {
        let state = GpuState::empty(&config, Utc::now());
        Self {
            backends,
            config,
            state: RwLock::new(state),
            in_flight: Mutex::new(HashSet::new()),
            switch_done: Notify::new(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Registered backend for `service`, if any.
    pub fn backend(&self, service: ServiceId) -> Option<Arc<dyn ServiceBackend>> {
        self.backends
            .iter()
            .find(|b| b.service() == service)
            .cloned()
    }

    pub fn services(&self) -> Vec<ServiceId> {
        self.backends.iter().map(|b| b.service()).collect()
    }

    /// Copy of the last refreshed snapshot.
    pub async fn snapshot(&self) -> GpuState {
        self.state.read().await.clone()
    }

    /// Probe every backend and replace the snapshot.
    ///
    /// Services that fail or time out are treated as inactive.
    pub async fn refresh_state(&self) -> GpuState {
        self.refresh_with_reports().await.0
    }

    async fn refresh_with_reports(&self) -> (GpuState, Vec<ProbeReport>) {
        let reports = probe_all(&self.backends, self.probe_timeout).await;
        let now = Utc::now();

        let mut guard = self.state.write().await;
        let active: Vec<ActiveService> = reports
            .iter()
            .filter(|r| r.available && r.active)
            .map(|r| {
                let started_at = guard
                    .find(r.service)
                    .filter(|prev| prev.model == r.model)
                    .map(|prev| prev.started_at)
                    .unwrap_or(now);
                ActiveService {
                    service: r.service,
                    model: r.model.clone(),
                    vram_usage_gb: self.config.resident_vram(
                        r.service,
                        r.model.as_deref(),
                        r.vram_used_gb,
                    ),
                    started_at,
                }
            })
            .collect();

        let state = GpuState::from_active(active, &self.config, now);
        *guard = state.clone();
        drop(guard);

        tracing::debug!(
            active = state.active.len(),
            used_gb = state.total_vram_used_gb,
            available_gb = state.available_vram_gb,
            status = ?state.status,
            "GPU state refreshed"
        );
        (state, reports)
    }

    /// Plan an activation against the current snapshot. No side effects.
    pub async fn can_activate(&self, service: ServiceId, model: Option<&str>) -> ActivationPlan {
        let state = self.state.read().await;
        plan_activation(&state, &self.config, service, model)
    }

    /// Make `request.service` resident, unloading other services as planned.
    pub async fn switch_to(&self, request: &SwitchRequest) -> Result<SwitchResult, BudgetError> {
        let service = request.service;
        let model = request.model.as_deref();
        let target = self
            .backend(service)
            .ok_or(BudgetError::UnknownService(service))?;
        let _guard = SwitchGuard::acquire(&self.in_flight, &self.switch_done, service)
            .ok_or(BudgetError::SwitchInProgress(service))?;

        let before = self.refresh_state().await;
        let plan = plan_activation(&before, &self.config, service, model);

        if !plan.can_activate {
            tracing::warn!(
                service = %service,
                model = ?model,
                priority = ?request.priority,
                reason = %plan.reason,
                "Switch rejected by VRAM budget"
            );
            return Err(BudgetError::BudgetExceeded {
                service,
                reason: plan.reason,
            });
        }

        if plan.already_active {
            return Ok(SwitchResult {
                action: SwitchAction::AlreadyActive,
                service,
                model: plan.model,
                unloaded: Vec::new(),
                vram_before_gb: before.total_vram_used_gb,
                vram_after_gb: before.total_vram_used_gb,
                message: plan.reason,
                failure: None,
            });
        }

        tracing::info!(
            service = %service,
            model = ?model,
            priority = ?request.priority,
            unload = ?plan.requires_unload,
            "Switching GPU service"
        );

        let mut unloaded = Vec::new();
        for victim in &plan.requires_unload {
            let Some(backend) = self.backend(*victim) else {
                continue;
            };
            match backend.unload().await {
                Ok(()) => {
                    tracing::info!(service = %victim, "Service unloaded");
                    unloaded.push(*victim);
                }
                Err(e) => {
                    tracing::warn!(service = %victim, error = %e, "Unload failed, continuing");
                }
            }
        }

        // A model change releases the target's current model first.
        if before.is_active(service) {
            if let Err(e) = target.unload().await {
                tracing::warn!(service = %service, error = %e, "Unload of previous model failed");
            }
        }

        if let Err(e) = target.activate(model).await {
            tracing::warn!(service = %service, error = %e, "Activation failed");
            let after = self.refresh_state().await;
            return Ok(SwitchResult {
                action: SwitchAction::Failed,
                service,
                model: request.model.clone(),
                unloaded,
                vram_before_gb: before.total_vram_used_gb,
                vram_after_gb: after.total_vram_used_gb,
                message: format!("Activation of {service} failed: {}", e.user_message()),
                failure: Some(e.kind()),
            });
        }

        let (after, reports) = self.refresh_with_reports().await;
        let report = reports.into_iter().find(|r| r.service == service);
        let usable = self.config.usable_vram_gb();

        let (action, message, failure) = if after.total_vram_used_gb > usable + CEILING_TOLERANCE_GB {
            (
                SwitchAction::Failed,
                format!(
                    "VRAM usage after activation is {:.1} GB, above the usable {:.1} GB",
                    after.total_vram_used_gb, usable
                ),
                Some(FailureKind::ResourceExhausted),
            )
        } else {
            match report {
                Some(r) if !r.available => (
                    SwitchAction::Failed,
                    format!("{service} did not respond after activation"),
                    Some(FailureKind::Unreachable),
                ),
                Some(r) if r.loading => (
                    SwitchAction::Queued,
                    format!("{service} accepted the activation and is still loading"),
                    None,
                ),
                _ if unloaded.is_empty() => {
                    (SwitchAction::Activated, format!("{service} activated"), None)
                }
                _ => {
                    let names: Vec<&str> = unloaded.iter().map(ServiceId::as_str).collect();
                    (
                        SwitchAction::Switched,
                        format!("{service} activated after unloading {}", names.join(", ")),
                        None,
                    )
                }
            }
        };

        tracing::info!(
            service = %service,
            action = ?action,
            vram_before_gb = before.total_vram_used_gb,
            vram_after_gb = after.total_vram_used_gb,
            "Switch finished"
        );

        Ok(SwitchResult {
            action,
            service,
            model: request.model.clone(),
            unloaded,
            vram_before_gb: before.total_vram_used_gb,
            vram_after_gb: after.total_vram_used_gb,
            message,
            failure,
        })
    }

    /// Make `request.service` resident for a caller about to use it.
    ///
    /// Returns `AlreadyActive` without touching any backend when the last
    /// snapshot already has the target (and requested model) resident. When
    /// another switch to the same target is running, waits for it to finish
    /// and plans again instead of failing.
    pub async fn ensure_resident(&self, request: &SwitchRequest) -> Result<SwitchResult, BudgetError> {
        let service = request.service;
        loop {
            let plan = self.can_activate(service, request.model.as_deref()).await;
            if plan.already_active {
                let used = self.snapshot().await.total_vram_used_gb;
                return Ok(SwitchResult {
                    action: SwitchAction::AlreadyActive,
                    service,
                    model: plan.model,
                    unloaded: Vec::new(),
                    vram_before_gb: used,
                    vram_after_gb: used,
                    message: plan.reason,
                    failure: None,
                });
            }

            // Register before trying so a release between the attempt and
            // the wait is not missed.
            let released = self.switch_done.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.switch_to(request).await {
                Err(BudgetError::SwitchInProgress(_)) => {
                    tracing::debug!(service = %service, "Waiting for concurrent switch");
                    released.await;
                }
                other => return other,
            }
        }
    }
}

/// Marks a target busy for the lifetime of one switch.
struct SwitchGuard<'a> {
    in_flight: &'a Mutex<HashSet<ServiceId>>,
    released: &'a Notify,
    service: ServiceId,
}

impl<'a> SwitchGuard<'a> {
    fn acquire(
        in_flight: &'a Mutex<HashSet<ServiceId>>,
        released: &'a Notify,
        service: ServiceId,
    ) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(service) {
            return None;
        }
        Some(Self {
            in_flight,
            released,
            service,
        })
    }
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.service);
        drop(set);
        self.released.notify_waiters();
    }
}

/// Errors from [`VramBudgetManager::switch_to`].
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// No backend is registered for the service.
    #[error("No backend registered for {0}")]
    UnknownService(ServiceId),

    /// Another switch to the same service has not finished. Maps to
    /// [`FailureKind::Busy`]; retrying after the switch completes is safe.
    #[error("A switch to {0} is already in progress")]
    SwitchInProgress(ServiceId),

    /// No unload set frees enough VRAM. Nothing was unloaded.
    #[error("{reason}")]
    BudgetExceeded { service: ServiceId, reason: String },
}

impl BudgetError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BudgetError::UnknownService(_) => FailureKind::MisconfiguredBackend,
            BudgetError::SwitchInProgress(_) => FailureKind::Busy,
            BudgetError::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
        }
    }
}
