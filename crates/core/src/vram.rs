//! VRAM budget model and unload planner.
//!
//! Pure logic, no probing. The budget manager in `kiln-gpu` feeds live
//! probe results into [`GpuState::from_active`] and asks
//! [`plan_activation`] whether a service fits before touching any backend.
//!
//! VRAM tables and the unload priority order are plain data on
//! [`BudgetConfig`]; adding a backend or model is a table entry, not code.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::failure::FailureKind;
use crate::types::{ServiceId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default total GPU memory when none is configured (24 GB card).
pub const DEFAULT_TOTAL_VRAM_GB: f64 = 24.0;

/// Share of the total reserved for the host OS and driver.
pub const DEFAULT_SAFETY_MARGIN_FRACTION: f64 = 0.08;

/// Usage ratio (of the usable ceiling) at which status becomes `near_limit`.
pub const NEAR_LIMIT_RATIO: f64 = 0.70;

/// Usage ratio (of the usable ceiling) at which status becomes `at_capacity`.
pub const AT_CAPACITY_RATIO: f64 = 0.90;

/// Estimate for a service with no profile at all.
const UNKNOWN_SERVICE_VRAM_GB: f64 = 4.0;

/// Tolerance for float comparisons on GB values.
const EPSILON_GB: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Configuration tables
// ---------------------------------------------------------------------------

/// VRAM requirement of one model on one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVram {
    pub model: String,
    pub vram_gb: f64,
}

/// Per-service VRAM lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub service: ServiceId,
    /// Used when the model is unknown or not in the table.
    pub default_vram_gb: f64,
    pub models: Vec<ModelVram>,
}

impl ServiceProfile {
    pub fn new(service: ServiceId, default_vram_gb: f64) -> Self {
        Self {
            service,
            default_vram_gb,
            models: Vec::new(),
        }
    }

    /// Add a model entry (builder style).
    pub fn with_model(mut self, model: impl Into<String>, vram_gb: f64) -> Self {
        self.models.push(ModelVram {
            model: model.into(),
            vram_gb,
        });
        self
    }

    /// Estimate the VRAM a model needs on this service.
    ///
    /// Exact names win; otherwise the longest table entry that prefixes the
    /// model name is used (`llama3.1:8b-instruct-q4` matches `llama3.1:8b`).
    /// Anything else falls back to the service default.
    pub fn estimate(&self, model: Option<&str>) -> f64 {
        model
            .and_then(|m| self.lookup(m))
            .unwrap_or(self.default_vram_gb)
    }

    /// Table entry for `model` (exact, then longest prefix), if any.
    pub fn lookup(&self, model: &str) -> Option<f64> {
        if let Some(entry) = self.models.iter().find(|m| m.model == model) {
            return Some(entry.vram_gb);
        }

        self.models
            .iter()
            .filter(|m| model.starts_with(m.model.as_str()))
            .max_by_key(|m| m.model.len())
            .map(|m| m.vram_gb)
    }
}

/// Budget policy: how much VRAM exists, how much is reserved, and which
/// services give way first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub total_vram_gb: f64,
    pub safety_margin_gb: f64,
    /// Least essential first.
    pub unload_priority: Vec<ServiceId>,
    pub profiles: Vec<ServiceProfile>,
}

impl BudgetConfig {
    /// Budget for a card with `total_vram_gb`, reserving the default 8%.
    pub fn new(total_vram_gb: f64) -> Self {
        Self {
            total_vram_gb,
            safety_margin_gb: total_vram_gb * DEFAULT_SAFETY_MARGIN_FRACTION,
            unload_priority: default_unload_priority(),
            profiles: default_profiles(),
        }
    }

    pub fn with_safety_margin(mut self, safety_margin_gb: f64) -> Self {
        self.safety_margin_gb = safety_margin_gb;
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<ServiceProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_unload_priority(mut self, order: Vec<ServiceId>) -> Self {
        self.unload_priority = order;
        self
    }

    /// Usable ceiling: total minus the safety margin.
    pub fn usable_vram_gb(&self) -> f64 {
        self.total_vram_gb - self.safety_margin_gb
    }

    pub fn profile(&self, service: ServiceId) -> Option<&ServiceProfile> {
        self.profiles.iter().find(|p| p.service == service)
    }

    /// Estimated VRAM for `model` on `service`, with per-service fallback.
    pub fn estimate_vram(&self, service: ServiceId, model: Option<&str>) -> f64 {
        self.profile(service)
            .map(|p| p.estimate(model))
            .unwrap_or(UNKNOWN_SERVICE_VRAM_GB)
    }

    /// VRAM attributed to a resident service: the table value for its
    /// model, else the measured size, else the service default.
    pub fn resident_vram(
        &self,
        service: ServiceId,
        model: Option<&str>,
        measured_gb: Option<f64>,
    ) -> f64 {
        let table = self
            .profile(service)
            .and_then(|p| model.and_then(|m| p.lookup(m)));
        match (table, measured_gb) {
            (Some(gb), _) => gb,
            (None, Some(gb)) if gb > 0.0 => gb,
            _ => self.estimate_vram(service, model),
        }
    }

    /// Reject budgets that cannot hold anything.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.total_vram_gb <= 0.0 {
            return Err(CoreError::Validation(
                "Total VRAM must be greater than 0".to_string(),
            ));
        }
        if self.safety_margin_gb < 0.0 || self.safety_margin_gb >= self.total_vram_gb {
            return Err(CoreError::Validation(format!(
                "Safety margin must be in [0, {}) GB (got {})",
                self.total_vram_gb, self.safety_margin_gb
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for service in &self.unload_priority {
            if !seen.insert(*service) {
                return Err(CoreError::Validation(format!(
                    "Duplicate service in unload priority: {service}"
                )));
            }
        }
        for profile in &self.profiles {
            if profile.default_vram_gb < 0.0 || profile.models.iter().any(|m| m.vram_gb < 0.0) {
                return Err(CoreError::Validation(format!(
                    "Negative VRAM requirement in profile for {}",
                    profile.service
                )));
            }
        }
        Ok(())
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_VRAM_GB)
    }
}

/// Least essential first: embeddings, image diffusion, workflow engine, chat.
pub fn default_unload_priority() -> Vec<ServiceId> {
    vec![
        ServiceId::Embeddings,
        ServiceId::ImageDiffusion,
        ServiceId::WorkflowEngine,
        ServiceId::InferenceLlm,
    ]
}

/// Built-in VRAM tables for the stock model set.
pub fn default_profiles() -> Vec<ServiceProfile> {
    vec![
        ServiceProfile::new(ServiceId::InferenceLlm, 6.0)
            .with_model("llama3.2:3b", 3.0)
            .with_model("llama3.1:8b", 6.5)
            .with_model("mistral:7b", 5.5)
            .with_model("qwen2.5:7b", 6.0)
            .with_model("gemma2:9b", 7.5)
            .with_model("qwen2.5:14b", 10.5),
        ServiceProfile::new(ServiceId::ImageDiffusion, 6.5)
            .with_model("v1-5-pruned-emaonly", 4.5)
            .with_model("dreamshaper_8", 4.5)
            .with_model("sd_xl_base_1.0", 8.0)
            .with_model("flux1-dev-fp8", 12.0),
        ServiceProfile::new(ServiceId::WorkflowEngine, 8.0)
            .with_model("animatediff", 10.0)
            .with_model("svd_xt", 12.0)
            .with_model("wan2.1_t2v_1.3b", 8.5),
        ServiceProfile::new(ServiceId::Embeddings, 1.5)
            .with_model("nomic-embed-text", 0.7)
            .with_model("bge-m3", 1.3),
    ]
}

// ---------------------------------------------------------------------------
// GPU state snapshot
// ---------------------------------------------------------------------------

/// A service observed resident on the GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveService {
    pub service: ServiceId,
    pub model: Option<String>,
    pub vram_usage_gb: f64,
    pub started_at: Timestamp,
}

/// Coarse utilisation level of the usable ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuStatus {
    Idle,
    Active,
    NearLimit,
    AtCapacity,
}

impl GpuStatus {
    /// Derive the status from used VRAM against the usable ceiling.
    pub fn from_usage(used_gb: f64, usable_gb: f64, any_active: bool) -> Self {
        if !any_active {
            return GpuStatus::Idle;
        }
        if usable_gb <= 0.0 {
            return GpuStatus::AtCapacity;
        }
        let ratio = used_gb / usable_gb;
        if ratio < NEAR_LIMIT_RATIO {
            GpuStatus::Active
        } else if ratio < AT_CAPACITY_RATIO {
            GpuStatus::NearLimit
        } else {
            GpuStatus::AtCapacity
        }
    }
}

/// Snapshot of which exclusive services hold VRAM.
///
/// `available_vram_gb` is always `total - margin - total_vram_used_gb`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuState {
    pub active: Vec<ActiveService>,
    pub total_vram_used_gb: f64,
    pub available_vram_gb: f64,
    pub status: GpuStatus,
    pub refreshed_at: Timestamp,
}

impl GpuState {
    /// Nothing resident.
    pub fn empty(config: &BudgetConfig, refreshed_at: Timestamp) -> Self {
        Self::from_active(Vec::new(), config, refreshed_at)
    }

    /// Build a snapshot from the services observed active.
    pub fn from_active(
        active: Vec<ActiveService>,
        config: &BudgetConfig,
        refreshed_at: Timestamp,
    ) -> Self {
        let total_vram_used_gb: f64 = active.iter().map(|a| a.vram_usage_gb.max(0.0)).sum();
        let usable = config.usable_vram_gb();
        Self {
            status: GpuStatus::from_usage(total_vram_used_gb, usable, !active.is_empty()),
            available_vram_gb: usable - total_vram_used_gb,
            total_vram_used_gb,
            active,
            refreshed_at,
        }
    }

    pub fn find(&self, service: ServiceId) -> Option<&ActiveService> {
        self.active.iter().find(|a| a.service == service)
    }

    pub fn is_active(&self, service: ServiceId) -> bool {
        self.find(service).is_some()
    }
}

// ---------------------------------------------------------------------------
// Activation planning
// ---------------------------------------------------------------------------

/// Outcome of asking whether a service can be activated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationPlan {
    pub service: ServiceId,
    pub model: Option<String>,
    pub can_activate: bool,
    /// The target already runs a compatible model; nothing to do.
    pub already_active: bool,
    /// Services to unload, in the order they must be unloaded.
    pub requires_unload: Vec<ServiceId>,
    pub reason: String,
    pub required_vram_gb: f64,
    /// Available VRAM once the unload set is gone.
    pub projected_available_gb: f64,
}

/// Decide whether `service` (running `model`) fits the budget and, if not,
/// which active services to unload.
///
/// Walks `config.unload_priority` over active services other than the
/// target and stops at the first prefix of that order that frees enough.
/// Deterministic for a given state and config.
pub fn plan_activation(
    state: &GpuState,
    config: &BudgetConfig,
    service: ServiceId,
    model: Option<&str>,
) -> ActivationPlan {
    let mut available = state.available_vram_gb;
    let current = state.find(service);

    // A resident target running a compatible model needs no VRAM at all.
    if let Some(current) = current {
        let compatible = match model {
            None => true,
            Some(m) => current.model.as_deref() == Some(m),
        };
        if compatible {
            return ActivationPlan {
                service,
                model: current.model.clone(),
                can_activate: true,
                already_active: true,
                requires_unload: Vec::new(),
                reason: format!("{service} is already active"),
                required_vram_gb: 0.0,
                projected_available_gb: available,
            };
        }
        // Switching models within the service releases the old one.
        available += current.vram_usage_gb;
    }

    let required = config.estimate_vram(service, model);
    let plan = |can_activate, requires_unload, reason, projected| ActivationPlan {
        service,
        model: model.map(str::to_string),
        can_activate,
        already_active: false,
        requires_unload,
        reason,
        required_vram_gb: required,
        projected_available_gb: projected,
    };

    if required <= available + EPSILON_GB {
        return plan(
            true,
            Vec::new(),
            format!("{required:.1} GB required, {available:.1} GB available"),
            available,
        );
    }

    let mut unload = Vec::new();
    for candidate in &config.unload_priority {
        if *candidate == service {
            continue;
        }
        let Some(active) = state.find(*candidate) else {
            continue;
        };
        available += active.vram_usage_gb;
        unload.push(*candidate);
        if required <= available + EPSILON_GB {
            let names: Vec<&str> = unload.iter().map(ServiceId::as_str).collect();
            let reason = format!(
                "{required:.1} GB required; unloading {} frees enough ({available:.1} GB available)",
                names.join(", ")
            );
            return plan(true, unload, reason, available);
        }
    }

    let shortfall = required - available;
    plan(
        false,
        unload,
        format!(
            "Insufficient VRAM for {service}: requires {required:.1} GB but at most \
             {available:.1} GB can be freed (short by {shortfall:.1} GB)"
        ),
        available,
    )
}

// ---------------------------------------------------------------------------
// Switch request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Ask the budget manager to make `service` resident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub service: ServiceId,
    pub model: Option<String>,
    #[serde(default)]
    pub priority: SwitchPriority,
}

impl SwitchRequest {
    pub fn new(service: ServiceId) -> Self {
        Self {
            service,
            model: None,
            priority: SwitchPriority::Normal,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_priority(mut self, priority: SwitchPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchAction {
    AlreadyActive,
    /// Activated without unloading anything.
    Activated,
    /// Activated after unloading other services.
    Switched,
    /// Activation accepted but the model is still loading.
    Queued,
    Failed,
}

/// What a switch did. Returned to the caller, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchResult {
    pub action: SwitchAction,
    pub service: ServiceId,
    pub model: Option<String>,
    pub unloaded: Vec<ServiceId>,
    pub vram_before_gb: f64,
    pub vram_after_gb: f64,
    pub message: String,
    /// Category of the failure when `action` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl SwitchResult {
    /// True for results that leave the target resident.
    pub fn is_success(&self) -> bool {
        matches!(
            self.action,
            SwitchAction::AlreadyActive | SwitchAction::Activated | SwitchAction::Switched
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
