//! Multi-step processing pipeline types and validation.
//!
//! A pipeline is an ordered list of model steps sharing one GPU settings
//! block. Creation is refused unless every enabled step fits the VRAM
//! ceiling; status changes follow [`PipelineStatus::can_transition_to`].

use serde::{Deserialize, Serialize};

use crate::catalog::{ModelCatalog, Precision};
use crate::error::CoreError;
use crate::types::Timestamp;

/// Maximum batch size accepted for a pipeline.
pub const MAX_BATCH_SIZE: u32 = 64;

/// Maximum number of steps in a single pipeline.
pub const MAX_STEPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Starting => "starting",
            PipelineStatus::Running => "running",
            PipelineStatus::Stopping => "stopping",
            PipelineStatus::Stopped => "stopped",
            PipelineStatus::Error => "error",
        }
    }

    /// Legal status changes. Any state may fall into `Error`.
    pub fn can_transition_to(&self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (self, next),
            (Idle | Stopped | Error, Starting)
                | (Starting, Running)
                | (Starting | Running, Stopping)
                | (Stopping, Stopped)
                | (_, Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub model_id: String,
    pub enabled: bool,
}

impl PipelineStep {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSettings {
    pub vram_ceiling_gb: f64,
    pub batch_size: u32,
    pub precision: Precision,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub fps: f64,
    pub latency_ms: f64,
    pub vram_used_gb: f64,
    pub vram_total_gb: f64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: String,
    pub name: String,
    pub status: PipelineStatus,
    pub steps: Vec<PipelineStep>,
    pub gpu: GpuSettings,
    pub metrics: PipelineMetrics,
    pub created_at: Timestamp,
    pub error: Option<String>,
}

/// Validate a pipeline definition against the catalog and the usable
/// VRAM budget. Returns the total VRAM of the enabled steps.
pub fn validate_pipeline(
    name: &str,
    steps: &[PipelineStep],
    gpu: &GpuSettings,
    catalog: &ModelCatalog,
    usable_vram_gb: f64,
) -> Result<f64, CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::Validation(
            "Pipeline name must not be empty".to_string(),
        ));
    }
    if steps.is_empty() || steps.len() > MAX_STEPS {
        return Err(CoreError::Validation(format!(
            "A pipeline needs between 1 and {MAX_STEPS} steps (got {})",
            steps.len()
        )));
    }
    if gpu.batch_size == 0 || gpu.batch_size > MAX_BATCH_SIZE {
        return Err(CoreError::Validation(format!(
            "Batch size must be between 1 and {MAX_BATCH_SIZE} (got {})",
            gpu.batch_size
        )));
    }
    if gpu.vram_ceiling_gb <= 0.0 || gpu.vram_ceiling_gb > usable_vram_gb {
        return Err(CoreError::Validation(format!(
            "VRAM ceiling must be in (0, {usable_vram_gb:.1}] GB (got {:.1})",
            gpu.vram_ceiling_gb
        )));
    }

    let mut total = 0.0;
    let mut enabled = 0;
    for (i, step) in steps.iter().enumerate() {
        let model = catalog.get(&step.model_id).ok_or_else(|| {
            CoreError::Validation(format!(
                "Step {i}: unknown model '{}'",
                step.model_id
            ))
        })?;
        if !step.enabled {
            continue;
        }
        enabled += 1;
        if !model.supports(gpu.precision) {
            return Err(CoreError::Validation(format!(
                "Step {i}: model '{}' does not support {} precision",
                model.id,
                gpu.precision.as_str()
            )));
        }
        if model.vram_gb > gpu.vram_ceiling_gb {
            return Err(CoreError::Validation(format!(
                "Step {i}: model '{}' needs {:.1} GB, above the {:.1} GB ceiling",
                model.id, model.vram_gb, gpu.vram_ceiling_gb
            )));
        }
        total += model.vram_gb;
    }

    if enabled == 0 {
        return Err(CoreError::Validation(
            "At least one pipeline step must be enabled".to_string(),
        ));
    }
    if total > gpu.vram_ceiling_gb {
        return Err(CoreError::Validation(format!(
            "Enabled steps need {total:.1} GB together, above the {:.1} GB ceiling",
            gpu.vram_ceiling_gb
        )));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn settings(ceiling: f64) -> GpuSettings {
        GpuSettings {
            vram_ceiling_gb: ceiling,
            batch_size: 1,
            precision: Precision::Fp16,
        }
    }

    #[test]
    fn valid_pipeline_returns_total_vram() {
        let catalog = ModelCatalog::builtin();
        let steps = vec![
            PipelineStep::new("depth_anything_v2_small"),
            PipelineStep::new("realesrgan_x4"),
        ];
        let total = validate_pipeline("depth", &steps, &settings(8.0), &catalog, 22.0).unwrap();
        assert!((total - 2.5).abs() < 1e-9);
    }

    #[test]
    fn step_above_ceiling_is_rejected() {
        let catalog = ModelCatalog::builtin();
        let steps = vec![PipelineStep::new("svd_xt")];
        assert_matches!(
            validate_pipeline("video", &steps, &settings(8.0), &catalog, 22.0),
            Err(CoreError::Validation(msg)) if msg.contains("svd_xt")
        );
    }

    #[test]
    fn disabled_steps_do_not_count() {
        let catalog = ModelCatalog::builtin();
        let steps = vec![
            PipelineStep {
                model_id: "svd_xt".into(),
                enabled: false,
            },
            PipelineStep::new("realesrgan_x4"),
        ];
        assert!(validate_pipeline("p", &steps, &settings(4.0), &catalog, 22.0).is_ok());
    }

    #[test]
    fn unknown_model_and_precision_are_rejected() {
        let catalog = ModelCatalog::builtin();
        assert!(validate_pipeline(
            "p",
            &[PipelineStep::new("nope")],
            &settings(8.0),
            &catalog,
            22.0
        )
        .is_err());

        let int8 = GpuSettings {
            precision: Precision::Int8,
            ..settings(8.0)
        };
        assert!(validate_pipeline(
            "p",
            &[PipelineStep::new("realesrgan_x4")],
            &int8,
            &catalog,
            22.0
        )
        .is_err());
    }

    #[test]
    fn ceiling_above_usable_budget_is_rejected() {
        let catalog = ModelCatalog::builtin();
        let steps = vec![PipelineStep::new("realesrgan_x4")];
        assert!(validate_pipeline("p", &steps, &settings(30.0), &catalog, 22.0).is_err());
    }

    #[test]
    fn status_transitions() {
        use PipelineStatus::*;
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Running.can_transition_to(Error));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
    }
}
