//! Pipeline lifecycle manager.
//!
//! Owns every [`PipelineState`] and publishes status changes on a broadcast
//! channel. Definitions are validated against the model catalog and the
//! usable VRAM budget before a pipeline is stored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use kiln_core::catalog::ModelCatalog;
use kiln_core::error::CoreError;
use kiln_core::pipeline::{
    validate_pipeline, GpuSettings, PipelineMetrics, PipelineState, PipelineStatus, PipelineStep,
};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

/// Broadcast channel capacity for pipeline events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Created {
        id: String,
        name: String,
    },
    StatusChanged {
        id: String,
        from: PipelineStatus,
        to: PipelineStatus,
        error: Option<String>,
    },
    Destroyed {
        id: String,
    },
}

pub struct PipelineManager {
    pipelines: RwLock<HashMap<String, PipelineState>>,
    catalog: Arc<ModelCatalog>,
    usable_vram_gb: f64,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl PipelineManager {
    pub fn new(catalog: Arc<ModelCatalog>, usable_vram_gb: f64) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pipelines: RwLock::new(HashMap::new()),
            catalog,
            usable_vram_gb,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Validate and store a new pipeline in `idle`.
    pub async fn create(
        &self,
        name: &str,
        steps: Vec<PipelineStep>,
        gpu: GpuSettings,
    ) -> Result<PipelineState, PipelineError> {
        let total = validate_pipeline(name, &steps, &gpu, &self.catalog, self.usable_vram_gb)?;

        let state = PipelineState {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            status: PipelineStatus::Idle,
            steps,
            metrics: PipelineMetrics {
                vram_total_gb: gpu.vram_ceiling_gb,
                ..PipelineMetrics::default()
            },
            gpu,
            created_at: Utc::now(),
            error: None,
        };

        self.pipelines
            .write()
            .await
            .insert(state.id.clone(), state.clone());

        tracing::info!(pipeline_id = %state.id, name = %state.name, vram_gb = total, "Pipeline created");
        let _ = self.event_tx.send(PipelineEvent::Created {
            id: state.id.clone(),
            name: state.name.clone(),
        });
        Ok(state)
    }

    /// `idle | stopped | error -> starting -> running`.
    pub async fn start(&self, id: &str) -> Result<PipelineState, PipelineError> {
        self.transition(id, PipelineStatus::Starting, None).await?;
        self.transition(id, PipelineStatus::Running, None).await
    }

    /// `starting | running -> stopping -> stopped`.
    pub async fn stop(&self, id: &str) -> Result<PipelineState, PipelineError> {
        self.transition(id, PipelineStatus::Stopping, None).await?;
        self.transition(id, PipelineStatus::Stopped, None).await
    }

    /// Move any pipeline into `error`.
    pub async fn fail(&self, id: &str, reason: &str) -> Result<PipelineState, PipelineError> {
        self.transition(id, PipelineStatus::Error, Some(reason.to_string()))
            .await
    }

    pub async fn update_metrics(
        &self,
        id: &str,
        metrics: PipelineMetrics,
    ) -> Result<PipelineState, PipelineError> {
        let mut pipelines = self.pipelines.write().await;
        let state = pipelines
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        state.metrics = metrics;
        Ok(state.clone())
    }

    pub async fn get(&self, id: &str) -> Option<PipelineState> {
        self.pipelines.read().await.get(id).cloned()
    }

    /// All pipelines, oldest first.
    pub async fn list(&self) -> Vec<PipelineState> {
        let mut all: Vec<PipelineState> = self.pipelines.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Remove a pipeline that is not running.
    pub async fn destroy(&self, id: &str) -> Result<(), PipelineError> {
        let mut pipelines = self.pipelines.write().await;
        let state = pipelines
            .get(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        if !matches!(
            state.status,
            PipelineStatus::Idle | PipelineStatus::Stopped | PipelineStatus::Error
        ) {
            return Err(PipelineError::Busy {
                id: id.to_string(),
                status: state.status,
            });
        }
        pipelines.remove(id);
        drop(pipelines);

        tracing::info!(pipeline_id = %id, "Pipeline destroyed");
        let _ = self.event_tx.send(PipelineEvent::Destroyed { id: id.to_string() });
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        to: PipelineStatus,
        error: Option<String>,
    ) -> Result<PipelineState, PipelineError> {
        let mut pipelines = self.pipelines.write().await;
        let state = pipelines
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        let from = state.status;
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition { from, to });
        }
        state.status = to;
        state.error = error.clone();
        let snapshot = state.clone();
        drop(pipelines);

        tracing::debug!(pipeline_id = %id, from = from.as_str(), to = to.as_str(), "Pipeline status changed");
        let _ = self.event_tx.send(PipelineEvent::StatusChanged {
            id: id.to_string(),
            from,
            to,
            error,
        });
        Ok(snapshot)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error("Cannot move pipeline from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        from: PipelineStatus,
        to: PipelineStatus,
    },

    #[error("Pipeline {id} is {} and cannot be destroyed", .status.as_str())]
    Busy { id: String, status: PipelineStatus },
}
