//! Lifecycle events published by the job engine.
//!
//! The engine is the only publisher; subscribers get them through
//! [`JobEngine::subscribe`](crate::engine::JobEngine::subscribe).

use kiln_core::job_events;
use serde::Serialize;

use crate::jobs::OutputRef;
use crate::templates::WorkflowCategory;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The workflow was accepted by the engine.
    Queued {
        job_id: String,
        prompt_id: String,
        category: WorkflowCategory,
    },

    /// The job is running (or waiting in the engine queue).
    Progress {
        job_id: String,
        prompt_id: String,
        /// Completion percentage (0-100).
        percent: u8,
        current_node: Option<String>,
    },

    Completed {
        job_id: String,
        prompt_id: String,
        output: OutputRef,
    },

    Failed {
        job_id: String,
        prompt_id: Option<String>,
        error: String,
    },

    Cancelled {
        job_id: String,
        prompt_id: Option<String>,
    },
}

impl JobEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => job_events::JOB_QUEUED,
            JobEvent::Progress { .. } => job_events::JOB_PROGRESS,
            JobEvent::Completed { .. } => job_events::JOB_COMPLETED,
            JobEvent::Failed { .. } => job_events::JOB_FAILED,
            JobEvent::Cancelled { .. } => job_events::JOB_CANCELLED,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }
}
