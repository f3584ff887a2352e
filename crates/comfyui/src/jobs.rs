//! Job records and the in-memory job store.
//!
//! Lifecycle: `queued -> running -> {completed | failed}`, with `cancelled`
//! reachable from either non-terminal state. Every mutator on
//! [`QueuedJob`] is a no-op once the job is terminal, so a cancel racing a
//! poll can never be overwritten.

use std::collections::HashMap;

use chrono::Utc;
use kiln_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::templates::WorkflowCategory;

/// Progress reported while a job waits or runs, before completion.
pub const MIN_RUNNING_PROGRESS: u8 = 10;
pub const MAX_RUNNING_PROGRESS: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Running)
                | (Queued | Running, Completed | Failed | Cancelled)
        )
    }
}

/// Where a finished job's artifact can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
    pub url: String,
}

/// One workflow submission tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    /// Engine-assigned submission id.
    pub prompt_id: Option<String>,
    pub client_id: String,
    pub status: JobStatus,
    /// 0-100, never decreases.
    pub progress: u8,
    pub current_node: Option<String>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    pub output: Option<OutputRef>,
    pub model: Option<String>,
    pub category: WorkflowCategory,
}

impl QueuedJob {
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        category: WorkflowCategory,
        model: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            prompt_id: None,
            client_id: client_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            current_node: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            output: None,
            model,
            category,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reference point for retention: completion time, else start time.
    pub fn age_reference(&self) -> Timestamp {
        self.completed_at.unwrap_or(self.started_at)
    }

    /// Move to `running` with at least `progress`. Returns true when
    /// anything observable changed.
    pub fn mark_running(&mut self, progress: u8, current_node: Option<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Running) {
            return false;
        }
        let progress = progress.min(MAX_RUNNING_PROGRESS).max(self.progress);
        let changed = self.status != JobStatus::Running
            || progress != self.progress
            || (current_node.is_some() && current_node != self.current_node);
        self.status = JobStatus::Running;
        self.progress = progress;
        if current_node.is_some() {
            self.current_node = current_node;
        }
        changed
    }

    pub fn complete(&mut self, output: OutputRef) -> bool {
        if !self.status.can_transition_to(JobStatus::Completed) {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Failed) {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn cancel(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Cancelled) {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Progress estimate from the number of items still in the engine queue.
pub fn estimate_progress(remaining: usize) -> u8 {
    let raw = 100i64.saturating_sub(10i64.saturating_mul(remaining as i64));
    raw.clamp(MIN_RUNNING_PROGRESS as i64, MAX_RUNNING_PROGRESS as i64) as u8
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owner of every job record. Callers get clones, never the map.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, QueuedJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<QueuedJob> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn put(&self, job: QueuedJob) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    pub async fn delete(&self, id: &str) -> Option<QueuedJob> {
        self.jobs.write().await.remove(id)
    }

    /// Apply `f` to the job under the write lock. Returns `None` for an
    /// unknown id, otherwise `f`'s result and a copy of the updated job.
    pub async fn update<F, R>(&self, id: &str, f: F) -> Option<(R, QueuedJob)>
    where
        F: FnOnce(&mut QueuedJob) -> R,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id)?;
        let result = f(job);
        Some((result, job.clone()))
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<QueuedJob> {
        let mut jobs: Vec<QueuedJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Remove terminal jobs whose age at `now` exceeds `max_age`.
    /// Returns the number removed.
    pub async fn sweep(&self, now: Timestamp, max_age: chrono::Duration) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.is_terminal() && now - job.age_reference() > max_age));
        before - jobs.len()
    }
}
