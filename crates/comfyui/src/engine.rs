//! Workflow job engine.
//!
//! [`JobEngine`] turns [`GenerationParams`] into a ComfyUI graph, submits
//! it, and drives the resulting [`QueuedJob`] through a poll loop until it
//! completes, fails, times out or is cancelled. Each job can be polled on
//! its own task via [`JobEngine::track`].
//!
//! Lifecycle events are broadcast via a [`tokio::sync::broadcast`]
//! channel. Call [`JobEngine::subscribe`] to receive them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_core::error::CoreError;
use kiln_core::failure::{classify_backend_failure, FailureKind};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::api::ComfyUIApiError;
use crate::backend::WorkflowBackend;
use crate::events::JobEvent;
use crate::jobs::{estimate_progress, JobStatus, JobStore, OutputRef, QueuedJob};
use crate::messages::{parse_history, HistoryOutcome, OutputFile, QueuePosition};
use crate::templates::TemplateSet;
use crate::workflow::{build_graph, random_seed, GenerationParams};

/// Broadcast channel capacity for job events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Interval between history polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Wait deadline used when the caller does not supply one.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct JobEngineConfig {
    pub poll_interval: Duration,
    pub default_timeout: Duration,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Owns the job store and is the sole publisher of [`JobEvent`]s.
pub struct JobEngine {
    backend: Arc<dyn WorkflowBackend>,
    store: JobStore,
    templates: TemplateSet,
    config: JobEngineConfig,
    event_tx: broadcast::Sender<JobEvent>,
}

impl JobEngine {
    pub fn new(backend: Arc<dyn WorkflowBackend>, config: JobEngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            store: JobStore::new(),
            templates: TemplateSet::default(),
            config,
            event_tx,
        }
    }

    pub fn with_templates(mut self, templates: TemplateSet) -> Self {
        self.templates = templates;
        self
    }

    pub fn config(&self) -> &JobEngineConfig {
        &self.config
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get(&self, job_id: &str) -> Option<QueuedJob> {
        self.store.get(job_id).await
    }

    pub async fn list(&self) -> Vec<QueuedJob> {
        self.store.list().await
    }

    /// Validate, build and queue a workflow.
    ///
    /// Validation runs before any network call. The conditioning image,
    /// when present, is uploaded first and referenced by name.
    pub async fn submit(&self, mut params: GenerationParams) -> Result<QueuedJob, JobError> {
        let template = self.templates.get(params.category).ok_or_else(|| {
            JobError::Validation(format!(
                "No workflow template for category '{}'",
                params.category
            ))
        })?;
        params.validate(template)?;

        let image_name = match params.image.take() {
            Some(image) => Some(
                self.backend
                    .upload_image(image.bytes, &image.filename)
                    .await
                    .map_err(JobError::Upload)?,
            ),
            None => None,
        };

        let seed = params.seed.unwrap_or_else(random_seed);
        let graph = build_graph(template, &params, image_name.as_deref(), seed)?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let prompt_id = self
            .backend
            .submit(&graph, &client_id)
            .await
            .map_err(JobError::Submit)?;

        let mut job = QueuedJob::new(
            uuid::Uuid::new_v4().to_string(),
            client_id,
            params.category,
            params.model.clone(),
        );
        job.prompt_id = Some(prompt_id.clone());
        self.store.put(job.clone()).await;

        tracing::info!(
            job_id = %job.id,
            prompt_id = %prompt_id,
            category = %params.category,
            seed,
            "Workflow queued",
        );
        self.emit(JobEvent::Queued {
            job_id: job.id.clone(),
            prompt_id,
            category: params.category,
        });

        Ok(job)
    }

    /// Submit and wait for the result on the current task.
    pub async fn run(
        &self,
        params: GenerationParams,
        timeout: Option<Duration>,
    ) -> Result<QueuedJob, JobError> {
        let job = self.submit(params).await?;
        self.poll_until_done(&job.id, timeout.unwrap_or(self.config.default_timeout))
            .await
    }

    /// Poll the engine until the job reaches a terminal state or the
    /// deadline passes. A timed-out job is marked failed.
    pub async fn poll_until_done(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<QueuedJob, JobError> {
        let job = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if job.is_terminal() {
            return Ok(job);
        }
        let Some(prompt_id) = job.prompt_id.clone() else {
            return Ok(self
                .fail_job(job_id, "Job has no engine submission to poll")
                .await
                .unwrap_or(job));
        };

        let deadline = Instant::now() + timeout;

        loop {
            let Some(current) = self.store.get(job_id).await else {
                return Err(JobError::NotFound(job_id.to_string()));
            };
            if current.is_terminal() {
                return Ok(current);
            }

            let now = Instant::now();
            if now >= deadline {
                let message = format!(
                    "Timed out after {} ms waiting for workflow output",
                    timeout.as_millis()
                );
                tracing::error!(job_id, prompt_id = %prompt_id, "Job timed out");
                return self
                    .fail_job(job_id, message)
                    .await
                    .ok_or_else(|| JobError::NotFound(job_id.to_string()));
            }

            if let Err(e) = self.poll_once(job_id, &prompt_id).await {
                tracing::warn!(job_id, prompt_id = %prompt_id, error = %e, "Poll failed, retrying");
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Spawn the poll loop for `job_id` on its own task.
    pub fn track(self: &Arc<Self>, job_id: String, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.poll_until_done(&job_id, timeout).await {
                Ok(job) => tracing::debug!(
                    job_id = %job.id,
                    status = job.status.as_str(),
                    "Job tracking finished",
                ),
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Job tracking aborted"),
            }
        })
    }

    /// Cancel a job.
    ///
    /// A prompt still pending in the engine queue is deleted from it; the
    /// prompt currently executing is interrupted. `/interrupt` is global, so
    /// it is sent only when the queue shows this prompt running. A prompt
    /// absent from the queue has already finished and is left for the poll
    /// loop to settle.
    ///
    /// Returns false for unknown jobs, jobs without a submission, prompts no
    /// longer queued, and failed engine calls. Cancelling a terminal job is a
    /// no-op that returns true only if the job was already cancelled.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let Some(job) = self.store.get(job_id).await else {
            return false;
        };
        let Some(prompt_id) = job.prompt_id.clone() else {
            return false;
        };
        if job.is_terminal() {
            return job.status == JobStatus::Cancelled;
        }

        let position = match self.backend.queue().await {
            Ok(queue) => queue.position_of(&prompt_id),
            Err(e) => {
                tracing::warn!(job_id, prompt_id = %prompt_id, error = %e, "Queue lookup failed, not cancelling");
                return false;
            }
        };
        let result = match position {
            Some(QueuePosition::Pending(_)) => self.backend.delete_queued(&prompt_id).await,
            Some(QueuePosition::Running) => self.backend.interrupt().await,
            None => {
                tracing::info!(job_id, prompt_id = %prompt_id, "Prompt no longer queued, leaving it to finish");
                return false;
            }
        };
        if let Err(e) = result {
            tracing::warn!(job_id, prompt_id = %prompt_id, error = %e, "Cancel call failed");
            return false;
        }

        match self.store.update(job_id, |j| j.cancel()).await {
            Some((true, _)) => {
                tracing::info!(job_id, prompt_id = %prompt_id, "Job cancelled");
                self.emit(JobEvent::Cancelled {
                    job_id: job_id.to_string(),
                    prompt_id: Some(prompt_id),
                });
                true
            }
            Some((false, current)) => current.status == JobStatus::Cancelled,
            None => false,
        }
    }

    /// Drop terminal jobs older than `max_age`. Returns the count removed.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let removed = self.store.sweep(Utc::now(), max_age).await;
        if removed > 0 {
            tracing::debug!(removed, "Swept finished jobs");
        }
        removed
    }

    // ---- private helpers ----

    /// One poll step: history first, then the queue for progress.
    async fn poll_once(&self, job_id: &str, prompt_id: &str) -> Result<(), PollError> {
        let body = self.backend.history(prompt_id).await?;
        match parse_history(prompt_id, &body)? {
            HistoryOutcome::Completed(file) => {
                self.complete_job(job_id, prompt_id, file).await;
                return Ok(());
            }
            HistoryOutcome::Failed(message) => {
                tracing::error!(job_id, prompt_id, error = %message, "Workflow failed on engine");
                self.fail_job(job_id, message).await;
                return Ok(());
            }
            HistoryOutcome::Pending => {}
        }

        let queue = self.backend.queue().await?;
        let progress = estimate_progress(queue.remaining());
        if let Some((true, job)) = self
            .store
            .update(job_id, |j| j.mark_running(progress, None))
            .await
        {
            self.emit(JobEvent::Progress {
                job_id: job.id,
                prompt_id: prompt_id.to_string(),
                percent: job.progress,
                current_node: job.current_node,
            });
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: &str, prompt_id: &str, file: OutputFile) {
        let output = OutputRef {
            url: self.backend.output_url(&file),
            filename: file.filename,
            subfolder: file.subfolder,
            kind: file.kind,
        };
        if let Some((true, job)) = self.store.update(job_id, |j| j.complete(output)).await {
            tracing::info!(job_id, prompt_id, "Job completed");
            if let Some(output) = job.output {
                self.emit(JobEvent::Completed {
                    job_id: job.id,
                    prompt_id: prompt_id.to_string(),
                    output,
                });
            }
        }
    }

    /// Mark failed and emit. Returns the job as stored afterwards.
    async fn fail_job(&self, job_id: &str, message: impl Into<String>) -> Option<QueuedJob> {
        let message = message.into();
        let (applied, job) = self
            .store
            .update(job_id, |j| j.fail(message.clone()))
            .await?;
        if applied {
            self.emit(JobEvent::Failed {
                job_id: job.id.clone(),
                prompt_id: job.prompt_id.clone(),
                error: message,
            });
        }
        Some(job)
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

/// Transient failure of a single poll step.
#[derive(Debug, thiserror::Error)]
enum PollError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error("Malformed history response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors that can occur when submitting or tracking jobs.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The request was rejected before any network call.
    #[error("{0}")]
    Validation(String),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Failed to upload conditioning image: {0}")]
    Upload(ComfyUIApiError),

    #[error("Failed to submit workflow: {0}")]
    Submit(ComfyUIApiError),
}

impl From<CoreError> for JobError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => JobError::Validation(msg),
            other => JobError::Validation(other.to_string()),
        }
    }
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Validation(_) | JobError::NotFound(_) => FailureKind::Validation,
            JobError::Upload(e) | JobError::Submit(e) => api_failure_kind(e),
        }
    }

    /// Operator-facing message, classified when the engine rejected the call.
    pub fn user_message(&self) -> String {
        match self {
            JobError::Upload(ComfyUIApiError::ApiError { status, body })
            | JobError::Submit(ComfyUIApiError::ApiError { status, body }) => {
                classify_backend_failure(*status, body).user_message()
            }
            other => other.to_string(),
        }
    }
}

fn api_failure_kind(err: &ComfyUIApiError) -> FailureKind {
    match err {
        ComfyUIApiError::ApiError { status, body } => classify_backend_failure(*status, body).kind(),
        e if e.is_unreachable() => FailureKind::Unreachable,
        _ => FailureKind::Backend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_rejection_is_classified() {
        let err = JobError::Submit(ComfyUIApiError::ApiError {
            status: 400,
            body: r#"{"error":{"type":"invalid_prompt","message":"Cannot execute because node VHS_VideoCombine does not exist."}}"#.into(),
        });
        assert_eq!(err.kind(), FailureKind::MisconfiguredBackend);
        assert!(err.user_message().contains("VHS_VideoCombine"));
    }

    #[test]
    fn validation_errors_keep_their_message() {
        let err: JobError = CoreError::Validation("Prompt must not be empty".into()).into();
        assert_eq!(err.kind(), FailureKind::Validation);
        assert_eq!(err.to_string(), "Prompt must not be empty");
    }

    #[test]
    fn default_config_polls_every_two_seconds() {
        let config = JobEngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config.default_timeout > config.poll_interval);
    }
}
