//! Event type names for workflow job lifecycle notifications.
//!
//! Published by the job engine and forwarded to the notification sink.

/// A workflow was accepted by the engine and is waiting to run.
pub const JOB_QUEUED: &str = "job_queued";

/// Progress update during job execution (percentage + current node).
pub const JOB_PROGRESS: &str = "job_progress";

/// Job completed successfully.
pub const JOB_COMPLETED: &str = "job_completed";

/// Job failed with an error (including poll timeouts).
pub const JOB_FAILED: &str = "job_failed";

/// Job was cancelled by a caller.
pub const JOB_CANCELLED: &str = "job_cancelled";
