//! Dispatch errors.
//!
//! Every failure the dispatcher surfaces carries a [`FailureKind`] and a
//! message the operator can act on. Classification happens where the
//! backend error is first seen; this type only transports the result.

use kiln_comfyui::engine::JobError;
use kiln_core::failure::FailureKind;
use kiln_core::types::Capability;
use kiln_gpu::backend::BackendError;
use kiln_gpu::manager::BudgetError;

use crate::cloud::CloudError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    pub kind: FailureKind,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn policy_blocked(capability: Capability) -> Self {
        Self::new(
            FailureKind::PolicyBlocked,
            format!(
                "Local-only mode is enabled: {capability} requests cannot use a cloud provider"
            ),
        )
    }

    /// Neither a usable local backend nor a cloud provider exists.
    pub fn nothing_available(capability: Capability) -> Self {
        Self::new(
            FailureKind::Unreachable,
            format!(
                "No {capability} backend available: the local {} service is unreachable or \
                 has no model loaded, and no cloud provider is configured",
                capability.local_service()
            ),
        )
    }

    pub fn no_cloud_provider() -> Self {
        Self::new(
            FailureKind::MisconfiguredBackend,
            "No cloud provider is configured",
        )
    }

    pub fn no_local_backend(capability: Capability) -> Self {
        Self::new(
            FailureKind::MisconfiguredBackend,
            format!("No local {capability} backend is configured"),
        )
    }

    pub fn cloud(provider: &str, err: CloudError) -> Self {
        Self::new(
            err.kind(),
            format!("Cloud provider {provider} failed: {}", err.user_message()),
        )
    }
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        Self::new(err.kind(), err.user_message())
    }
}

impl From<JobError> for DispatchError {
    fn from(err: JobError) -> Self {
        Self::new(err.kind(), err.user_message())
    }
}

impl From<BudgetError> for DispatchError {
    fn from(err: BudgetError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_error_names_both_options() {
        let err = DispatchError::nothing_available(Capability::Video);
        assert_eq!(err.kind, FailureKind::Unreachable);
        assert!(err.message.contains("workflow-engine"));
        assert!(err.message.contains("no cloud provider"));
    }

    #[test]
    fn backend_errors_keep_their_classification() {
        let err: DispatchError = BackendError::Status {
            status: 500,
            body: "CUDA out of memory".into(),
        }
        .into();
        assert_eq!(err.kind, FailureKind::ResourceExhausted);
        assert!(err.to_string().contains("GPU ran out of memory"));
    }
}
