//! The budget manager's view of one exclusive GPU service.
//!
//! Each local service (Ollama, SD-WebUI/Forge, ComfyUI) implements
//! [`ServiceBackend`]: a probe that reports whether it is up and what it
//! holds, plus the side-effecting unload and activate calls.

use async_trait::async_trait;
use kiln_comfyui::api::ComfyUIApiError;
use kiln_core::failure::{classify_backend_failure, FailureKind};
use kiln_core::types::ServiceId;
use serde::Serialize;

pub(crate) const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// What a probe observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub service: ServiceId,
    /// The service answered.
    pub available: bool,
    /// The service holds GPU memory (a model is resident or work is queued).
    pub active: bool,
    pub model: Option<String>,
    /// A model load is in progress.
    pub loading: bool,
    pub vram_used_gb: Option<f64>,
    pub vram_total_gb: Option<f64>,
    pub detail: Option<String>,
}

impl ProbeReport {
    /// Reachable, nothing resident yet.
    pub fn reachable(service: ServiceId) -> Self {
        Self {
            service,
            available: true,
            active: false,
            model: None,
            loading: false,
            vram_used_gb: None,
            vram_total_gb: None,
            detail: None,
        }
    }

    pub fn unavailable(service: ServiceId, detail: impl Into<String>) -> Self {
        Self {
            available: false,
            detail: Some(detail.into()),
            ..Self::reachable(service)
        }
    }

    /// Mark a model resident.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self.active = true;
        self
    }

    /// Reachable with a model loaded and no load in progress.
    pub fn is_ready(&self) -> bool {
        self.available && self.model.is_some() && !self.loading
    }
}

#[async_trait]
pub trait ServiceBackend: Send + Sync {
    fn service(&self) -> ServiceId;

    async fn probe(&self) -> Result<ProbeReport, BackendError>;

    /// Release every model the service holds.
    async fn unload(&self) -> Result<(), BackendError>;

    /// Make the service resident, loading `model` when given.
    async fn activate(&self, model: Option<&str>) -> Result<(), BackendError>;
}

/// Errors from a local service call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered with something we could not use.
    #[error("Unexpected response: {0}")]
    Payload(String),
}

impl BackendError {
    pub fn is_unreachable(&self) -> bool {
        match self {
            BackendError::Request(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            BackendError::Status { status, body } => classify_backend_failure(*status, body).kind(),
            e if e.is_unreachable() => FailureKind::Unreachable,
            _ => FailureKind::Backend,
        }
    }

    /// Operator-facing message, with remediation for classified failures.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Status { status, body } => {
                classify_backend_failure(*status, body).user_message()
            }
            e if e.is_unreachable() => format!("Local backend is unreachable: {e}"),
            e => e.to_string(),
        }
    }
}

impl From<ComfyUIApiError> for BackendError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Request(e) => BackendError::Request(e),
            ComfyUIApiError::ApiError { status, body } => BackendError::Status { status, body },
        }
    }
}

// ---- shared HTTP helpers ----

/// Return the response unchanged on 2xx, otherwise a [`BackendError::Status`]
/// carrying the body for classification.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

pub(crate) async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    let response = ensure_success(response).await?;
    Ok(response.json::<T>().await?)
}

pub(crate) fn trim_base_url(url: impl Into<String>) -> String {
    url.into().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_needs_model_and_no_load() {
        let report = ProbeReport::reachable(ServiceId::ImageDiffusion);
        assert!(!report.is_ready());

        let loaded = report.clone().with_model("sd_xl_base_1.0");
        assert!(loaded.is_ready());
        assert!(loaded.active);

        let loading = ProbeReport {
            loading: true,
            ..loaded
        };
        assert!(!loading.is_ready());

        assert!(!ProbeReport::unavailable(ServiceId::ImageDiffusion, "down").is_ready());
    }

    #[test]
    fn status_errors_are_classified() {
        let oom = BackendError::Status {
            status: 500,
            body: "RuntimeError: CUDA out of memory".into(),
        };
        assert_eq!(oom.kind(), FailureKind::ResourceExhausted);
        assert!(oom.user_message().contains("GPU ran out of memory"));

        let payload = BackendError::Payload("no images".into());
        assert_eq!(payload.kind(), FailureKind::Backend);
    }

    #[test]
    fn comfy_errors_convert() {
        let err: BackendError = ComfyUIApiError::ApiError {
            status: 400,
            body: "bad".into(),
        }
        .into();
        assert!(matches!(err, BackendError::Status { status: 400, .. }));
    }
}
