//! Local backends the dispatcher prefers.
//!
//! One small trait per capability. Each reports whether it can serve
//! right now and performs the call, turning backend failures into
//! classified [`DispatchError`]s at the call site.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_comfyui::engine::JobEngine;
use kiln_comfyui::jobs::{JobStatus, QueuedJob};
use kiln_comfyui::templates::WorkflowCategory;
use kiln_comfyui::workflow::GenerationParams;
use kiln_core::failure::{classify_backend_failure, BackendFailure, FailureKind};
use kiln_core::media::{ChatCompletion, GeneratedMedia};
use kiln_gpu::comfyui::ComfyUIBackend;
use kiln_gpu::diffusion::{DiffusionBackend, Txt2ImgRequest};
use kiln_gpu::ollama::OllamaBackend;
use kiln_gpu::probe::{probe_with_timeout, PROBE_TIMEOUT};

use crate::error::DispatchError;
use crate::request::{ChatRequest, ImageRequest, VideoRequest};

#[async_trait]
pub trait LocalChatBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap reachability check.
    async fn is_reachable(&self) -> bool;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, DispatchError>;
}

#[async_trait]
pub trait LocalImageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Reachable with a model loaded and not loading.
    async fn is_ready(&self) -> bool;

    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedMedia, DispatchError>;
}

#[async_trait]
pub trait LocalVideoBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Reachable and not loading.
    async fn is_ready(&self) -> bool;

    async fn generate_video(&self, request: &VideoRequest) -> Result<GeneratedMedia, DispatchError>;
}

// ---------------------------------------------------------------------------
// Ollama chat
// ---------------------------------------------------------------------------

pub struct OllamaChat {
    backend: OllamaBackend,
    default_model: String,
}

impl OllamaChat {
    pub fn new(backend: OllamaBackend, default_model: impl Into<String>) -> Self {
        Self {
            backend,
            default_model: default_model.into(),
        }
    }
}

#[async_trait]
impl LocalChatBackend for OllamaChat {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn is_reachable(&self) -> bool {
        self.backend.ping().await
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, DispatchError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        Ok(self
            .backend
            .chat(model, &request.messages, request.temperature)
            .await?)
    }
}

// ---------------------------------------------------------------------------
// SD-WebUI image
// ---------------------------------------------------------------------------

pub struct DiffusionImage {
    backend: DiffusionBackend,
}

impl DiffusionImage {
    pub fn new(backend: DiffusionBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LocalImageBackend for DiffusionImage {
    fn name(&self) -> &str {
        "sd-webui"
    }

    async fn is_ready(&self) -> bool {
        probe_with_timeout(&self.backend, PROBE_TIMEOUT)
            .await
            .is_ready()
    }

    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedMedia, DispatchError> {
        let mut body = Txt2ImgRequest::new(request.prompt.clone());
        body.negative_prompt = request.negative_prompt.clone().unwrap_or_default();
        body.width = request.width;
        body.height = request.height;
        if let Some(steps) = request.steps {
            body.steps = steps;
        }
        if let Some(seed) = request.seed {
            body.seed = i64::try_from(seed).unwrap_or(-1);
        }

        let result = self.backend.txt2img(&body).await?;
        let base64 = result.images.into_iter().next().ok_or_else(|| {
            DispatchError::new(FailureKind::Backend, "txt2img returned no images")
        })?;
        Ok(GeneratedMedia::Inline {
            mime: "image/png".to_string(),
            base64,
        })
    }
}

// ---------------------------------------------------------------------------
// ComfyUI video
// ---------------------------------------------------------------------------

pub struct ComfyVideo {
    probe: ComfyUIBackend,
    engine: Arc<JobEngine>,
    timeout: Option<Duration>,
}

impl ComfyVideo {
    pub fn new(probe: ComfyUIBackend, engine: Arc<JobEngine>) -> Self {
        Self {
            probe,
            engine,
            timeout: None,
        }
    }

    /// Wait deadline per job; the engine default otherwise.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Map a finished job to media or a classified error.
pub fn job_outcome(job: QueuedJob) -> Result<GeneratedMedia, DispatchError> {
    match job.status {
        JobStatus::Completed => job
            .output
            .map(|o| GeneratedMedia::Url { url: o.url })
            .ok_or_else(|| {
                DispatchError::new(FailureKind::Backend, "Workflow completed without output")
            }),
        JobStatus::Cancelled => Err(DispatchError::new(
            FailureKind::Backend,
            format!("Job {} was cancelled", job.id),
        )),
        _ => {
            let message = job.error.unwrap_or_else(|| "Workflow failed".to_string());
            if message.starts_with("Timed out") {
                return Err(DispatchError::new(FailureKind::Timeout, message));
            }
            match classify_backend_failure(500, &message) {
                BackendFailure::Http { .. } => {
                    Err(DispatchError::new(FailureKind::Backend, message))
                }
                classified => Err(DispatchError::new(classified.kind(), classified.user_message())),
            }
        }
    }
}

#[async_trait]
impl LocalVideoBackend for ComfyVideo {
    fn name(&self) -> &str {
        "comfyui"
    }

    async fn is_ready(&self) -> bool {
        let report = probe_with_timeout(&self.probe, PROBE_TIMEOUT).await;
        report.available && !report.loading
    }

    async fn generate_video(&self, request: &VideoRequest) -> Result<GeneratedMedia, DispatchError> {
        let category = if request.image.is_some() {
            WorkflowCategory::ImageToVideo
        } else {
            WorkflowCategory::TextToVideo
        };
        let params = GenerationParams {
            category,
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            seed: request.seed,
            aspect_ratio: request.aspect_ratio.clone(),
            steps: request.steps,
            frames: request.frames,
            fps: request.fps,
            image: request.image.clone(),
            model: request.model.clone(),
        };
        let job = self.engine.run(params, self.timeout).await?;
        job_outcome(job)
    }
}
