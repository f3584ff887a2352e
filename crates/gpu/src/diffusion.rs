//! Stable Diffusion WebUI / Forge backend (`/sdapi/v1`).
//!
//! The loaded checkpoint comes from `/options`, load activity from
//! `/progress` and CUDA usage from `/memory`. The memory call is optional:
//! older builds lack it and the probe still succeeds.

use std::time::Duration;

use async_trait::async_trait;
use kiln_core::types::ServiceId;
use serde::{Deserialize, Serialize};

use crate::backend::{
    ensure_success, parse_json, trim_base_url, BackendError, ProbeReport, ServiceBackend,
    BYTES_PER_GB,
};
use crate::probe::PROBE_TIMEOUT;

/// Timeout for checkpoint loads and unloads.
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for a txt2img generation.
const GENERATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct OptionsResponse {
    #[serde(default)]
    sd_model_checkpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressState {
    #[serde(default)]
    job: String,
    #[serde(default)]
    job_count: i64,
}

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    #[serde(default)]
    state: ProgressState,
    #[serde(default)]
    textinfo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CudaSystem {
    #[serde(default)]
    used: u64,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CudaStats {
    #[serde(default)]
    system: CudaSystem,
}

#[derive(Debug, Deserialize)]
struct MemoryResponse {
    #[serde(default)]
    cuda: Option<CudaStats>,
}

/// One installed checkpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SdModel {
    pub title: String,
    pub model_name: String,
    #[serde(default)]
    pub filename: String,
}

/// `POST /sdapi/v1/txt2img` body.
#[derive(Debug, Clone, Serialize)]
pub struct Txt2ImgRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    /// `-1` asks the server for a random seed.
    pub seed: i64,
    pub batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler_name: Option<String>,
}

impl Txt2ImgRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            width: 1024,
            height: 1024,
            steps: 30,
            cfg_scale: 7.0,
            seed: -1,
            batch_size: 1,
            sampler_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Txt2ImgResponse {
    /// Base64-encoded PNGs.
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub info: Option<String>,
}

/// Table name of a checkpoint title:
/// `models/sd_xl_base_1.0.safetensors [31e35c80fc]` -> `sd_xl_base_1.0`.
pub fn normalize_checkpoint(title: &str) -> String {
    let without_hash = title.split(" [").next().unwrap_or(title).trim();
    let file = without_hash
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(without_hash);
    for ext in [".safetensors", ".ckpt", ".pt"] {
        if let Some(stem) = file.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    file.to_string()
}

#[derive(Clone)]
pub struct DiffusionBackend {
    client: reqwest::Client,
    base_url: String,
}

impl DiffusionBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: trim_base_url(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self
            .client
            .get(format!("{}/sdapi/v1/{path}", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        parse_json(response).await
    }

    /// Title of the loaded checkpoint, if any.
    pub async fn current_checkpoint(&self) -> Result<Option<String>, BackendError> {
        let options: OptionsResponse = self.get("options").await?;
        Ok(options.sd_model_checkpoint.filter(|c| !c.trim().is_empty()))
    }

    pub async fn list_models(&self) -> Result<Vec<SdModel>, BackendError> {
        self.get("sd-models").await
    }

    /// Generate images from a prompt.
    pub async fn txt2img(&self, request: &Txt2ImgRequest) -> Result<Txt2ImgResponse, BackendError> {
        let response = self
            .client
            .post(format!("{}/sdapi/v1/txt2img", self.base_url))
            .timeout(GENERATION_TIMEOUT)
            .json(request)
            .send()
            .await?;
        let result: Txt2ImgResponse = parse_json(response).await?;
        if result.images.is_empty() {
            return Err(BackendError::Payload(
                "txt2img returned no images".to_string(),
            ));
        }
        Ok(result)
    }

    async fn post_empty(&self, path: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(format!("{}/sdapi/v1/{path}", self.base_url))
            .timeout(LOAD_TIMEOUT)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceBackend for DiffusionBackend {
    fn service(&self) -> ServiceId {
        ServiceId::ImageDiffusion
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let checkpoint = self.current_checkpoint().await?;
        let mut report = ProbeReport::reachable(ServiceId::ImageDiffusion);
        if let Some(title) = &checkpoint {
            report = report.with_model(normalize_checkpoint(title));
        }

        if let Ok(progress) = self.get::<ProgressResponse>("progress").await {
            let text = progress.textinfo.unwrap_or_default().to_ascii_lowercase();
            let job = progress.state.job.to_ascii_lowercase();
            report.loading = job.contains("load")
                || text.contains("loading")
                || (checkpoint.is_none() && progress.state.job_count > 0);
            if report.loading {
                report.active = true;
            }
        }

        if let Ok(memory) = self.get::<MemoryResponse>("memory").await {
            if let Some(cuda) = memory.cuda {
                if cuda.system.total > 0 {
                    report.vram_used_gb = Some(cuda.system.used as f64 / BYTES_PER_GB);
                    report.vram_total_gb = Some(cuda.system.total as f64 / BYTES_PER_GB);
                }
            }
        }

        Ok(report)
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.post_empty("unload-checkpoint").await
    }

    async fn activate(&self, model: Option<&str>) -> Result<(), BackendError> {
        let Some(model) = model else {
            return self.post_empty("reload-checkpoint").await;
        };

        let wanted = normalize_checkpoint(model);
        let models = self.list_models().await?;
        let entry = models
            .iter()
            .find(|m| {
                normalize_checkpoint(&m.title) == wanted || normalize_checkpoint(&m.model_name) == wanted
            })
            .ok_or_else(|| BackendError::Status {
                status: 404,
                body: format!("checkpoint not found: {model}"),
            })?;

        let body = serde_json::json!({ "sd_model_checkpoint": entry.title });
        let response = self
            .client
            .post(format!("{}/sdapi/v1/options", self.base_url))
            .timeout(LOAD_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
