//! Ollama chat-inference backend.
//!
//! Residency comes from `GET /api/ps`; models are loaded and dropped with
//! `POST /api/generate` and an explicit `keep_alive`. One Ollama server
//! can back two services: chat models and embedding models are tracked
//! (and unloaded) separately.

use std::time::Duration;

use async_trait::async_trait;
use kiln_core::media::{ChatCompletion, ChatMessage};
use kiln_core::types::ServiceId;
use serde::{Deserialize, Serialize};

use crate::backend::{
    ensure_success, parse_json, trim_base_url, BackendError, ProbeReport, ServiceBackend,
    BYTES_PER_GB,
};
use crate::probe::PROBE_TIMEOUT;

/// How long a model activated through the budget manager stays resident.
pub const DEFAULT_KEEP_ALIVE: &str = "10m";

/// Timeout for load/unload calls; a cold load can take a while.
const LOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for a non-streaming chat completion.
const CHAT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
pub struct TagModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

/// A model currently resident in Ollama.
#[derive(Debug, Clone, Deserialize)]
pub struct RunningModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub size_vram: u64,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<RunningModel>,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    message: ChatMessage,
}

/// Embedding models are recognised by name.
pub fn is_embedding_model(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("embed") || lower.starts_with("bge") || lower.starts_with("all-minilm")
}

#[derive(Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    service: ServiceId,
}

impl OllamaBackend {
    /// Chat models on the server at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, ServiceId::InferenceLlm)
    }

    /// Embedding models on the server at `base_url`.
    pub fn embeddings(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, ServiceId::Embeddings)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        service: ServiceId,
    ) -> Self {
        Self {
            client,
            base_url: trim_base_url(base_url),
            service,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn owns(&self, model: &str) -> bool {
        is_embedding_model(model) == (self.service == ServiceId::Embeddings)
    }

    /// Lightweight reachability check (`GET /api/tags`).
    pub async fn ping(&self) -> bool {
        self.list_models().await.is_ok()
    }

    /// Installed models.
    pub async fn list_models(&self) -> Result<Vec<TagModel>, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let tags: TagsResponse = parse_json(response).await?;
        Ok(tags.models)
    }

    /// Resident models belonging to this service, largest first.
    pub async fn running(&self) -> Result<Vec<RunningModel>, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/ps", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let ps: PsResponse = parse_json(response).await?;
        let mut models: Vec<RunningModel> =
            ps.models.into_iter().filter(|m| self.owns(&m.name)).collect();
        models.sort_by(|a, b| b.size_vram.cmp(&a.size_vram));
        Ok(models)
    }

    /// Non-streaming chat completion (`POST /api/chat`).
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
    ) -> Result<ChatCompletion, BackendError> {
        let body = ChatBody {
            model,
            messages,
            stream: false,
            options: temperature.map(|t| serde_json::json!({ "temperature": t })),
        };
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let reply: ChatResponse = parse_json(response).await?;
        Ok(ChatCompletion {
            model: reply.model,
            message: reply.message,
        })
    }

    async fn set_keep_alive(
        &self,
        model: &str,
        keep_alive: serde_json::Value,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "model": model,
            "keep_alive": keep_alive,
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(LOAD_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceBackend for OllamaBackend {
    fn service(&self) -> ServiceId {
        self.service
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let running = self.running().await?;
        let Some(largest) = running.first() else {
            return Ok(ProbeReport::reachable(self.service));
        };

        let vram_bytes: u64 = running.iter().map(|m| m.size_vram).sum();
        let mut report = ProbeReport::reachable(self.service).with_model(largest.name.clone());
        if vram_bytes > 0 {
            report.vram_used_gb = Some(vram_bytes as f64 / BYTES_PER_GB);
        }
        report.detail = Some(format!("{} model(s) resident", running.len()));
        Ok(report)
    }

    async fn unload(&self) -> Result<(), BackendError> {
        let mut last_err = None;
        for model in self.running().await? {
            if let Err(e) = self.set_keep_alive(&model.name, serde_json::json!(0)).await {
                tracing::warn!(model = %model.name, error = %e, "Failed to unload Ollama model");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn activate(&self, model: Option<&str>) -> Result<(), BackendError> {
        match model {
            Some(model) => {
                self.set_keep_alive(model, serde_json::json!(DEFAULT_KEEP_ALIVE))
                    .await
            }
            None => {
                // Nothing named: being reachable is enough.
                self.list_models().await.map(|_| ())
            }
        }
    }
}
