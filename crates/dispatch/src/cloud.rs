//! Cloud model provider.
//!
//! [`CloudProvider`] is the seam the dispatcher falls back to. The HTTP
//! implementation speaks the common hosted-inference dialect: bearer key,
//! JSON bodies, `data[]` arrays carrying either a URL or base64 payload.

use std::time::Duration;

use async_trait::async_trait;
use kiln_core::failure::FailureKind;
use kiln_core::media::{ChatCompletion, ChatMessage, GeneratedMedia};
use serde::Deserialize;

use crate::request::{ChatRequest, ImageRequest, VideoRequest};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const CHAT_TIMEOUT: Duration = Duration::from_secs(300);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(300);
const VIDEO_TIMEOUT: Duration = Duration::from_secs(900);

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedMedia, CloudError>;

    async fn generate_video(&self, request: &VideoRequest) -> Result<GeneratedMedia, CloudError>;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, CloudError>;

    async fn list_models(&self) -> Result<Vec<String>, CloudError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider returned a non-2xx status code.
    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The provider answered with something we could not use.
    #[error("Unexpected response: {0}")]
    Payload(String),
}

impl CloudError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CloudError::Request(e) if e.is_connect() || e.is_timeout() => FailureKind::Unreachable,
            CloudError::Status { status: 401 | 403, .. } => FailureKind::MisconfiguredBackend,
            CloudError::Status { status: 400 | 422, .. } => FailureKind::Validation,
            _ => FailureKind::Backend,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            CloudError::Status {
                status: 401 | 403, ..
            } => "the API key was rejected; check CLOUD_API_KEY".to_string(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MediaItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    #[serde(default)]
    data: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

fn first_media(response: MediaResponse, mime: &str) -> Result<GeneratedMedia, CloudError> {
    let item = response
        .data
        .into_iter()
        .next()
        .ok_or_else(|| CloudError::Payload("response contained no media".to_string()))?;
    match (item.url, item.b64_json) {
        (Some(url), _) if !url.is_empty() => Ok(GeneratedMedia::Url { url }),
        (_, Some(base64)) if !base64.is_empty() => Ok(GeneratedMedia::Inline {
            mime: mime.to_string(),
            base64,
        }),
        _ => Err(CloudError::Payload(
            "media item has neither url nor b64_json".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpCloudProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    image_model: String,
    video_model: String,
}

impl HttpCloudProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            chat_model: "default".to_string(),
            image_model: "default".to_string(),
            video_model: "default".to_string(),
        }
    }

    /// Default models used when a request names none.
    pub fn with_models(
        mut self,
        chat: impl Into<String>,
        image: impl Into<String>,
        video: impl Into<String>,
    ) -> Self {
        self.chat_model = chat.into();
        self.image_model = image.into();
        self.video_model = video.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .timeout(timeout);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(CloudError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedMedia, CloudError> {
        let body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.image_model),
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt,
            "size": format!("{}x{}", request.width, request.height),
            "seed": request.seed,
            "n": 1,
        });
        let response = self
            .request(reqwest::Method::POST, "/images/generations", IMAGE_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        first_media(Self::parse(response).await?, "image/png")
    }

    async fn generate_video(&self, request: &VideoRequest) -> Result<GeneratedMedia, CloudError> {
        let model = request.model.as_deref().unwrap_or(&self.video_model);
        let builder = self.request(reqwest::Method::POST, "/videos/generations", VIDEO_TIMEOUT);

        // Conditioning images go as multipart; plain prompts as JSON.
        let builder = match &request.image {
            Some(image) => {
                let mut form = reqwest::multipart::Form::new()
                    .text("model", model.to_string())
                    .text("prompt", request.prompt.clone())
                    .part(
                        "image",
                        reqwest::multipart::Part::bytes(image.bytes.clone())
                            .file_name(image.filename.clone()),
                    );
                if let Some(ratio) = &request.aspect_ratio {
                    form = form.text("aspect_ratio", ratio.clone());
                }
                builder.multipart(form)
            }
            None => builder.json(&serde_json::json!({
                "model": model,
                "prompt": request.prompt,
                "negative_prompt": request.negative_prompt,
                "aspect_ratio": request.aspect_ratio,
                "frames": request.frames,
                "fps": request.fps,
                "seed": request.seed,
            })),
        };

        let response = builder.send().await?;
        first_media(Self::parse(response).await?, "video/mp4")
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, CloudError> {
        let body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.chat_model),
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": false,
        });
        let response = self
            .request(reqwest::Method::POST, "/chat/completions", CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let reply: ChatResponse = Self::parse(response).await?;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::Payload("response contained no choices".to_string()))?;
        Ok(ChatCompletion {
            model: reply.model,
            message: choice.message,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, CloudError> {
        let response = self
            .request(reqwest::Method::GET, "/models", LIST_TIMEOUT)
            .send()
            .await?;
        let list: ModelList = Self::parse(response).await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn media_prefers_url_then_inline() {
        let hosted: MediaResponse = serde_json::from_value(serde_json::json!({
            "data": [{"url": "https://cdn.example/v.mp4"}]
        }))
        .unwrap();
        assert_eq!(
            first_media(hosted, "video/mp4").unwrap().url(),
            Some("https://cdn.example/v.mp4")
        );

        let inline: MediaResponse = serde_json::from_value(serde_json::json!({
            "data": [{"b64_json": "iVBORw0KGgo="}]
        }))
        .unwrap();
        assert_matches!(
            first_media(inline, "image/png"),
            Ok(GeneratedMedia::Inline { mime, .. }) if mime == "image/png"
        );
    }

    #[test]
    fn empty_media_is_a_payload_error() {
        let empty: MediaResponse = serde_json::from_value(serde_json::json!({"data": []})).unwrap();
        assert_matches!(first_media(empty, "image/png"), Err(CloudError::Payload(_)));
    }

    #[test]
    fn auth_failures_are_misconfiguration() {
        let err = CloudError::Status {
            status: 401,
            body: "invalid key".into(),
        };
        assert_eq!(err.kind(), FailureKind::MisconfiguredBackend);
        assert!(err.user_message().contains("CLOUD_API_KEY"));
    }

    #[test]
    fn provider_trims_base_url_and_empty_key() {
        let provider = HttpCloudProvider::new("hosted", "https://api.example/v1/", Some(String::new()));
        assert_eq!(provider.base_url(), "https://api.example/v1");
        assert!(provider.api_key.is_none());
        assert_eq!(provider.name(), "hosted");
    }
}
