//! Capability requests and the dispatch result wrapper.

use kiln_comfyui::workflow::ConditioningImage;
use kiln_core::media::ChatMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Backend default when absent.
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    pub model: Option<String>,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: 1024,
            height: 1024,
            steps: None,
            seed: None,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Label such as `16:9`.
    pub aspect_ratio: Option<String>,
    pub frames: Option<u32>,
    pub fps: Option<u32>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    /// Image-to-video when present.
    pub image: Option<ConditioningImage>,
    pub model: Option<String>,
}

impl VideoRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            aspect_ratio: None,
            frames: None,
            fps: None,
            steps: None,
            seed: None,
            image: None,
            model: None,
        }
    }

    pub fn with_image(mut self, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.image = Some(ConditioningImage {
            filename: filename.into(),
            bytes,
        });
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Which side served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Cloud,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Cloud => "cloud",
        }
    }
}

/// A dispatched result and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatched<T> {
    pub provider: Provider,
    /// Backend name, e.g. `ollama` or the cloud provider's name.
    pub backend: String,
    /// The cloud served a request that would have gone local.
    pub fell_back: bool,
    pub value: T,
}
