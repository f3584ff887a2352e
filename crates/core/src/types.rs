use std::fmt;

use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// One exclusive, GPU-resident capability.
///
/// Only one process owns each service; the budget manager decides which
/// of them may be resident at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceId {
    /// Chat inference server (Ollama).
    InferenceLlm,
    /// Stable Diffusion WebUI / Forge.
    ImageDiffusion,
    /// ComfyUI workflow execution engine.
    WorkflowEngine,
    /// Embedding model server.
    Embeddings,
}

impl ServiceId {
    pub const ALL: [ServiceId; 4] = [
        ServiceId::InferenceLlm,
        ServiceId::ImageDiffusion,
        ServiceId::WorkflowEngine,
        ServiceId::Embeddings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::InferenceLlm => "inference-llm",
            ServiceId::ImageDiffusion => "image-diffusion",
            ServiceId::WorkflowEngine => "workflow-engine",
            ServiceId::Embeddings => "embeddings",
        }
    }

    /// Parse the kebab-case identifier used in config and logs.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A class of request routed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Image,
    Video,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Image => "image",
            Capability::Video => "video",
        }
    }

    /// The local GPU service that fulfils this capability.
    pub fn local_service(&self) -> ServiceId {
        match self {
            Capability::Chat => ServiceId::InferenceLlm,
            Capability::Image => ServiceId::ImageDiffusion,
            Capability::Video => ServiceId::WorkflowEngine,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
