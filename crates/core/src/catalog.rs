//! Static model catalog.
//!
//! Read-only reference data loaded once at startup. Pipelines validate
//! their steps against it; the dispatcher uses it to pick default
//! generation parameters.

use serde::{Deserialize, Serialize};

use crate::types::ServiceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    Chat,
    Image,
    Video,
    Embedding,
    Upscale,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
    Int8,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Bf16 => "bf16",
            Precision::Int8 => "int8",
        }
    }
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub category: ModelCategory,
    pub vram_gb: f64,
    pub precisions: Vec<Precision>,
    pub default_params: serde_json::Value,
    /// Backend node class or checkpoint name the model is driven through.
    pub node_id: String,
    pub service: ServiceId,
}

impl ModelDescriptor {
    pub fn supports(&self, precision: Precision) -> bool {
        self.precisions.contains(&precision)
    }
}

/// Catalog of known models, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self { models }
    }

    /// The stock catalog shipped with the orchestrator.
    pub fn builtin() -> Self {
        use serde_json::json;
        use ModelCategory::*;
        use Precision::*;

        Self::new(vec![
            entry(
                "llama3.1:8b",
                Chat,
                6.5,
                &[Fp16, Int8],
                json!({"temperature": 0.7, "num_ctx": 8192}),
                "ollama",
                ServiceId::InferenceLlm,
            ),
            entry(
                "qwen2.5:7b",
                Chat,
                6.0,
                &[Fp16, Int8],
                json!({"temperature": 0.7, "num_ctx": 8192}),
                "ollama",
                ServiceId::InferenceLlm,
            ),
            entry(
                "sd_xl_base_1.0",
                Image,
                8.0,
                &[Fp16, Fp32],
                json!({"steps": 30, "cfg_scale": 7.0, "width": 1024, "height": 1024}),
                "CheckpointLoaderSimple",
                ServiceId::ImageDiffusion,
            ),
            entry(
                "v1-5-pruned-emaonly",
                Image,
                4.5,
                &[Fp16, Fp32],
                json!({"steps": 25, "cfg_scale": 7.0, "width": 512, "height": 512}),
                "CheckpointLoaderSimple",
                ServiceId::ImageDiffusion,
            ),
            entry(
                "animatediff",
                Video,
                10.0,
                &[Fp16],
                json!({"steps": 20, "frames": 16, "fps": 8}),
                "ADE_AnimateDiffLoaderWithContext",
                ServiceId::WorkflowEngine,
            ),
            entry(
                "svd_xt",
                Video,
                12.0,
                &[Fp16],
                json!({"steps": 20, "frames": 25, "fps": 6}),
                "ImageOnlyCheckpointLoader",
                ServiceId::WorkflowEngine,
            ),
            entry(
                "realesrgan_x4",
                Upscale,
                1.5,
                &[Fp16, Fp32],
                json!({"scale": 4}),
                "UpscaleModelLoader",
                ServiceId::WorkflowEngine,
            ),
            entry(
                "depth_anything_v2_small",
                Depth,
                1.0,
                &[Fp16, Fp32],
                json!({"resolution": 518}),
                "DepthAnythingV2Preprocessor",
                ServiceId::WorkflowEngine,
            ),
            entry(
                "nomic-embed-text",
                Embedding,
                0.7,
                &[Fp16, Fp32],
                json!({}),
                "ollama",
                ServiceId::Embeddings,
            ),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn by_category(&self, category: ModelCategory) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(move |m| m.category == category)
    }

    pub fn all(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn entry(
    id: &str,
    category: ModelCategory,
    vram_gb: f64,
    precisions: &[Precision],
    default_params: serde_json::Value,
    node_id: &str,
    service: ServiceId,
) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        category,
        vram_gb,
        precisions: precisions.to_vec(),
        default_params,
        node_id: node_id.to_string(),
        service,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_ids_are_unique() {
        let catalog = ModelCatalog::builtin();
        let mut ids: Vec<&str> = catalog.all().iter().map(|m| m.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), catalog.len());
    }

    #[test]
    fn lookup_by_id_and_category() {
        let catalog = ModelCatalog::builtin();
        let svd = catalog.get("svd_xt").expect("svd_xt is in the builtin catalog");
        assert_eq!(svd.category, ModelCategory::Video);
        assert_eq!(svd.service, ServiceId::WorkflowEngine);
        assert!(svd.supports(Precision::Fp16));
        assert!(!svd.supports(Precision::Int8));

        assert!(catalog.by_category(ModelCategory::Chat).count() >= 2);
        assert!(catalog.get("unknown-model").is_none());
    }
}
