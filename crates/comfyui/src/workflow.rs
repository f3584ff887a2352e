//! Generation request parameters and graph construction.
//!
//! [`GenerationParams::validate`] runs before any network call; a failure
//! there means nothing was uploaded or queued. [`build_graph`] is pure and
//! turns validated parameters into the API-format graph for a template.

use kiln_core::error::CoreError;
use rand::Rng;
use serde_json::{json, Value};

use crate::templates::{GraphTemplate, InjectionPoint, WorkflowCategory};

/// Step count accepted by the samplers.
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 150;

/// Frame count for video categories.
pub const MIN_FRAMES: u32 = 1;
pub const MAX_FRAMES: u32 = 128;

/// Output frame rate for video categories.
pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 60;

/// Maximum prompt length in characters.
pub const MAX_PROMPT_LEN: usize = 4000;

/// Upper bound of generated seeds (kept within the JSON-safe integer range).
pub const MAX_SEED: u64 = (1 << 53) - 1;

pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted, watermark, text, deformed";

/// Conditioning image supplied with an image-to-video request.
#[derive(Debug, Clone)]
pub struct ConditioningImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One generation request for the job engine.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub category: WorkflowCategory,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Random when absent.
    pub seed: Option<u64>,
    /// Label from the template's aspect-ratio table, e.g. `16:9`.
    pub aspect_ratio: Option<String>,
    pub steps: Option<u32>,
    pub frames: Option<u32>,
    pub fps: Option<u32>,
    pub image: Option<ConditioningImage>,
    /// Checkpoint override; the template's checkpoint is used otherwise.
    pub model: Option<String>,
}

impl GenerationParams {
    pub fn new(category: WorkflowCategory, prompt: impl Into<String>) -> Self {
        Self {
            category,
            prompt: prompt.into(),
            negative_prompt: None,
            seed: None,
            aspect_ratio: None,
            steps: None,
            frames: None,
            fps: None,
            image: None,
            model: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_aspect_ratio(mut self, label: impl Into<String>) -> Self {
        self.aspect_ratio = Some(label.into());
        self
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

    /// Check the request against its template. Pure.
    pub fn validate(&self, template: &GraphTemplate) -> Result<(), CoreError> {
        if template.accepts(InjectionPoint::Prompt) {
            let prompt = self.prompt.trim();
            if prompt.is_empty() {
                return Err(CoreError::Validation("Prompt must not be empty".to_string()));
            }
        }
        if self.prompt.chars().count() > MAX_PROMPT_LEN {
            return Err(CoreError::Validation(format!(
                "Prompt exceeds {MAX_PROMPT_LEN} characters"
            )));
        }

        if template.accepts(InjectionPoint::Image) {
            match &self.image {
                None => {
                    return Err(CoreError::Validation(format!(
                        "Category '{}' requires a conditioning image",
                        self.category
                    )))
                }
                Some(image) if image.bytes.is_empty() => {
                    return Err(CoreError::Validation(
                        "Conditioning image is empty".to_string(),
                    ))
                }
                Some(image) if image.filename.trim().is_empty() => {
                    return Err(CoreError::Validation(
                        "Conditioning image needs a filename".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        check_range("steps", self.steps, MIN_STEPS, MAX_STEPS)?;
        if template.accepts(InjectionPoint::Frames) {
            check_range("frames", self.frames, MIN_FRAMES, MAX_FRAMES)?;
        }
        if template.accepts(InjectionPoint::Fps) {
            check_range("fps", self.fps, MIN_FPS, MAX_FPS)?;
        }

        if let Some(seed) = self.seed {
            if seed > MAX_SEED {
                return Err(CoreError::Validation(format!(
                    "Seed must be at most {MAX_SEED}"
                )));
            }
        }

        if let Some(label) = &self.aspect_ratio {
            if template.dimensions(Some(label)).is_none() {
                return Err(CoreError::Validation(format!(
                    "Unknown aspect ratio '{label}'. Valid ratios: {}",
                    template.aspect_labels().join(", ")
                )));
            }
        }

        Ok(())
    }
}

fn check_range(field: &str, value: Option<u32>, min: u32, max: u32) -> Result<(), CoreError> {
    match value {
        Some(v) if v < min || v > max => Err(CoreError::Validation(format!(
            "{field} must be between {min} and {max} (got {v})"
        ))),
        _ => Ok(()),
    }
}

/// A fresh random seed.
pub fn random_seed() -> u64 {
    rand::rng().random_range(0..=MAX_SEED)
}

/// Checkpoint filename for a model id; bare ids get `.safetensors`.
pub fn checkpoint_filename(model: &str) -> String {
    const EXTENSIONS: &[&str] = &[".safetensors", ".ckpt", ".pt", ".pth", ".bin"];
    if EXTENSIONS.iter().any(|ext| model.ends_with(ext)) {
        model.to_string()
    } else {
        format!("{model}.safetensors")
    }
}

/// Build the API-format graph for validated parameters.
///
/// `image_name` is the engine-side filename returned by the upload call.
pub fn build_graph(
    template: &GraphTemplate,
    params: &GenerationParams,
    image_name: Option<&str>,
    seed: u64,
) -> Result<Value, CoreError> {
    let (width, height) = template
        .dimensions(params.aspect_ratio.as_deref())
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "Template '{}' has no size for the requested aspect ratio",
                template.name
            ))
        })?;

    let negative = params
        .negative_prompt
        .as_deref()
        .unwrap_or(DEFAULT_NEGATIVE_PROMPT);

    let mut values = vec![
        (InjectionPoint::Prompt, json!(params.prompt.trim())),
        (InjectionPoint::NegativePrompt, json!(negative)),
        (InjectionPoint::Seed, json!(seed)),
        (InjectionPoint::Width, json!(width)),
        (InjectionPoint::Height, json!(height)),
        (
            InjectionPoint::Steps,
            json!(params.steps.unwrap_or(template.defaults.steps)),
        ),
        (
            InjectionPoint::Frames,
            json!(params.frames.unwrap_or(template.defaults.frames)),
        ),
        (
            InjectionPoint::Fps,
            json!(params.fps.unwrap_or(template.defaults.fps)),
        ),
    ];

    if let Some(name) = image_name {
        values.push((InjectionPoint::Image, json!(name)));
    } else if template.accepts(InjectionPoint::Image) {
        return Err(CoreError::Validation(format!(
            "Template '{}' requires an uploaded image",
            template.name
        )));
    }

    if let Some(model) = &params.model {
        values.push((InjectionPoint::Checkpoint, json!(checkpoint_filename(model))));
    }

    Ok(template.inject(&values))
}
