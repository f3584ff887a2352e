//! Workflow graph templates.
//!
//! A template is a fixed ComfyUI node graph (API format) plus a table of
//! named injection points mapping a request parameter to a node input.
//! Supporting a new generation category means adding a template here; the
//! job engine never changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Generation category a template serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCategory {
    /// Motion-module text-to-video (AnimateDiff).
    TextToVideo,
    /// Image-conditioned video (Stable Video Diffusion).
    ImageToVideo,
    /// Plain text-to-image.
    TextToImage,
}

impl WorkflowCategory {
    pub const ALL: [WorkflowCategory; 3] = [
        WorkflowCategory::TextToVideo,
        WorkflowCategory::ImageToVideo,
        WorkflowCategory::TextToImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowCategory::TextToVideo => "text_to_video",
            WorkflowCategory::ImageToVideo => "image_to_video",
            WorkflowCategory::TextToImage => "text_to_image",
        }
    }

    pub fn is_video(&self) -> bool {
        !matches!(self, WorkflowCategory::TextToImage)
    }
}

impl std::fmt::Display for WorkflowCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named parameter slot in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionPoint {
    Prompt,
    NegativePrompt,
    Seed,
    Width,
    Height,
    Steps,
    Frames,
    Fps,
    Image,
    Checkpoint,
}

/// Where an injection point lands: `graph[node].inputs[input]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injection {
    pub point: InjectionPoint,
    pub node: &'static str,
    pub input: &'static str,
}

const fn at(point: InjectionPoint, node: &'static str, input: &'static str) -> Injection {
    Injection { point, node, input }
}

/// Output dimensions for one aspect ratio label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
}

const fn ratio(label: &'static str, width: u32, height: u32) -> AspectRatio {
    AspectRatio {
        label,
        width,
        height,
    }
}

/// SD 1.5 family (AnimateDiff) native sizes.
pub const SD15_ASPECT_RATIOS: &[AspectRatio] = &[
    ratio("1:1", 512, 512),
    ratio("16:9", 768, 432),
    ratio("9:16", 432, 768),
    ratio("4:3", 640, 480),
    ratio("3:4", 480, 640),
];

/// Stable Video Diffusion native sizes.
pub const SVD_ASPECT_RATIOS: &[AspectRatio] = &[
    ratio("16:9", 1024, 576),
    ratio("9:16", 576, 1024),
    ratio("1:1", 768, 768),
];

/// SDXL native sizes.
pub const SDXL_ASPECT_RATIOS: &[AspectRatio] = &[
    ratio("1:1", 1024, 1024),
    ratio("16:9", 1344, 768),
    ratio("9:16", 768, 1344),
    ratio("4:3", 1152, 896),
    ratio("3:4", 896, 1152),
];

/// Per-template parameter defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateDefaults {
    pub steps: u32,
    pub frames: u32,
    pub fps: u32,
}

/// A fixed node graph with named injection points.
#[derive(Debug, Clone)]
pub struct GraphTemplate {
    pub name: &'static str,
    pub category: WorkflowCategory,
    pub graph: Value,
    pub injections: Vec<Injection>,
    pub aspect_ratios: &'static [AspectRatio],
    pub defaults: TemplateDefaults,
}

impl GraphTemplate {
    pub fn accepts(&self, point: InjectionPoint) -> bool {
        self.injections.iter().any(|i| i.point == point)
    }

    /// Dimensions for `label`, falling back to the first table entry.
    /// Returns `None` only for an unknown label.
    pub fn dimensions(&self, label: Option<&str>) -> Option<(u32, u32)> {
        let entry = match label {
            Some(label) => self.aspect_ratios.iter().find(|r| r.label == label)?,
            None => self.aspect_ratios.first()?,
        };
        Some((entry.width, entry.height))
    }

    pub fn aspect_labels(&self) -> Vec<&'static str> {
        self.aspect_ratios.iter().map(|r| r.label).collect()
    }

    /// Copy of the graph with every supplied value written into its
    /// injection points. Points the template does not declare are ignored.
    pub fn inject(&self, values: &[(InjectionPoint, Value)]) -> Value {
        let mut graph = self.graph.clone();
        for (point, value) in values {
            for injection in self.injections.iter().filter(|i| i.point == *point) {
                if let Some(inputs) = graph
                    .get_mut(injection.node)
                    .and_then(|node| node.get_mut("inputs"))
                    .and_then(|inputs| inputs.as_object_mut())
                {
                    inputs.insert(injection.input.to_string(), value.clone());
                }
            }
        }
        graph
    }
}

/// The set of templates known to a job engine, keyed by category.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<WorkflowCategory, GraphTemplate>,
}

impl TemplateSet {
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn with(mut self, template: GraphTemplate) -> Self {
        self.templates.insert(template.category, template);
        self
    }

    pub fn get(&self, category: WorkflowCategory) -> Option<&GraphTemplate> {
        self.templates.get(&category)
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::empty()
            .with(animatediff_text_to_video())
            .with(svd_image_to_video())
            .with(sd_text_to_image())
    }
}

// ---------------------------------------------------------------------------
// Stock templates
// ---------------------------------------------------------------------------

/// AnimateDiff-Evolved text-to-video, combined to mp4 by VideoHelperSuite.
pub fn animatediff_text_to_video() -> GraphTemplate {
    use InjectionPoint::*;

    let graph = json!({
        "1": {"class_type": "CheckpointLoaderSimple", "inputs": {
            "ckpt_name": "v1-5-pruned-emaonly.safetensors"
        }},
        "2": {"class_type": "ADE_AnimateDiffLoaderWithContext", "inputs": {
            "model": ["1", 0],
            "model_name": "mm_sd_v15_v2.ckpt",
            "beta_schedule": "sqrt_linear (AnimateDiff)"
        }},
        "3": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["1", 1]}},
        "4": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["1", 1]}},
        "5": {"class_type": "EmptyLatentImage", "inputs": {
            "width": 512, "height": 512, "batch_size": 16
        }},
        "6": {"class_type": "KSampler", "inputs": {
            "seed": 0,
            "steps": 20,
            "cfg": 7.5,
            "sampler_name": "euler_ancestral",
            "scheduler": "normal",
            "denoise": 1.0,
            "model": ["2", 0],
            "positive": ["3", 0],
            "negative": ["4", 0],
            "latent_image": ["5", 0]
        }},
        "7": {"class_type": "VAEDecode", "inputs": {"samples": ["6", 0], "vae": ["1", 2]}},
        "8": {"class_type": "VHS_VideoCombine", "inputs": {
            "images": ["7", 0],
            "frame_rate": 8,
            "loop_count": 0,
            "filename_prefix": "kiln/t2v",
            "format": "video/h264-mp4",
            "pingpong": false,
            "save_output": true
        }}
    });

    GraphTemplate {
        name: "animatediff_t2v",
        category: WorkflowCategory::TextToVideo,
        graph,
        injections: vec![
            at(Checkpoint, "1", "ckpt_name"),
            at(Prompt, "3", "text"),
            at(NegativePrompt, "4", "text"),
            at(Width, "5", "width"),
            at(Height, "5", "height"),
            at(Frames, "5", "batch_size"),
            at(Seed, "6", "seed"),
            at(Steps, "6", "steps"),
            at(Fps, "8", "frame_rate"),
        ],
        aspect_ratios: SD15_ASPECT_RATIOS,
        defaults: TemplateDefaults {
            steps: 20,
            frames: 16,
            fps: 8,
        },
    }
}

/// Stable Video Diffusion image-to-video. Needs an uploaded image.
pub fn svd_image_to_video() -> GraphTemplate {
    use InjectionPoint::*;

    let graph = json!({
        "1": {"class_type": "ImageOnlyCheckpointLoader", "inputs": {
            "ckpt_name": "svd_xt.safetensors"
        }},
        "2": {"class_type": "LoadImage", "inputs": {"image": ""}},
        "3": {"class_type": "SVD_img2vid_Conditioning", "inputs": {
            "clip_vision": ["1", 1],
            "init_image": ["2", 0],
            "vae": ["1", 2],
            "width": 1024,
            "height": 576,
            "video_frames": 25,
            "motion_bucket_id": 127,
            "fps": 6,
            "augmentation_level": 0.0
        }},
        "4": {"class_type": "VideoLinearCFGGuidance", "inputs": {"model": ["1", 0], "min_cfg": 1.0}},
        "5": {"class_type": "KSampler", "inputs": {
            "seed": 0,
            "steps": 20,
            "cfg": 2.5,
            "sampler_name": "euler",
            "scheduler": "karras",
            "denoise": 1.0,
            "model": ["4", 0],
            "positive": ["3", 0],
            "negative": ["3", 1],
            "latent_image": ["3", 2]
        }},
        "6": {"class_type": "VAEDecode", "inputs": {"samples": ["5", 0], "vae": ["1", 2]}},
        "7": {"class_type": "VHS_VideoCombine", "inputs": {
            "images": ["6", 0],
            "frame_rate": 6,
            "loop_count": 0,
            "filename_prefix": "kiln/i2v",
            "format": "video/h264-mp4",
            "pingpong": false,
            "save_output": true
        }}
    });

    GraphTemplate {
        name: "svd_i2v",
        category: WorkflowCategory::ImageToVideo,
        graph,
        injections: vec![
            at(Checkpoint, "1", "ckpt_name"),
            at(Image, "2", "image"),
            at(Width, "3", "width"),
            at(Height, "3", "height"),
            at(Frames, "3", "video_frames"),
            at(Fps, "3", "fps"),
            at(Seed, "5", "seed"),
            at(Steps, "5", "steps"),
            at(Fps, "7", "frame_rate"),
        ],
        aspect_ratios: SVD_ASPECT_RATIOS,
        defaults: TemplateDefaults {
            steps: 20,
            frames: 25,
            fps: 6,
        },
    }
}

/// SDXL text-to-image.
pub fn sd_text_to_image() -> GraphTemplate {
    use InjectionPoint::*;

    let graph = json!({
        "1": {"class_type": "CheckpointLoaderSimple", "inputs": {
            "ckpt_name": "sd_xl_base_1.0.safetensors"
        }},
        "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["1", 1]}},
        "3": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["1", 1]}},
        "4": {"class_type": "EmptyLatentImage", "inputs": {
            "width": 1024, "height": 1024, "batch_size": 1
        }},
        "5": {"class_type": "KSampler", "inputs": {
            "seed": 0,
            "steps": 30,
            "cfg": 7.0,
            "sampler_name": "dpmpp_2m",
            "scheduler": "karras",
            "denoise": 1.0,
            "model": ["1", 0],
            "positive": ["2", 0],
            "negative": ["3", 0],
            "latent_image": ["4", 0]
        }},
        "6": {"class_type": "VAEDecode", "inputs": {"samples": ["5", 0], "vae": ["1", 2]}},
        "7": {"class_type": "SaveImage", "inputs": {"images": ["6", 0], "filename_prefix": "kiln/t2i"}}
    });

    GraphTemplate {
        name: "sdxl_t2i",
        category: WorkflowCategory::TextToImage,
        graph,
        injections: vec![
            at(Checkpoint, "1", "ckpt_name"),
            at(Prompt, "2", "text"),
            at(NegativePrompt, "3", "text"),
            at(Width, "4", "width"),
            at(Height, "4", "height"),
            at(Seed, "5", "seed"),
            at(Steps, "5", "steps"),
        ],
        aspect_ratios: SDXL_ASPECT_RATIOS,
        defaults: TemplateDefaults {
            steps: 30,
            frames: 1,
            fps: 1,
        },
    }
}
