//! GPU-side services: capability probes, the local service backends,
//! the VRAM budget manager and the pipeline manager.

pub mod backend;
pub mod comfyui;
pub mod diffusion;
pub mod manager;
pub mod ollama;
pub mod pipeline;
pub mod probe;
