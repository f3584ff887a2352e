//! ComfyUI REST client and workflow job engine.
//!
//! Provides the HTTP API wrapper, typed response parsing, workflow graph
//! templates with parameter injection, the job store, and the
//! [`engine::JobEngine`] that submits graphs and polls them to completion.

pub mod api;
pub mod backend;
pub mod engine;
pub mod events;
pub mod jobs;
pub mod messages;
pub mod templates;
pub mod workflow;
