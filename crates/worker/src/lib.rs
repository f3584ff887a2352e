//! Kiln orchestrator process.
//!
//! Environment configuration, the [`Orchestrator`](context::Orchestrator)
//! context that owns every shared component, and the background tasks the
//! binary spawns next to it.

pub mod background;
pub mod config;
pub mod context;
pub mod notifications;
