//! Kiln domain core.
//!
//! Pure logic shared by every other crate: identifiers, the VRAM budget
//! model and unload planner, backend failure classification, the model
//! catalog, pipeline validation and the chat/media value types. Nothing
//! in this crate performs I/O.

pub mod catalog;
pub mod error;
pub mod failure;
pub mod job_events;
pub mod media;
pub mod pipeline;
pub mod types;
pub mod vram;
