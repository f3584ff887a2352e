//! Kiln notification sink.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`PlatformEvent`]: the envelope every outward notification travels in.
//! - [`delivery`]: external delivery channels (webhook).

pub mod bus;
pub mod delivery;

pub use bus::{EventBus, PlatformEvent};
pub use delivery::webhook::{WebhookDelivery, WebhookError};
