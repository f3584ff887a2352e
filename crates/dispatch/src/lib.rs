//! Provider fallback dispatcher: routes chat, image and video requests to
//! a local backend or a cloud provider under the local-only policy.

pub mod cloud;
pub mod dispatcher;
pub mod error;
pub mod local;
pub mod policy;
pub mod request;
