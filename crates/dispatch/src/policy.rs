//! Provider preference and the local-only policy.

use serde::{Deserialize, Serialize};

/// How the caller wants a request routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreference {
    /// Local first, cloud fallback when allowed.
    #[default]
    Auto,
    /// Local only; never falls back.
    Local,
    /// Cloud only.
    Cloud,
}

impl ProviderPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "local" => Some(Self::Local),
            "cloud" => Some(Self::Cloud),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchPolicy {
    /// Never send work to a cloud provider.
    pub local_only: bool,
}

impl DispatchPolicy {
    pub fn new(local_only: bool) -> Self {
        Self { local_only }
    }

    /// A per-request override wins over the configured default.
    pub fn local_only(&self, request_override: Option<bool>) -> bool {
        request_override.unwrap_or(self.local_only)
    }
}
