//! Backend failure taxonomy and classification.
//!
//! [`classify_backend_failure`] turns a raw `(status, body)` pair from a
//! local generation backend into a [`BackendFailure`] with a message the
//! operator can act on. It runs once, right next to the backend call;
//! everything above that layer only looks at [`FailureKind`].

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Machine-checkable error category carried by every surfaced failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network failure or timeout reaching a backend.
    Unreachable,
    /// GPU memory exhausted.
    ResourceExhausted,
    /// Wrong or missing model, missing workflow nodes.
    MisconfiguredBackend,
    /// No feasible unload set exists for the requested activation.
    BudgetExceeded,
    /// A job exceeded its wait deadline.
    Timeout,
    /// The local-only policy forbids the cloud path.
    PolicyBlocked,
    /// The request itself is invalid.
    Validation,
    /// The target is mid-switch; the same request may succeed shortly.
    Busy,
    /// Any other backend error.
    Backend,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::MisconfiguredBackend => "misconfigured_backend",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::PolicyBlocked => "policy_blocked",
            FailureKind::Validation => "validation",
            FailureKind::Busy => "busy",
            FailureKind::Backend => "backend",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure of a local image/video backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    OutOfMemory,
    ModelNotLoaded { detail: String },
    MissingNodes { nodes: Vec<String> },
    Http { status: u16, body: String },
}

impl BackendFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            BackendFailure::OutOfMemory => FailureKind::ResourceExhausted,
            BackendFailure::ModelNotLoaded { .. } | BackendFailure::MissingNodes { .. } => {
                FailureKind::MisconfiguredBackend
            }
            BackendFailure::Http { .. } => FailureKind::Backend,
        }
    }

    /// Operator-facing message with the remediation step.
    pub fn user_message(&self) -> String {
        match self {
            BackendFailure::OutOfMemory => "GPU ran out of memory. Reduce the resolution, frame \
                 count or batch size, or free VRAM by unloading other models."
                .to_string(),
            BackendFailure::ModelNotLoaded { detail } => format!(
                "No compatible model is loaded on the local backend. Load the right \
                 checkpoint and retry. ({detail})"
            ),
            BackendFailure::MissingNodes { nodes } if nodes.is_empty() => {
                "The workflow uses nodes that are not installed on the engine. Install the \
                 required custom node packs."
                    .to_string()
            }
            BackendFailure::MissingNodes { nodes } => format!(
                "The workflow engine is missing required nodes: {}. Install the custom node \
                 packs that provide them.",
                nodes.join(", ")
            ),
            BackendFailure::Http { status, body } => {
                format!("Local backend returned HTTP {status}: {}", truncate(body, 300))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "outofmemoryerror",
    "cuda error: out of memory",
    "allocation on device",
    "not enough memory",
    "cudnn_status_alloc_failed",
];

const MODEL_MARKERS: &[&str] = &[
    "model not loaded",
    "no model loaded",
    "model is not loaded",
    "not a valid model",
    "checkpoint not found",
    "value not in list: ckpt_name",
    "wrong model type",
    "expected model type",
    "model type mismatch",
];

const MISSING_NODE_MARKERS: &[&str] = &[
    "missing_node_type",
    "does not exist",
    "node type not found",
    "cannot execute because",
];

/// `... node ADE_AnimateDiffLoader does not exist.`
static NODE_DOES_NOT_EXIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"node (?:type )?['`]?([A-Za-z0-9_.\-|]+)['`]? does not exist").expect("valid regex")
});

/// `"class_type": "VHS_VideoCombine"` inside a structured node error.
static CLASS_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""class_type"\s*:\s*"([^"]+)""#).expect("valid regex"));

/// Classify a failed backend response.
///
/// Pure: inspects only the status code and body text. The checks run in
/// order of specificity: memory exhaustion, missing nodes, model problems,
/// then a generic HTTP failure.
pub fn classify_backend_failure(status: u16, body: &str) -> BackendFailure {
    let lower = body.to_lowercase();

    if OOM_MARKERS.iter().any(|m| lower.contains(m)) {
        return BackendFailure::OutOfMemory;
    }

    if MISSING_NODE_MARKERS.iter().any(|m| lower.contains(m)) {
        let mut nodes: Vec<String> = NODE_DOES_NOT_EXIST_RE
            .captures_iter(body)
            .chain(CLASS_TYPE_RE.captures_iter(body))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        nodes.sort();
        nodes.dedup();
        if !nodes.is_empty() || lower.contains("missing_node_type") || lower.contains("node") {
            return BackendFailure::MissingNodes { nodes };
        }
    }

    if MODEL_MARKERS.iter().any(|m| lower.contains(m)) {
        return BackendFailure::ModelNotLoaded {
            detail: truncate(body.trim(), 200).to_string(),
        };
    }

    BackendFailure::Http {
        status,
        body: body.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
