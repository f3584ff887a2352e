//! Typed ComfyUI REST payloads and their interpretation.
//!
//! `GET /history/{id}` answers with an object keyed by prompt id that stays
//! empty until the prompt finishes. [`parse_history`] reduces it to a
//! [`HistoryOutcome`]; [`QueueSnapshot`] and [`SystemStats`] mirror the
//! `/queue` and `/system_stats` bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One file produced by an output node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default = "default_output_type", rename = "type")]
    pub kind: String,
}

fn default_output_type() -> String {
    "output".to_string()
}

/// Files emitted by a single node. Video combiners report under `gifs`
/// even for mp4/webm.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub videos: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
    #[serde(default)]
    pub images: Vec<OutputFile>,
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, payload]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// History record for one prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Keyed by node id; ordered so the first artifact is deterministic.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

impl HistoryEntry {
    /// First produced artifact, preferring videos over animations over
    /// still images.
    pub fn first_output(&self) -> Option<&OutputFile> {
        let outputs = || self.outputs.values();
        outputs()
            .find_map(|o| o.videos.first())
            .or_else(|| outputs().find_map(|o| o.gifs.first()))
            .or_else(|| outputs().find_map(|o| o.images.first()))
    }

    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.status_str == "error")
    }

    /// Engine-reported error text, taken from the `execution_error` message.
    pub fn error_message(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        status.messages.iter().find_map(|m| {
            let pair = m.as_array()?;
            if pair.first()?.as_str()? != "execution_error" {
                return None;
            }
            let data = pair.get(1)?;
            let message = data.get("exception_message")?.as_str()?.trim();
            Some(match data.get("node_type").and_then(|t| t.as_str()) {
                Some(node_type) => format!("{node_type}: {message}"),
                None => message.to_string(),
            })
        })
    }
}

/// What the history endpoint says about a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// Not finished yet (no entry, or an entry without outputs).
    Pending,
    Completed(OutputFile),
    Failed(String),
}

/// Interpret a `/history/{prompt_id}` body.
pub fn parse_history(
    prompt_id: &str,
    body: &serde_json::Value,
) -> Result<HistoryOutcome, serde_json::Error> {
    let Some(raw) = body.get(prompt_id) else {
        return Ok(HistoryOutcome::Pending);
    };
    let entry: HistoryEntry = serde_json::from_value(raw.clone())?;

    if entry.is_error() {
        let message = entry
            .error_message()
            .unwrap_or_else(|| "Workflow execution failed".to_string());
        return Ok(HistoryOutcome::Failed(message));
    }

    if let Some(file) = entry.first_output() {
        return Ok(HistoryOutcome::Completed(file.clone()));
    }

    if entry.status.as_ref().is_some_and(|s| s.completed) {
        return Ok(HistoryOutcome::Failed(
            "Workflow finished without producing an output file".to_string(),
        ));
    }

    Ok(HistoryOutcome::Pending)
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// `GET /queue` body. Items are `[number, prompt_id, prompt, extra, outputs]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Running,
    /// Zero-based index among pending prompts.
    Pending(usize),
}

impl QueueSnapshot {
    /// Items still to execute, running included.
    pub fn remaining(&self) -> usize {
        self.queue_running.len() + self.queue_pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position_of(&self, prompt_id: &str) -> Option<QueuePosition> {
        if self.queue_running.iter().any(|i| item_prompt_id(i) == Some(prompt_id)) {
            return Some(QueuePosition::Running);
        }
        self.queue_pending
            .iter()
            .position(|i| item_prompt_id(i) == Some(prompt_id))
            .map(QueuePosition::Pending)
    }
}

fn item_prompt_id(item: &serde_json::Value) -> Option<&str> {
    item.get(1).and_then(|v| v.as_str())
}

// ---------------------------------------------------------------------------
// System stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub comfyui_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceStats {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub vram_total: u64,
    #[serde(default)]
    pub vram_free: u64,
    #[serde(default)]
    pub torch_vram_total: u64,
    #[serde(default)]
    pub torch_vram_free: u64,
}

/// `GET /system_stats` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub devices: Vec<DeviceStats>,
}

impl SystemStats {
    fn primary(&self) -> Option<&DeviceStats> {
        self.devices.first()
    }

    pub fn vram_total_gb(&self) -> Option<f64> {
        self.primary().map(|d| d.vram_total as f64 / BYTES_PER_GB)
    }

    /// Device-wide VRAM in use, by every process.
    pub fn vram_used_gb(&self) -> Option<f64> {
        self.primary()
            .map(|d| d.vram_total.saturating_sub(d.vram_free) as f64 / BYTES_PER_GB)
    }

    /// VRAM reserved by ComfyUI's own torch allocator.
    pub fn torch_vram_gb(&self) -> f64 {
        self.primary()
            .map(|d| d.torch_vram_total as f64 / BYTES_PER_GB)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_entry_is_pending() {
        let outcome = parse_history("abc", &json!({})).unwrap();
        assert_eq!(outcome, HistoryOutcome::Pending);
    }

    #[test]
    fn video_output_completes() {
        let body = json!({
            "abc": {
                "outputs": {
                    "9": {"gifs": [{"filename": "kiln_00001.mp4", "subfolder": "", "type": "output", "format": "video/h264-mp4"}]}
                },
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        });
        let outcome = parse_history("abc", &body).unwrap();
        assert_eq!(
            outcome,
            HistoryOutcome::Completed(OutputFile {
                filename: "kiln_00001.mp4".into(),
                subfolder: String::new(),
                kind: "output".into(),
            })
        );
    }

    #[test]
    fn videos_preferred_over_images() {
        let body = json!({
            "p": {"outputs": {
                "1": {"images": [{"filename": "preview.png"}]},
                "2": {"videos": [{"filename": "clip.webm", "subfolder": "v"}]}
            }}
        });
        match parse_history("p", &body).unwrap() {
            HistoryOutcome::Completed(file) => {
                assert_eq!(file.filename, "clip.webm");
                assert_eq!(file.kind, "output");
            }
            other => panic!("Expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn error_status_carries_engine_message() {
        let body = json!({
            "abc": {
                "outputs": {},
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_start", {"prompt_id": "abc"}],
                        ["execution_error", {"prompt_id": "abc", "node_type": "KSampler", "exception_message": "CUDA out of memory ", "exception_type": "RuntimeError"}]
                    ]
                }
            }
        });
        let outcome = parse_history("abc", &body).unwrap();
        assert_eq!(
            outcome,
            HistoryOutcome::Failed("KSampler: CUDA out of memory".into())
        );
    }

    #[test]
    fn completed_without_outputs_is_failure() {
        let body = json!({"abc": {"outputs": {}, "status": {"status_str": "success", "completed": true}}});
        assert!(matches!(
            parse_history("abc", &body).unwrap(),
            HistoryOutcome::Failed(_)
        ));
    }

    #[test]
    fn entry_without_status_or_outputs_is_pending() {
        let body = json!({"abc": {"outputs": {}}});
        assert_eq!(parse_history("abc", &body).unwrap(), HistoryOutcome::Pending);
    }

    #[test]
    fn malformed_entry_is_an_error() {
        let body = json!({"abc": {"outputs": "not-a-map"}});
        assert!(parse_history("abc", &body).is_err());
    }

    #[test]
    fn queue_position_lookup() {
        let queue: QueueSnapshot = serde_json::from_value(json!({
            "queue_running": [[0, "run-1", {}, {}, []]],
            "queue_pending": [[1, "pend-1", {}, {}, []], [2, "pend-2", {}, {}, []]]
        }))
        .unwrap();
        assert_eq!(queue.remaining(), 3);
        assert_eq!(queue.position_of("run-1"), Some(QueuePosition::Running));
        assert_eq!(queue.position_of("pend-2"), Some(QueuePosition::Pending(1)));
        assert_eq!(queue.position_of("gone"), None);
    }

    #[test]
    fn system_stats_vram_figures() {
        let gb = 1024u64 * 1024 * 1024;
        let stats: SystemStats = serde_json::from_value(json!({
            "system": {"os": "posix"},
            "devices": [{
                "name": "cuda:0 NVIDIA GeForce RTX 4090",
                "type": "cuda",
                "vram_total": 24 * gb,
                "vram_free": 20 * gb,
                "torch_vram_total": 3 * gb,
                "torch_vram_free": gb
            }]
        }))
        .unwrap();
        assert_eq!(stats.vram_total_gb(), Some(24.0));
        assert_eq!(stats.vram_used_gb(), Some(4.0));
        assert_eq!(stats.torch_vram_gb(), 3.0);
    }

    #[test]
    fn empty_system_stats_have_no_device() {
        let stats: SystemStats = serde_json::from_value(json!({})).unwrap();
        assert_eq!(stats.vram_total_gb(), None);
        assert_eq!(stats.torch_vram_gb(), 0.0);
    }
}
