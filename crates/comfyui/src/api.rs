//! Thin `reqwest` client over the ComfyUI endpoints the orchestrator uses:
//! `/prompt`, `/history`, `/queue`, `/interrupt`, `/upload/image`,
//! `/system_stats` and `/free`. Each call has its own timeout.

use std::time::Duration;

use serde::Deserialize;

use crate::messages::{OutputFile, QueueSnapshot, SystemStats};

/// Timeout for health and stats calls.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for control calls (history, queue, interrupt, free).
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for workflow submission and image upload.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body of an accepted `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: i32,
    /// Per-node validation errors reported alongside an accepted prompt.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Response from `/upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Stored filename, to be referenced by a `LoadImage` node.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("ComfyUI request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx answer; the body usually carries the engine's reason.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },
}

impl ComfyUIApiError {
    /// True when the engine could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            ComfyUIApiError::Request(e) => e.is_connect() || e.is_timeout(),
            ComfyUIApiError::ApiError { .. } => false,
        }
    }
}

impl ComfyUIApi {
    /// `api_url` is the engine root, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue a graph (`POST /prompt`).
    pub async fn submit_workflow(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        parse_response(response).await
    }

    /// Drop a prompt that is still pending (`POST /queue`). The running
    /// prompt is unaffected.
    pub async fn delete_queued(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .timeout(CONTROL_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        check_status(response).await
    }

    /// Stop whatever is executing (`POST /interrupt`); not prompt-specific.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;

        check_status(response).await
    }

    /// `GET /history/{prompt_id}`: an object keyed by prompt id, empty
    /// until the prompt has finished.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{prompt_id}", self.api_url))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;

        parse_response(response).await
    }

    /// Snapshot of the running and pending queues (`GET /queue`).
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;

        parse_response(response).await
    }

    /// Device and VRAM statistics (`GET /system_stats`).
    pub async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        parse_response(response).await
    }

    /// Upload a conditioning image (`POST /upload/image`, multipart).
    ///
    /// Existing files with the same name are overwritten.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        parse_response(response).await
    }

    /// Ask ComfyUI to drop cached models and release VRAM (`POST /free`).
    pub async fn free_memory(&self) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "unload_models": true,
            "free_memory": true,
        });

        let response = self
            .client
            .post(format!("{}/free", self.api_url))
            .timeout(CONTROL_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        check_status(response).await
    }

    /// Absolute URL from which an output file can be downloaded.
    pub fn view_url(&self, file: &OutputFile) -> String {
        let base = format!("{}/view", self.api_url);
        let params = [
            ("filename", file.filename.as_str()),
            ("subfolder", file.subfolder.as_str()),
            ("type", file.kind.as_str()),
        ];
        match reqwest::Url::parse_with_params(&base, &params) {
            Ok(url) => url.to_string(),
            Err(_) => format!(
                "{base}?filename={}&subfolder={}&type={}",
                file.filename, file.subfolder, file.kind
            ),
        }
    }

}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ComfyUIApiError::ApiError {
        status: status.as_u16(),
        body,
    })
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ComfyUIApiError> {
    Ok(ensure_success(response).await?.json::<T>().await?)
}

async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
    ensure_success(response).await.map(|_| ())
}

fn mime_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::new("http://localhost:8188/");
        assert_eq!(api.api_url(), "http://localhost:8188");
    }

    #[test]
    fn view_url_joins_base_and_query() {
        let api = ComfyUIApi::new("http://gpu-box:8188");
        let file = OutputFile {
            filename: "clip_00001.mp4".into(),
            subfolder: "kiln".into(),
            kind: "output".into(),
        };
        assert_eq!(
            api.view_url(&file),
            "http://gpu-box:8188/view?filename=clip_00001.mp4&subfolder=kiln&type=output"
        );
    }

    #[test]
    fn view_url_encodes_spaces() {
        let api = ComfyUIApi::new("http://gpu-box:8188");
        let file = OutputFile {
            filename: "my clip.mp4".into(),
            subfolder: String::new(),
            kind: "output".into(),
        };
        assert_eq!(
            api.view_url(&file),
            "http://gpu-box:8188/view?filename=my+clip.mp4&subfolder=&type=output"
        );
    }

    #[test]
    fn mime_guess_from_extension() {
        assert_eq!(mime_for("a.JPG"), "image/jpeg");
        assert_eq!(mime_for("a.webp"), "image/webp");
        assert_eq!(mime_for("a.png"), "image/png");
        assert_eq!(mime_for("noext"), "image/png");
    }

    #[test]
    fn api_error_is_not_unreachable() {
        let err = ComfyUIApiError::ApiError {
            status: 500,
            body: "boom".into(),
        };
        assert!(!err.is_unreachable());
        assert_eq!(err.to_string(), "ComfyUI API error (500): boom");
    }
}
