//! The job engine's view of a workflow execution engine.
//!
//! [`ComfyUIApi`] is the production implementation; tests substitute
//! scripted fakes.

use async_trait::async_trait;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::messages::{OutputFile, QueueSnapshot};

#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    /// Upload a conditioning image; returns the engine-side filename.
    async fn upload_image(&self, bytes: Vec<u8>, filename: &str) -> Result<String, ComfyUIApiError>;

    /// Queue a graph; returns the engine-assigned prompt id.
    async fn submit(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError>;

    async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError>;

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError>;

    /// Stop whatever is executing right now.
    async fn interrupt(&self) -> Result<(), ComfyUIApiError>;

    /// Drop a prompt that has not started yet.
    async fn delete_queued(&self, prompt_id: &str) -> Result<(), ComfyUIApiError>;

    fn output_url(&self, file: &OutputFile) -> String;
}

#[async_trait]
impl WorkflowBackend for ComfyUIApi {
    async fn upload_image(&self, bytes: Vec<u8>, filename: &str) -> Result<String, ComfyUIApiError> {
        let uploaded = ComfyUIApi::upload_image(self, bytes, filename).await?;
        Ok(if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        })
    }

    async fn submit(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError> {
        let response = self.submit_workflow(graph, client_id).await?;
        Ok(response.prompt_id)
    }

    async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        self.get_history(prompt_id).await
    }

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        self.get_queue().await
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        ComfyUIApi::interrupt(self).await
    }

    async fn delete_queued(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        ComfyUIApi::delete_queued(self, prompt_id).await
    }

    fn output_url(&self, file: &OutputFile) -> String {
        self.view_url(file)
    }
}
