//! ComfyUI as a budgeted service.
//!
//! ComfyUI has no notion of "the loaded model"; it holds VRAM while torch
//! has tensors allocated or work is queued. Unload asks it to free memory.

use async_trait::async_trait;
use kiln_comfyui::api::ComfyUIApi;
use kiln_core::types::ServiceId;

use crate::backend::{BackendError, ProbeReport, ServiceBackend};

#[derive(Clone)]
pub struct ComfyUIBackend {
    api: ComfyUIApi,
}

impl ComfyUIBackend {
    pub fn new(api: ComfyUIApi) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }
}

#[async_trait]
impl ServiceBackend for ComfyUIBackend {
    fn service(&self) -> ServiceId {
        ServiceId::WorkflowEngine
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let stats = self.api.system_stats().await?;
        let mut report = ProbeReport::reachable(ServiceId::WorkflowEngine);
        report.vram_total_gb = stats.vram_total_gb();

        let torch_gb = stats.torch_vram_gb();
        let pending = match self.api.get_queue().await {
            Ok(queue) => queue.remaining(),
            Err(e) => {
                tracing::debug!(error = %e, "ComfyUI queue unavailable during probe");
                0
            }
        };

        report.active = torch_gb > 0.0 || pending > 0;
        if torch_gb > 0.0 {
            report.vram_used_gb = Some(torch_gb);
        }
        if pending > 0 {
            report.detail = Some(format!("{pending} prompt(s) queued"));
        }
        Ok(report)
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.api.free_memory().await?;
        Ok(())
    }

    async fn activate(&self, _model: Option<&str>) -> Result<(), BackendError> {
        // Checkpoints load on the first prompt; reachability is all we check.
        self.api.system_stats().await?;
        Ok(())
    }
}
