//! The orchestrator context.
//!
//! Built once at startup and shared as `Arc`s; there are no globals.

use std::sync::Arc;

use kiln_comfyui::api::ComfyUIApi;
use kiln_comfyui::backend::WorkflowBackend;
use kiln_comfyui::engine::{JobEngine, JobEngineConfig};
use kiln_core::catalog::ModelCatalog;
use kiln_dispatch::cloud::HttpCloudProvider;
use kiln_dispatch::dispatcher::ProviderDispatcher;
use kiln_dispatch::local::{ComfyVideo, DiffusionImage, OllamaChat};
use kiln_dispatch::policy::DispatchPolicy;
use kiln_events::EventBus;
use kiln_gpu::backend::ServiceBackend;
use kiln_gpu::comfyui::ComfyUIBackend;
use kiln_gpu::diffusion::DiffusionBackend;
use kiln_gpu::manager::VramBudgetManager;
use kiln_gpu::ollama::OllamaBackend;
use kiln_gpu::pipeline::PipelineManager;

use crate::config::OrchestratorConfig;

pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub catalog: Arc<ModelCatalog>,
    pub budget: Arc<VramBudgetManager>,
    pub jobs: Arc<JobEngine>,
    pub dispatcher: Arc<ProviderDispatcher>,
    pub pipelines: Arc<PipelineManager>,
    pub event_bus: Arc<EventBus>,
}

impl Orchestrator {
    /// Wire the HTTP backends named by `config`. Performs no I/O.
    pub fn new(config: OrchestratorConfig) -> Self {
        let comfy_api = ComfyUIApi::new(config.comfyui_url.clone());
        let ollama = OllamaBackend::new(config.ollama_url.clone());
        let embeddings = OllamaBackend::embeddings(config.ollama_url.clone());
        let diffusion = DiffusionBackend::new(config.diffusion_url.clone());
        let comfy = ComfyUIBackend::new(comfy_api.clone());

        let backends: Vec<Arc<dyn ServiceBackend>> = vec![
            Arc::new(ollama.clone()),
            Arc::new(embeddings),
            Arc::new(diffusion.clone()),
            Arc::new(comfy.clone()),
        ];
        let budget = Arc::new(VramBudgetManager::new(config.budget(), backends));

        let workflow: Arc<dyn WorkflowBackend> = Arc::new(comfy_api);
        let jobs = Arc::new(JobEngine::new(workflow, engine_config(&config)));

        let mut dispatcher = ProviderDispatcher::new(DispatchPolicy::new(config.local_only))
            .with_local_chat(Arc::new(OllamaChat::new(
                ollama,
                config.ollama_chat_model.clone(),
            )))
            .with_local_image(Arc::new(DiffusionImage::new(diffusion)))
            .with_local_video(Arc::new(
                ComfyVideo::new(comfy, Arc::clone(&jobs)).with_timeout(config.job_timeout),
            ))
            .with_budget(Arc::clone(&budget));
        if let Some(url) = &config.cloud_api_url {
            dispatcher = dispatcher.with_cloud(Arc::new(HttpCloudProvider::new(
                config.cloud_provider_name.clone(),
                url.clone(),
                config.cloud_api_key.clone(),
            )));
        }

        Self::from_parts(config, budget, jobs, dispatcher)
    }

    /// Assemble a context around pre-built components.
    pub fn from_parts(
        config: OrchestratorConfig,
        budget: Arc<VramBudgetManager>,
        jobs: Arc<JobEngine>,
        dispatcher: ProviderDispatcher,
    ) -> Self {
        let catalog = Arc::new(ModelCatalog::builtin());
        let pipelines = Arc::new(PipelineManager::new(
            Arc::clone(&catalog),
            budget.config().usable_vram_gb(),
        ));
        Self {
            config: Arc::new(config),
            catalog,
            budget,
            jobs,
            dispatcher: Arc::new(dispatcher),
            pipelines,
            event_bus: Arc::new(EventBus::default()),
        }
    }
}

pub fn engine_config(config: &OrchestratorConfig) -> JobEngineConfig {
    JobEngineConfig {
        poll_interval: config.job_poll_interval,
        default_timeout: config.job_timeout,
    }
}
