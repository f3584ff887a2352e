//! Provider fallback dispatcher.
//!
//! Routes each capability request to a local backend or the cloud:
//!
//! - `auto`: local when it is ready, cloud on local failure unless the
//!   local-only policy is in force.
//! - `local`: local only, errors are returned as-is.
//! - `cloud`: cloud only, blocked under local-only.
//!
//! The dispatcher holds no state of its own. Before a local image or video
//! call it asks the budget manager (when one is wired) to make the
//! capability's service resident.

use std::sync::Arc;

use kiln_core::failure::FailureKind;
use kiln_core::media::{ChatCompletion, GeneratedMedia};
use kiln_core::types::Capability;
use kiln_core::vram::{SwitchAction, SwitchRequest};
use kiln_gpu::manager::VramBudgetManager;

use crate::cloud::CloudProvider;
use crate::error::DispatchError;
use crate::local::{LocalChatBackend, LocalImageBackend, LocalVideoBackend};
use crate::policy::{DispatchPolicy, ProviderPreference};
use crate::request::{ChatRequest, Dispatched, ImageRequest, Provider, VideoRequest};

#[derive(Default)]
pub struct ProviderDispatcher {
    policy: DispatchPolicy,
    chat: Option<Arc<dyn LocalChatBackend>>,
    image: Option<Arc<dyn LocalImageBackend>>,
    video: Option<Arc<dyn LocalVideoBackend>>,
    cloud: Option<Arc<dyn CloudProvider>>,
    budget: Option<Arc<VramBudgetManager>>,
}

impl ProviderDispatcher {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn with_local_chat(mut self, backend: Arc<dyn LocalChatBackend>) -> Self {
        self.chat = Some(backend);
        self
    }

    pub fn with_local_image(mut self, backend: Arc<dyn LocalImageBackend>) -> Self {
        self.image = Some(backend);
        self
    }

    pub fn with_local_video(mut self, backend: Arc<dyn LocalVideoBackend>) -> Self {
        self.video = Some(backend);
        self
    }

    pub fn with_cloud(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(provider);
        self
    }

    pub fn with_budget(mut self, budget: Arc<VramBudgetManager>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn cloud(&self) -> Option<&Arc<dyn CloudProvider>> {
        self.cloud.as_ref()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    pub async fn chat(
        &self,
        request: &ChatRequest,
        preference: ProviderPreference,
        local_only: Option<bool>,
    ) -> Result<Dispatched<ChatCompletion>, DispatchError> {
        let capability = Capability::Chat;
        let local_only = self.policy.local_only(local_only);

        match preference {
            ProviderPreference::Cloud => {
                let cloud = self.explicit_cloud(capability, local_only)?;
                self.cloud_chat(cloud, request, false).await
            }
            ProviderPreference::Local => {
                let local = self
                    .chat
                    .as_ref()
                    .ok_or_else(|| DispatchError::no_local_backend(capability))?;
                local_result(local.name(), local.chat(request).await?)
            }
            ProviderPreference::Auto => {
                let ready = match &self.chat {
                    Some(local) => local.is_reachable().await,
                    None => false,
                };
                let Some(local) = self.chat.as_ref().filter(|_| ready) else {
                    let cloud = self.when_unavailable(capability, local_only)?;
                    return self.cloud_chat(cloud, request, true).await;
                };
                match local.chat(request).await {
                    Ok(value) => local_result(local.name(), value),
                    Err(e) => {
                        let cloud = self.after_local_failure(capability, e, local_only)?;
                        self.cloud_chat(cloud, request, true).await
                    }
                }
            }
        }
    }

    pub async fn generate_image(
        &self,
        request: &ImageRequest,
        preference: ProviderPreference,
        local_only: Option<bool>,
    ) -> Result<Dispatched<GeneratedMedia>, DispatchError> {
        let capability = Capability::Image;
        let local_only = self.policy.local_only(local_only);

        match preference {
            ProviderPreference::Cloud => {
                let cloud = self.explicit_cloud(capability, local_only)?;
                self.cloud_image(cloud, request, false).await
            }
            ProviderPreference::Local => {
                let local = self
                    .image
                    .as_ref()
                    .ok_or_else(|| DispatchError::no_local_backend(capability))?;
                let value = self.local_image(local.as_ref(), request).await?;
                local_result(local.name(), value)
            }
            ProviderPreference::Auto => {
                let ready = match &self.image {
                    Some(local) => local.is_ready().await,
                    None => false,
                };
                let Some(local) = self.image.as_ref().filter(|_| ready) else {
                    let cloud = self.when_unavailable(capability, local_only)?;
                    return self.cloud_image(cloud, request, true).await;
                };
                match self.local_image(local.as_ref(), request).await {
                    Ok(value) => local_result(local.name(), value),
                    Err(e) => {
                        let cloud = self.after_local_failure(capability, e, local_only)?;
                        self.cloud_image(cloud, request, true).await
                    }
                }
            }
        }
    }

    pub async fn generate_video(
        &self,
        request: &VideoRequest,
        preference: ProviderPreference,
        local_only: Option<bool>,
    ) -> Result<Dispatched<GeneratedMedia>, DispatchError> {
        let capability = Capability::Video;
        let local_only = self.policy.local_only(local_only);

        match preference {
            ProviderPreference::Cloud => {
                let cloud = self.explicit_cloud(capability, local_only)?;
                self.cloud_video(cloud, request, false).await
            }
            ProviderPreference::Local => {
                let local = self
                    .video
                    .as_ref()
                    .ok_or_else(|| DispatchError::no_local_backend(capability))?;
                let value = self.local_video(local.as_ref(), request).await?;
                local_result(local.name(), value)
            }
            ProviderPreference::Auto => {
                let ready = match &self.video {
                    Some(local) => local.is_ready().await,
                    None => false,
                };
                let Some(local) = self.video.as_ref().filter(|_| ready) else {
                    let cloud = self.when_unavailable(capability, local_only)?;
                    return self.cloud_video(cloud, request, true).await;
                };
                match self.local_video(local.as_ref(), request).await {
                    Ok(value) => local_result(local.name(), value),
                    Err(e) => {
                        let cloud = self.after_local_failure(capability, e, local_only)?;
                        self.cloud_video(cloud, request, true).await
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Routing decisions
    // -----------------------------------------------------------------------

    /// Explicit cloud: blocked under local-only, misconfigured without a provider.
    fn explicit_cloud(
        &self,
        capability: Capability,
        local_only: bool,
    ) -> Result<&Arc<dyn CloudProvider>, DispatchError> {
        if local_only {
            return Err(DispatchError::policy_blocked(capability));
        }
        self.cloud.as_ref().ok_or_else(DispatchError::no_cloud_provider)
    }

    /// Local is not usable: cloud if allowed and configured.
    fn when_unavailable(
        &self,
        capability: Capability,
        local_only: bool,
    ) -> Result<&Arc<dyn CloudProvider>, DispatchError> {
        if local_only {
            tracing::warn!(capability = %capability, "Local backend unavailable and cloud is disabled");
            return Err(DispatchError::policy_blocked(capability));
        }
        match &self.cloud {
            Some(cloud) => {
                tracing::info!(capability = %capability, provider = cloud.name(), "Local backend unavailable, using cloud");
                Ok(cloud)
            }
            None => Err(DispatchError::nothing_available(capability)),
        }
    }

    /// Local call failed: re-raise under local-only or without a cloud.
    fn after_local_failure(
        &self,
        capability: Capability,
        error: DispatchError,
        local_only: bool,
    ) -> Result<&Arc<dyn CloudProvider>, DispatchError> {
        tracing::warn!(capability = %capability, kind = %error.kind, error = %error, "Local generation failed");
        if local_only {
            return Err(error);
        }
        match &self.cloud {
            Some(cloud) => {
                tracing::info!(capability = %capability, provider = cloud.name(), "Falling back to cloud");
                Ok(cloud)
            }
            None => Err(error),
        }
    }

    /// Ask the budget manager to make the capability's service resident.
    /// A resident service is used as is, so concurrent requests share it.
    async fn ensure_resident(
        &self,
        capability: Capability,
        model: Option<&str>,
    ) -> Result<(), DispatchError> {
        let Some(budget) = &self.budget else {
            return Ok(());
        };
        let mut request = SwitchRequest::new(capability.local_service());
        if let Some(model) = model {
            request = request.with_model(model);
        }
        let result = budget.ensure_resident(&request).await?;
        match result.action {
            SwitchAction::Failed => Err(DispatchError::new(
                result.failure.unwrap_or(FailureKind::Backend),
                result.message,
            )),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    async fn local_image(
        &self,
        local: &dyn LocalImageBackend,
        request: &ImageRequest,
    ) -> Result<GeneratedMedia, DispatchError> {
        self.ensure_resident(Capability::Image, request.model.as_deref())
            .await?;
        local.generate_image(request).await
    }

    async fn local_video(
        &self,
        local: &dyn LocalVideoBackend,
        request: &VideoRequest,
    ) -> Result<GeneratedMedia, DispatchError> {
        self.ensure_resident(Capability::Video, None).await?;
        local.generate_video(request).await
    }

    async fn cloud_chat(
        &self,
        cloud: &Arc<dyn CloudProvider>,
        request: &ChatRequest,
        fell_back: bool,
    ) -> Result<Dispatched<ChatCompletion>, DispatchError> {
        let value = cloud
            .chat(request)
            .await
            .map_err(|e| DispatchError::cloud(cloud.name(), e))?;
        Ok(cloud_result(cloud.name(), fell_back, value))
    }

    async fn cloud_image(
        &self,
        cloud: &Arc<dyn CloudProvider>,
        request: &ImageRequest,
        fell_back: bool,
    ) -> Result<Dispatched<GeneratedMedia>, DispatchError> {
        let value = cloud
            .generate_image(request)
            .await
            .map_err(|e| DispatchError::cloud(cloud.name(), e))?;
        Ok(cloud_result(cloud.name(), fell_back, value))
    }

    async fn cloud_video(
        &self,
        cloud: &Arc<dyn CloudProvider>,
        request: &VideoRequest,
        fell_back: bool,
    ) -> Result<Dispatched<GeneratedMedia>, DispatchError> {
        let value = cloud
            .generate_video(request)
            .await
            .map_err(|e| DispatchError::cloud(cloud.name(), e))?;
        Ok(cloud_result(cloud.name(), fell_back, value))
    }
}

fn local_result<T>(backend: &str, value: T) -> Result<Dispatched<T>, DispatchError> {
    Ok(Dispatched {
        provider: Provider::Local,
        backend: backend.to_string(),
        fell_back: false,
        value,
    })
}

fn cloud_result<T>(backend: &str, fell_back: bool, value: T) -> Dispatched<T> {
    Dispatched {
        provider: Provider::Cloud,
        backend: backend.to_string(),
        fell_back,
        value,
    }
}
