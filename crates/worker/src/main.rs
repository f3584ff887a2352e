use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kiln_events::WebhookDelivery;
use kiln_worker::background::{job_cleanup, state_refresh};
use kiln_worker::config::{LogFormat, OrchestratorConfig};
use kiln_worker::context::Orchestrator;
use kiln_worker::notifications;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for each background task at shutdown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "kiln_worker=debug,kiln_gpu=info,kiln_comfyui=info,kiln_dispatch=info,kiln_events=info"
            .into()
    });
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!(
        comfyui = %config.comfyui_url,
        ollama = %config.ollama_url,
        diffusion = %config.diffusion_url,
        cloud = config.cloud_api_url.as_deref().unwrap_or("disabled"),
        local_only = config.local_only,
        total_vram_gb = config.total_vram_gb,
        "Loaded orchestrator configuration"
    );

    // --- Context ---
    let orchestrator = Orchestrator::new(config);
    let config = Arc::clone(&orchestrator.config);

    let initial = orchestrator.budget.refresh_state().await;
    tracing::info!(
        active = initial.active.len(),
        available_gb = initial.available_vram_gb,
        "Initial GPU state"
    );

    // --- Background tasks ---
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    handles.push(tokio::spawn(state_refresh::run(
        Arc::clone(&orchestrator.budget),
        Arc::clone(&orchestrator.event_bus),
        config.state_refresh_interval,
        cancel.clone(),
    )));
    handles.push(tokio::spawn(job_cleanup::run(
        Arc::clone(&orchestrator.jobs),
        config.job_retention,
        config.job_cleanup_interval,
        cancel.clone(),
    )));
    handles.push(tokio::spawn(notifications::forward(
        "jobs",
        orchestrator.jobs.subscribe(),
        Arc::clone(&orchestrator.event_bus),
        notifications::job_platform_event,
        cancel.clone(),
    )));
    handles.push(tokio::spawn(notifications::forward(
        "pipelines",
        orchestrator.pipelines.subscribe(),
        Arc::clone(&orchestrator.event_bus),
        notifications::pipeline_platform_event,
        cancel.clone(),
    )));
    if let Some(url) = &config.notify_webhook_url {
        handles.push(tokio::spawn(notifications::deliver_webhooks(
            orchestrator.event_bus.subscribe(),
            WebhookDelivery::new(url.clone()),
            cancel.clone(),
        )));
    }

    tracing::info!(tasks = handles.len(), "Orchestrator running");

    shutdown_signal().await;

    // --- Shutdown ---
    tracing::info!("Shutdown requested, stopping background tasks");
    cancel.cancel();
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
            tracing::warn!("Background task did not stop in time");
        }
    }

    let in_flight = orchestrator
        .jobs
        .list()
        .await
        .into_iter()
        .filter(|job| !job.is_terminal())
        .count();
    if in_flight > 0 {
        tracing::warn!(in_flight, "Exiting with jobs still running on the engine");
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
