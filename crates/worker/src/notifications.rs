//! Notification forwarding.
//!
//! Job and pipeline events are re-published on the [`EventBus`] as
//! [`PlatformEvent`]s; when a webhook is configured, bus events are posted
//! to it. Progress ticks stay on the bus and are not delivered outward.

use std::sync::Arc;

use kiln_comfyui::events::JobEvent;
use kiln_core::job_events::JOB_PROGRESS;
use kiln_events::{EventBus, PlatformEvent, WebhookDelivery};
use kiln_gpu::pipeline::PipelineEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub fn job_platform_event(event: &JobEvent) -> PlatformEvent {
    PlatformEvent::new(event.event_type())
        .with_source("job", event.job_id())
        .with_payload(serde_json::to_value(event).unwrap_or_default())
}

pub fn pipeline_platform_event(event: &PipelineEvent) -> PlatformEvent {
    let (event_type, id) = match event {
        PipelineEvent::Created { id, .. } => ("pipeline_created", id),
        PipelineEvent::StatusChanged { id, .. } => ("pipeline_status_changed", id),
        PipelineEvent::Destroyed { id } => ("pipeline_destroyed", id),
    };
    PlatformEvent::new(event_type)
        .with_source("pipeline", id.clone())
        .with_payload(serde_json::to_value(event).unwrap_or_default())
}

/// Re-publish every event from `receiver` onto `bus` until `cancel` fires
/// or the source channel closes.
pub async fn forward<E, F>(
    name: &'static str,
    mut receiver: broadcast::Receiver<E>,
    bus: Arc<EventBus>,
    convert: F,
    cancel: CancellationToken,
) where
    E: Clone,
    F: Fn(&E) -> PlatformEvent,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(source = name, "Event forwarder stopping");
                break;
            }
            received = receiver.recv() => match received {
                Ok(event) => bus.publish(convert(&event)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(source = name, skipped = n, "Event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!(source = name, "Event source closed, forwarder shutting down");
                    break;
                }
            },
        }
    }
}

/// Whether an event leaves the process.
pub fn is_deliverable(event: &PlatformEvent) -> bool {
    event.event_type != JOB_PROGRESS
}

/// Post bus events to the configured webhook until `cancel` fires or the
/// bus is dropped. Delivery failures are logged and the loop continues.
pub async fn deliver_webhooks(
    mut receiver: broadcast::Receiver<PlatformEvent>,
    delivery: WebhookDelivery,
    cancel: CancellationToken,
) {
    tracing::info!(url = %delivery.url(), "Webhook delivery started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Webhook delivery stopping");
                break;
            }
            received = receiver.recv() => match received {
                Ok(event) if is_deliverable(&event) => {
                    if let Err(e) = delivery.deliver(&event).await {
                        tracing::error!(
                            error = %e,
                            event_type = %event.event_type,
                            "Dropping undeliverable notification"
                        );
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Webhook delivery lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, webhook delivery shutting down");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_comfyui::templates::WorkflowCategory;
    use kiln_core::pipeline::PipelineStatus;

    #[test]
    fn job_events_keep_their_names() {
        let event = job_platform_event(&JobEvent::Failed {
            job_id: "job-9".into(),
            prompt_id: Some("p-9".into()),
            error: "CUDA out of memory".into(),
        });
        assert_eq!(event.event_type, "job_failed");
        assert_eq!(event.source_entity_id.as_deref(), Some("job-9"));
        assert_eq!(event.payload["type"], "failed");
        assert_eq!(event.payload["error"], "CUDA out of memory");
    }

    #[test]
    fn pipeline_events_are_sourced_by_pipeline_id() {
        let event = pipeline_platform_event(&PipelineEvent::StatusChanged {
            id: "pl-1".into(),
            from: PipelineStatus::Idle,
            to: PipelineStatus::Starting,
            error: None,
        });
        assert_eq!(event.event_type, "pipeline_status_changed");
        assert_eq!(event.source_entity_type.as_deref(), Some("pipeline"));
        assert_eq!(event.source_entity_id.as_deref(), Some("pl-1"));
    }

    #[test]
    fn progress_ticks_are_not_delivered() {
        let progress = job_platform_event(&JobEvent::Progress {
            job_id: "job-1".into(),
            prompt_id: "p-1".into(),
            percent: 40,
            current_node: None,
        });
        assert!(!is_deliverable(&progress));

        let queued = job_platform_event(&JobEvent::Queued {
            job_id: "job-1".into(),
            prompt_id: "p-1".into(),
            category: WorkflowCategory::TextToVideo,
        });
        assert!(is_deliverable(&queued));
    }

    #[tokio::test]
    async fn forwarder_republishes_until_source_closes() {
        let (tx, rx) = broadcast::channel::<JobEvent>(8);
        let bus = Arc::new(EventBus::default());
        let mut bus_rx = bus.subscribe();

        let task = tokio::spawn(forward(
            "jobs",
            rx,
            Arc::clone(&bus),
            job_platform_event,
            CancellationToken::new(),
        ));

        tx.send(JobEvent::Cancelled {
            job_id: "job-3".into(),
            prompt_id: None,
        })
        .unwrap();
        drop(tx);

        task.await.unwrap();
        let received = bus_rx.recv().await.unwrap();
        assert_eq!(received.event_type, "job_cancelled");
    }

    #[tokio::test]
    async fn forwarder_stops_on_cancel() {
        let (_tx, rx) = broadcast::channel::<PipelineEvent>(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(
            "pipelines",
            rx,
            Arc::new(EventBus::default()),
            pipeline_platform_event,
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
