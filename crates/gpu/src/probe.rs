//! Timeout-bounded capability probes.
//!
//! A probe never fails: timeouts and errors become an unavailable
//! [`ProbeReport`], so one dead service cannot stall or poison a refresh.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::backend::{ProbeReport, ServiceBackend};

/// Upper bound for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn probe_with_timeout(backend: &dyn ServiceBackend, timeout: Duration) -> ProbeReport {
    let service = backend.service();
    match tokio::time::timeout(timeout, backend.probe()).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            tracing::debug!(service = %service, error = %e, "Probe failed");
            ProbeReport::unavailable(service, e.to_string())
        }
        Err(_) => {
            tracing::debug!(service = %service, timeout_ms = timeout.as_millis() as u64, "Probe timed out");
            ProbeReport::unavailable(
                service,
                format!("probe timed out after {} ms", timeout.as_millis()),
            )
        }
    }
}

/// Probe every backend concurrently, in registration order.
pub async fn probe_all(backends: &[Arc<dyn ServiceBackend>], timeout: Duration) -> Vec<ProbeReport> {
    join_all(
        backends
            .iter()
            .map(|backend| probe_with_timeout(backend.as_ref(), timeout)),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use async_trait::async_trait;
    use kiln_core::types::ServiceId;

    struct Slow;

    #[async_trait]
    impl ServiceBackend for Slow {
        fn service(&self) -> ServiceId {
            ServiceId::ImageDiffusion
        }
        async fn probe(&self) -> Result<ProbeReport, BackendError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ProbeReport::reachable(ServiceId::ImageDiffusion))
        }
        async fn unload(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn activate(&self, _model: Option<&str>) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ServiceBackend for Broken {
        fn service(&self) -> ServiceId {
            ServiceId::InferenceLlm
        }
        async fn probe(&self) -> Result<ProbeReport, BackendError> {
            Err(BackendError::Payload("garbage".into()))
        }
        async fn unload(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn activate(&self, _model: Option<&str>) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn timeout_becomes_unavailable() {
        let report = probe_with_timeout(&Slow, Duration::from_millis(20)).await;
        assert!(!report.available);
        assert_eq!(report.service, ServiceId::ImageDiffusion);
        assert!(report.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn error_becomes_unavailable() {
        let backends: Vec<Arc<dyn ServiceBackend>> = vec![Arc::new(Broken)];
        let reports = probe_all(&backends, PROBE_TIMEOUT).await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].available);
        assert!(!reports[0].active);
    }
}
