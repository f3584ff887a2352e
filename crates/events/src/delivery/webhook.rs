//! Webhook delivery with exponential-backoff retry.
//!
//! [`WebhookDelivery`] POSTs a [`PlatformEvent`] as JSON to one configured
//! endpoint. A failed attempt is retried after 1 s, 2 s and 4 s before the
//! last error is returned.

use std::time::Duration;

use crate::bus::PlatformEvent;

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
    retry_delays: Vec<Duration>,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default webhook HTTP client");
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.into(),
            retry_delays: RETRY_DELAYS.to_vec(),
        }
    }

    /// Replace the backoff schedule; an empty schedule means a single attempt.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver one event, retrying on failure. Returns the number of
    /// attempts it took.
    pub async fn deliver(&self, event: &PlatformEvent) -> Result<usize, WebhookError> {
        let mut attempt = 1;
        for delay in &self.retry_delays {
            match self.try_send(event).await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        url = %self.url,
                        event_type = %event.event_type,
                        error = %e,
                        "Webhook delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(*delay).await;
                }
            }
            attempt += 1;
        }

        match self.try_send(event).await {
            Ok(()) => Ok(attempt),
            Err(e) => {
                tracing::error!(
                    url = %self.url,
                    event_type = %event.event_type,
                    attempts = attempt,
                    error = %e,
                    "Webhook delivery failed after all retries"
                );
                Err(e)
            }
        }
    }

    async fn try_send(&self, event: &PlatformEvent) -> Result<(), WebhookError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn http_status_error_display() {
        assert_eq!(
            WebhookError::HttpStatus(502).to_string(),
            "Webhook returned HTTP 502"
        );
    }

    #[test]
    fn default_schedule_backs_off_exponentially() {
        let delivery = WebhookDelivery::new("http://hooks.local/kiln");
        assert_eq!(delivery.url(), "http://hooks.local/kiln");
        assert_eq!(
            delivery.retry_delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_after_retries() {
        // Port 9 (discard) is closed on test hosts; connections are refused.
        let delivery = WebhookDelivery::new("http://127.0.0.1:9/hook")
            .with_retry_delays(vec![Duration::ZERO, Duration::ZERO]);
        let result = delivery.deliver(&PlatformEvent::new("job.failed")).await;
        assert_matches!(result, Err(WebhookError::Request(_)));
    }
}
