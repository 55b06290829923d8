//! Outbound Forwarder (C10): an independent loop that batches staged
//! payloads and POSTs them to the persistence API. On final failure the
//! batch is dropped — there is deliberately no local DLQ for this sink
//! (a prior design note flagged this as worth revisiting, but it is not
//! this workspace's call to make).

use crate::staging::OutboundStaging;
use ei_common::BatchMetadataItem;
use ei_retry::{classify_status, parse_retry_after, retry_with_backoff, Attempt, RetryDecision, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub batch_size: usize,
    pub fetch_interval: Duration,
    pub persistence_base_url: String,
    pub retry_policy: RetryPolicy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            fetch_interval: Duration::from_secs(2),
            persistence_base_url: "http://localhost:9000".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

pub struct OutboundForwarder {
    staging: Arc<OutboundStaging>,
    http: reqwest::Client,
    config: ForwarderConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl OutboundForwarder {
    pub fn new(staging: Arc<OutboundStaging>, config: ForwarderConfig, shutdown: tokio::sync::watch::Receiver<bool>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        Self { staging, http, config, shutdown }
    }

    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let size = match self.staging.size().await {
                Ok(size) => size,
                Err(e) => {
                    error!(error = %e, "failed to read outbound staging size");
                    0
                }
            };

            let draining = *shutdown.borrow();
            if draining && size == 0 {
                info!("outbound forwarder draining complete, exiting");
                return;
            }

            if size == 0 || ((size as usize) < self.config.batch_size && !draining) {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.fetch_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            if let Err(e) = self.drain_one_batch().await {
                warn!(error = %e, "outbound batch drain iteration failed");
            }
        }
    }

    async fn drain_one_batch(&self) -> ei_common::Result<()> {
        let raw = self.staging.pop_batch(self.config.batch_size).await?;
        if raw.is_empty() {
            return Ok(());
        }

        let items: Vec<BatchMetadataItem> = raw
            .iter()
            .filter_map(|payload| match serde_json::from_str(payload) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(error = %e, "dropping malformed outbound payload");
                    None
                }
            })
            .collect();
        if items.is_empty() {
            return Ok(());
        }

        let url = format!("{}/batch-metadata", self.config.persistence_base_url);
        let policy = self.config.retry_policy.clone();
        let http = self.http.clone();
        let count = items.len();

        let result = retry_with_backoff(&policy, move |attempt| {
            let http = http.clone();
            let url = url.clone();
            let items = items.clone();
            async move {
                let response = match http.post(&url).json(&items).send().await {
                    Ok(r) => r,
                    Err(e) => return Attempt::Retryable(format!("request error: {e}"), None),
                };
                let status = response.status();
                if status.is_success() {
                    return Attempt::Success(());
                }
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body = response.text().await.unwrap_or_default();
                debug!(attempt, status = status.as_u16(), "batch-metadata post rejected");
                match classify_status(status.as_u16()) {
                    RetryDecision::Retryable => Attempt::Retryable(format!("{status}: {body}"), retry_after),
                    RetryDecision::Fatal => Attempt::Fatal(format!("{status}: {body}")),
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(count, "forwarded batch to persistence API");
                Ok(())
            }
            Err(e) => {
                error!(count, error = %e, "batch permanently failed, dropping (no outbound DLQ)");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ei_store::Store;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_item() -> BatchMetadataItem {
        serde_json::from_value(serde_json::json!({
            "emailId": "msg-1",
            "subject": "hello",
            "sender": "sender@example.com",
            "recipient": "recipient@example.com",
            "receivedDate": "2026-01-01T00:00:00Z",
            "hasAttachments": false,
            "status": "PROCESSED",
        }))
        .expect("sample item matches BatchMetadataItem shape")
    }

    async fn staging_with_redis() -> Option<Arc<OutboundStaging>> {
        let url = std::env::var("TEST_REDIS_URL").ok()?;
        let store = Store::connect(&url).await.ok()?;
        Some(Arc::new(OutboundStaging::new(Arc::new(store))))
    }

    #[tokio::test]
    async fn drains_and_forwards_staged_batch() {
        let Some(staging) = staging_with_redis().await else {
            return;
        };
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batch-metadata"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let item = sample_item();
        staging.push(&serde_json::to_string(&item).unwrap()).await.unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let config = ForwarderConfig { persistence_base_url: server.uri(), ..Default::default() };
        let forwarder = OutboundForwarder::new(staging.clone(), config, rx);
        forwarder.drain_one_batch().await.unwrap();

        assert_eq!(staging.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_still_drains_without_error() {
        let Some(staging) = staging_with_redis().await else {
            return;
        };
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batch-metadata"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let item = sample_item();
        staging.push(&serde_json::to_string(&item).unwrap()).await.unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let mut config = ForwarderConfig { persistence_base_url: server.uri(), ..Default::default() };
        config.retry_policy.max_retries = 1;
        let forwarder = OutboundForwarder::new(staging.clone(), config, rx);
        assert!(forwarder.drain_one_batch().await.is_ok());
    }
}
