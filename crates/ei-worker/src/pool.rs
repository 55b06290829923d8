//! Batch Worker Pool (C9): drains the email queue in batches, runs each
//! message through dedup/spam/attachment/publish, then bulk-marks the
//! batch as processed or failed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ei_common::{BatchMetadataItem, EmailMessage, ItemStatus};
use ei_queue::EmailQueue;
use ei_session::SessionManager;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::attachment::AttachmentWriter;
use crate::message_bus::MessageBus;
use crate::spam_filter::SpamFilter;
use ei_forward::OutboundStaging;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub batch_size: u64,
    pub max_workers: usize,
    pub fetch_interval: Duration,
    pub worker_timeout: Duration,
    pub reclaim_every_n_batches: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            max_workers: 15,
            fetch_interval: Duration::from_secs(2),
            worker_timeout: Duration::from_secs(30),
            reclaim_every_n_batches: 10,
        }
    }
}

enum Outcome {
    Processed(String, BatchMetadataItem),
    Failed(String, String),
}

pub struct BatchWorkerPool {
    queue: Arc<EmailQueue>,
    session: Arc<SessionManager>,
    staging: Arc<OutboundStaging>,
    bus: Arc<MessageBus>,
    spam_filter: SpamFilter,
    attachment_writer: Arc<dyn AttachmentWriter>,
    config: WorkerPoolConfig,
    shutdown: watch::Receiver<bool>,
    batches_since_reclaim: AtomicU64,
}

impl BatchWorkerPool {
    pub fn new(
        queue: Arc<EmailQueue>,
        session: Arc<SessionManager>,
        staging: Arc<OutboundStaging>,
        bus: Arc<MessageBus>,
        spam_filter: SpamFilter,
        attachment_writer: Arc<dyn AttachmentWriter>,
        config: WorkerPoolConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            session,
            staging,
            bus,
            spam_filter,
            attachment_writer,
            config,
            shutdown,
            batches_since_reclaim: AtomicU64::new(0),
        }
    }

    pub async fn run(&self) {
        info!(batch_size = self.config.batch_size, max_workers = self.config.max_workers, "batch worker pool started");
        let mut shutdown = self.shutdown.clone();
        loop {
            let pending = self.queue.pending_count().await.unwrap_or(0);
            let draining = *shutdown.borrow();

            if pending == 0 && draining {
                info!("batch worker pool drained, exiting");
                return;
            }

            if pending < self.config.batch_size && !draining {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.fetch_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let batch = match self.queue.dequeue_batch(self.config.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "failed to dequeue batch");
                    tokio::time::sleep(self.config.fetch_interval).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::time::sleep(self.config.fetch_interval).await;
                continue;
            }

            self.run_batch(batch).await;

            let n = self.batches_since_reclaim.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.config.reclaim_every_n_batches {
                self.batches_since_reclaim.store(0, Ordering::SeqCst);
                match self.queue.reclaim_expired().await {
                    Ok(count) if count > 0 => info!(count, "reclaimed expired in-flight entries"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reclaim_expired failed"),
                }
            }
        }
    }

    async fn run_batch(&self, batch: Vec<(String, String)>) {
        let started = std::time::Instant::now();
        metrics::gauge!("ei.worker.batch_size").set(batch.len() as f64);
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut handles = Vec::with_capacity(batch.len());

        for (id, payload) in batch {
            let semaphore = semaphore.clone();
            let session = self.session.clone();
            let staging = self.staging.clone();
            let bus = self.bus.clone();
            let spam_filter = self.spam_filter.clone();
            let attachment_writer = self.attachment_writer.clone();
            let timeout = self.config.worker_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let outcome = tokio::time::timeout(
                    timeout,
                    process_one(id.clone(), payload, session, staging, bus, spam_filter, attachment_writer),
                )
                .await;

                match outcome {
                    Ok(Ok(item)) => Outcome::Processed(id, item),
                    Ok(Err(e)) => Outcome::Failed(id, e),
                    Err(_) => Outcome::Failed(id, "worker timed out".to_string()),
                }
            }));
        }

        let mut processed_ids = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Outcome::Processed(id, _item)) => processed_ids.push(id),
                Ok(Outcome::Failed(id, error)) => {
                    if let Err(e) = self.queue.mark_failed(&id, &error).await {
                        error!(id = %id, error = %e, "mark_failed itself failed");
                    }
                }
                Err(e) => error!(error = %e, "worker task panicked"),
            }
        }

        if !processed_ids.is_empty() {
            if let Err(e) = self.queue.mark_processed(&processed_ids).await {
                error!(error = %e, "mark_processed failed for batch");
            }
            debug!(count = processed_ids.len(), "batch marked processed");
        }

        metrics::histogram!("ei.worker.batch_duration_seconds").record(started.elapsed().as_secs_f64());
    }
}

async fn process_one(
    id: String,
    payload: String,
    session: Arc<SessionManager>,
    staging: Arc<OutboundStaging>,
    bus: Arc<MessageBus>,
    spam_filter: SpamFilter,
    attachment_writer: Arc<dyn AttachmentWriter>,
) -> std::result::Result<BatchMetadataItem, String> {
    let message: EmailMessage = serde_json::from_str(&payload).map_err(|e| format!("malformed payload: {e}"))?;

    if session.is_processed(&id).await.unwrap_or(false) {
        debug!(id = %id, "already processed, late dedup skip");
        return Ok(build_item(&message, ItemStatus::Processed, None));
    }

    let is_spam = spam_filter.is_spam(&message.sender);
    let status = if is_spam { ItemStatus::Spam } else { ItemStatus::Processed };

    let attachment_name = if message.has_attachments {
        match attachment_writer.save(&message).await {
            Ok(name) => name,
            Err(e) => {
                warn!(id = %id, error = %e, "attachment save failed");
                None
            }
        }
    } else {
        None
    };

    let item = build_item(&message, status, attachment_name);

    if !is_spam {
        let serialized = serde_json::to_vec(&item).map_err(|e| format!("serialize for bus failed: {e}"))?;
        bus.publish(&serialized).await.map_err(|e| format!("bus publish failed: {e}"))?;
    }

    let staged = serde_json::to_string(&item).map_err(|e| format!("serialize for staging failed: {e}"))?;
    staging.push(&staged).await.map_err(|e| format!("stage failed: {e}"))?;

    Ok(item)
}

fn build_item(message: &EmailMessage, status: ItemStatus, attachment_name: Option<String>) -> BatchMetadataItem {
    BatchMetadataItem {
        email_id: message.id.clone(),
        subject: message.subject.clone(),
        sender: message.sender.clone(),
        recipient: message.recipient.clone(),
        received_date: message.received_at,
        has_attachments: message.has_attachments,
        attachment_name,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_message() -> EmailMessage {
        EmailMessage {
            id: "msg-1".to_string(),
            subject: "hello".to_string(),
            sender: "sender@example.com".to_string(),
            recipient: "recipient@example.com".to_string(),
            received_at: Utc::now(),
            has_attachments: false,
            body_preview: "preview".to_string(),
            raw_message: serde_json::json!({}),
        }
    }

    #[test]
    fn build_item_carries_fields_from_message() {
        let message = sample_message();
        let item = build_item(&message, ItemStatus::Processed, Some("file.pdf".to_string()));
        assert_eq!(item.email_id, "msg-1");
        assert_eq!(item.attachment_name.as_deref(), Some("file.pdf"));
        assert_eq!(item.status, ItemStatus::Processed);
    }

    #[test]
    fn default_config_matches_documented_ranges() {
        let config = WorkerPoolConfig::default();
        assert!(config.batch_size >= 20 && config.batch_size <= 50);
        assert!(config.max_workers >= 10 && config.max_workers <= 20);
    }
}
