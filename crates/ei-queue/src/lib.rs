//! Email Queue (C5): a priority queue of message ids with visibility
//! timeout, dedup against a processed-set, and a DLQ for ids that
//! exhaust retries at the worker pool. Built entirely on
//! `ei_store::Store`'s sorted-queue and set primitives — there is no
//! state here that the store doesn't own.

pub mod error;

pub use error::QueueError;

use chrono::Utc;
use ei_store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, QueueError>;

const PROCESSED_SET: &str = "email:processed";
const MAIN_QUEUE: &str = "queue:emails";
const INFLIGHT_SET: &str = "queue:processing";
const DLQ: &str = "queue:failed";

const PROCESSED_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const PAYLOAD_TTL: Duration = Duration::from_secs(24 * 3600);
const RETRY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

fn payload_key(id: &str) -> String {
    format!("email:data:{id}")
}

fn retry_key(id: &str) -> String {
    format!("email:retry:{id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub error: String,
    pub attempt_count: i64,
    pub failed_at: chrono::DateTime<Utc>,
}

pub struct EmailQueue {
    store: Arc<Store>,
}

impl EmailQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Admit `id` with `payload` unless it's already processed, queued,
    /// or in flight. `priority` defaults to the current unix timestamp
    /// (earlier enqueue = earlier dequeue).
    pub async fn enqueue(&self, id: &str, payload: &str, priority: Option<f64>) -> Result<Option<String>> {
        let score = priority.unwrap_or_else(now_score);
        let admitted = self.store.claim_new(PROCESSED_SET, MAIN_QUEUE, INFLIGHT_SET, id, score).await?;
        if !admitted {
            return Ok(None);
        }
        self.store.set_ex(&payload_key(id), payload, PAYLOAD_TTL).await?;
        Ok(Some(id.to_string()))
    }

    /// Batch form of [`enqueue`](Self::enqueue) in one round trip.
    /// Priorities within the batch get a stable tiebreaker
    /// (`base + i * 1e-3`) so insertion order survives equal base
    /// priorities.
    pub async fn enqueue_batch(&self, items: &[(String, String)]) -> Result<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let base = now_score();
        let scored: Vec<(String, f64)> = items
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), base + i as f64 * 1e-3))
            .collect();

        let admitted = self.store.claim_new_batch(PROCESSED_SET, MAIN_QUEUE, INFLIGHT_SET, &scored).await?;

        let mut accepted = Vec::new();
        for ((id, payload), was_admitted) in items.iter().zip(admitted.into_iter()) {
            if was_admitted {
                self.store.set_ex(&payload_key(id), payload, PAYLOAD_TTL).await?;
                accepted.push(id.clone());
            }
        }
        Ok(accepted)
    }

    /// Atomically dequeue up to `n` ids into the in-flight set, then
    /// fetch their payloads. An id whose payload has already expired
    /// (TTL raced ahead of the dequeue) is re-queued rather than
    /// silently dropped.
    pub async fn dequeue_batch(&self, n: u64) -> Result<Vec<(String, String)>> {
        let ids = self
            .store
            .atomic_dequeue(MAIN_QUEUE, INFLIGHT_SET, n, VISIBILITY_TIMEOUT, now_score())
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        metrics::counter!("ei.queue.dequeued_total").increment(ids.len() as u64);

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get(&payload_key(id.as_str())).await? {
                Some(payload) => out.push((id, payload)),
                None => {
                    warn!(id = %id, "dequeued id had no payload, re-queueing");
                    self.store.remove(INFLIGHT_SET, &id).await?;
                    self.store.push(MAIN_QUEUE, &id, now_score()).await?;
                }
            }
        }
        Ok(out)
    }

    pub async fn mark_processed(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.store.remove(INFLIGHT_SET, id).await?;
            self.store.del(&payload_key(id)).await?;
            self.store.add(PROCESSED_SET, &[id.clone()]).await?;
        }
        if !ids.is_empty() {
            self.store.expire(PROCESSED_SET, PROCESSED_TTL).await?;
        }
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.store.remove(INFLIGHT_SET, id).await?;
        let attempt_count = self.store.hincrby(&retry_key(id), "attempts", 1).await?;
        self.store.expire(&retry_key(id), RETRY_TTL).await?;

        let entry = DeadLetter {
            id: id.to_string(),
            error: error.to_string(),
            attempt_count,
            failed_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&entry)?;
        self.store.lpush(DLQ, &serialized).await?;
        debug!(id, attempt_count, "moved to dead-letter queue");
        Ok(())
    }

    /// Move every in-flight entry whose visibility deadline has passed
    /// back onto the main queue. Run periodically by the worker pool.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let expired = self.store.range_by_score(INFLIGHT_SET, now_score()).await?;
        for id in &expired {
            if self.store.remove(INFLIGHT_SET, id).await? {
                self.store.push(MAIN_QUEUE, id, now_score()).await?;
            }
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "reclaimed expired in-flight entries");
        }
        Ok(expired.len() as u64)
    }

    pub async fn is_pending(&self, id: &str) -> Result<bool> {
        if self.store.score(MAIN_QUEUE, id).await?.is_some() {
            return Ok(true);
        }
        Ok(self.store.score(INFLIGHT_SET, id).await?.is_some())
    }

    pub async fn processed_count(&self) -> Result<u64> {
        Ok(self.store.card(PROCESSED_SET).await?)
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let count = self.store.zcard(MAIN_QUEUE).await?;
        metrics::gauge!("ei.queue.pending").set(count as f64);
        Ok(count)
    }

    pub async fn in_flight_count(&self) -> Result<u64> {
        Ok(self.store.zcard(INFLIGHT_SET).await?)
    }

    pub async fn failed_count(&self) -> Result<u64> {
        Ok(self.store.llen(DLQ).await?)
    }

    pub async fn dead_letters(&self, limit: isize) -> Result<Vec<DeadLetter>> {
        let raw = self.store.lrange(DLQ, 0, limit.saturating_sub(1)).await?;
        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            out.push(serde_json::from_str(&entry)?);
        }
        Ok(out)
    }
}

fn now_score() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_round_trips_through_json() {
        let entry = DeadLetter {
            id: "abc".to_string(),
            error: "boom".to_string(),
            attempt_count: 3,
            failed_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&entry).unwrap();
        let parsed: DeadLetter = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.id, "abc");
        assert_eq!(parsed.attempt_count, 3);
    }

    #[test]
    fn stable_tiebreaker_preserves_order() {
        let base = 1_000.0;
        let scores: Vec<f64> = (0..5).map(|i| base + i as f64 * 1e-3).collect();
        for window in scores.windows(2) {
            assert!(window[0] < window[1]);
        }
    }
}
