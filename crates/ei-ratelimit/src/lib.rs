//! Rate-Limit Governor (C2): a counter per logical API channel, backed by
//! the shared store's `incr`/TTL so every process calling the same
//! provider shares one window.

use ei_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub current_count: i64,
}

#[derive(Clone)]
pub struct RateLimitGovernor {
    store: Arc<Store>,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl RateLimitGovernor {
    pub fn new(store: Arc<Store>, shutdown: tokio::sync::watch::Receiver<bool>) -> Self {
        Self { store, shutdown }
    }

    /// `check_and_reserve` per §4.2: `incr` the channel's counter; if this
    /// was the first increment in the window, set its TTL. Allowed iff the
    /// post-increment count is within `limit`.
    pub async fn check_and_reserve(&self, channel: &str, limit: u64, window: Duration) -> ei_common::Result<RateLimitOutcome> {
        let key = format!("ratelimit:{channel}");
        let count = self
            .store
            .incr(&key)
            .await
            .map_err(|e| ei_common::IngestError::Store(e.to_string()))?;

        if count == 1 {
            self.store
                .expire(&key, window)
                .await
                .map_err(|e| ei_common::IngestError::Store(e.to_string()))?;
        }

        let allowed = count <= limit as i64;
        if !allowed {
            metrics::counter!("ei.ratelimit.denied_total", "channel" => channel.to_string()).increment(1);
        }
        Ok(RateLimitOutcome { allowed, current_count: count })
    }

    /// Check, and if denied, sleep for `retry_delay` and check again,
    /// looping until allowed or the governor's shutdown signal fires.
    /// Returns `Ok(false)` if shutdown interrupted the wait.
    pub async fn wait_for_permit(
        &self,
        channel: &str,
        limit: u64,
        window: Duration,
        retry_delay: Duration,
    ) -> ei_common::Result<bool> {
        let mut shutdown = self.shutdown.clone();
        loop {
            let outcome = self.check_and_reserve(channel, limit, window).await?;
            if outcome.allowed {
                return Ok(true);
            }
            warn!(channel, count = outcome.current_count, limit, "rate limit exceeded, waiting");
            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {
                    debug!(channel, "rechecking rate limit after delay");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(count: i64, limit: u64) -> RateLimitOutcome {
        RateLimitOutcome { allowed: count <= limit as i64, current_count: count }
    }

    #[test]
    fn allowed_boundary() {
        assert!(outcome(100, 100).allowed);
        assert!(!outcome(101, 100).allowed);
    }
}
