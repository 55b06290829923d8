//! Poller (C7): cursor-resumable unread-message enumeration. One async
//! task per session, gated on the session being in a polling-eligible
//! state.

pub mod graph_client;

pub use graph_client::GraphMailProvider;

use ei_auth::TokenProvider;
use ei_common::provider::MailProvider;
use ei_common::{IngestError, Result, SessionState};
use ei_queue::EmailQueue;
use ei_ratelimit::RateLimitGovernor;
use ei_retry::{classify_status, retry_with_backoff, Attempt, RetryDecision, RetryPolicy};
use ei_session::SessionManager;
use ei_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CURSOR_KEY: &str = "polling:pagination_cursor";
const CURSOR_TTL: Duration = Duration::from_secs(3600);
const RATE_LIMIT_CHANNEL: &str = "graph_poll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Body runs every `polling_interval` seconds while the session is
    /// in a polling-eligible state.
    Scheduled,
    /// Body runs only when explicitly triggered.
    Manual,
    /// Body runs exactly once, then the caller is expected to terminate
    /// the session.
    OneShot,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub polling_interval: Duration,
    pub max_poll_pages: u32,
    pub rate_limit_threshold: u64,
    pub rate_limit_window: Duration,
    pub rate_limit_retry_delay: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(300),
            max_poll_pages: 10,
            rate_limit_threshold: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_retry_delay: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PollCycleOutcome {
    pub fetched: usize,
    pub accepted: usize,
}

pub struct Poller {
    store: Arc<Store>,
    queue: Arc<EmailQueue>,
    session: Arc<SessionManager>,
    rate_limit: Arc<RateLimitGovernor>,
    tokens: Arc<TokenProvider>,
    provider: Arc<dyn MailProvider>,
    config: PollerConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        queue: Arc<EmailQueue>,
        session: Arc<SessionManager>,
        rate_limit: Arc<RateLimitGovernor>,
        tokens: Arc<TokenProvider>,
        provider: Arc<dyn MailProvider>,
        config: PollerConfig,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self { store, queue, session, rate_limit, tokens, provider, config, shutdown }
    }

    pub async fn run(&self, mode: RunMode) -> Result<()> {
        match mode {
            RunMode::OneShot => {
                self.poll_cycle().await?;
                Ok(())
            }
            RunMode::Manual => {
                // Manual mode is driven by explicit `trigger()` calls from
                // the orchestrator; `run` just waits for shutdown.
                let mut shutdown = self.shutdown.clone();
                let _ = shutdown.changed().await;
                Ok(())
            }
            RunMode::Scheduled => self.run_scheduled().await,
        }
    }

    async fn run_scheduled(&self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }

            let state = self.session.current_state().await?;
            if !matches!(state, Some(SessionState::BothActive) | Some(SessionState::PollingActive)) {
                debug!(?state, "session not polling-eligible, skipping cycle");
                continue;
            }

            if let Err(e) = self.poll_cycle().await {
                error!(error = %e, "poll cycle failed");
                let _ = self.session.increment_polling_errors(1).await;
            }
        }
    }

    /// Trigger a single poll cycle on demand (manual mode).
    pub async fn trigger(&self) -> Result<PollCycleOutcome> {
        self.poll_cycle().await
    }

    async fn poll_cycle(&self) -> Result<PollCycleOutcome> {
        let allowed = self
            .rate_limit
            .wait_for_permit(RATE_LIMIT_CHANNEL, self.config.rate_limit_threshold, self.config.rate_limit_window, self.config.rate_limit_retry_delay)
            .await?;
        if !allowed {
            return Ok(PollCycleOutcome::default());
        }

        let access_token = self.tokens.get_access_token().await?;
        let mut cursor = self.store.get(CURSOR_KEY).await.map_err(store_err)?;
        let mut fetched = Vec::new();
        let mut pages = 0u32;

        loop {
            let provider = self.provider.clone();
            let cursor_for_attempt = cursor.clone();
            let access_token_for_attempt = access_token.clone();
            let page = retry_with_backoff(&self.config.retry_policy, move |_attempt| {
                let provider = provider.clone();
                let cursor = cursor_for_attempt.clone();
                let access_token = access_token_for_attempt.clone();
                async move {
                    match provider.fetch_unread_page(cursor.as_deref(), &access_token).await {
                        Ok(page) => Attempt::Success(page),
                        Err(e) => match e.provider_status() {
                            Some(status) => match classify_status(status) {
                                RetryDecision::Retryable => Attempt::Retryable(e.to_string(), e.provider_retry_after()),
                                RetryDecision::Fatal => Attempt::Fatal(e.to_string()),
                            },
                            None => Attempt::Retryable(e.to_string(), None),
                        },
                    }
                }
            })
            .await
            .map_err(|msg| {
                warn!(error = %msg, "poll page fetch failed");
                IngestError::Provider { status: None, retry_after: None, message: msg }
            })?;
            fetched.extend(page.messages);
            pages += 1;

            match page.next_cursor {
                Some(next) if pages < self.config.max_poll_pages => {
                    cursor = Some(next);
                }
                Some(next) => {
                    self.store.set_ex(CURSOR_KEY, &next, CURSOR_TTL).await.map_err(store_err)?;
                    cursor = None;
                    break;
                }
                None => {
                    self.store.del(CURSOR_KEY).await.map_err(store_err)?;
                    cursor = None;
                    break;
                }
            }
        }
        let _ = cursor;

        if fetched.is_empty() {
            return Ok(PollCycleOutcome::default());
        }

        let items: Vec<(String, String)> = fetched
            .iter()
            .filter_map(|m| serde_json::to_string(m).ok().map(|payload| (m.id.clone(), payload)))
            .collect();

        let accepted = self.queue.enqueue_batch(&items).await.map_err(|e| IngestError::Queue(e.to_string()))?;

        if !accepted.is_empty() {
            if let Err(e) = self.provider.mark_read_batch(&accepted, &access_token).await {
                warn!(error = %e, "best-effort mark-read batch failed");
            }
        }

        info!(fetched = fetched.len(), accepted = accepted.len(), pages, "poll cycle complete");
        Ok(PollCycleOutcome { fetched: fetched.len(), accepted: accepted.len() })
    }
}

fn store_err(e: ei_store::StoreError) -> IngestError {
    match e {
        ei_store::StoreError::Connection(msg) => IngestError::StoreUnavailable(msg),
        other => IngestError::Store(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.polling_interval, Duration::from_secs(300));
        assert_eq!(config.max_poll_pages, 10);
    }
}
