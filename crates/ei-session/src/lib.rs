//! Session Manager (C6): the single source of truth for what the
//! ingestion process is currently doing — idle, polling only, webhook
//! only, or both — plus the monotonic counters every other component
//! reports progress into.
//!
//! State transitions are guarded compare-and-sets against the
//! `session:current` hash's `state` field, so two racing callers can't
//! both believe they made the same transition.

use chrono::Utc;
use ei_common::{HealthReport, HealthStatus, IngestError, PollingMode, Result, SessionCounters, SessionRecord, SessionState};
use ei_queue::EmailQueue;
use ei_store::Store;
use std::sync::Arc;
use tracing::{info, warn};

const SESSION_KEY: &str = "session:current";
const HISTORY_KEY: &str = "sessions:history";
const HISTORY_CAP: isize = 100;
const SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);

/// Shared with `ei-queue`'s processed-id set; the session manager only
/// reads it for late-dedup checks, never writes it.
const PROCESSED_SET: &str = "email:processed";

fn state_str(state: SessionState) -> &'static str {
    match state {
        SessionState::Idle => "idle",
        SessionState::PollingActive => "polling_active",
        SessionState::WebhookActive => "webhook_active",
        SessionState::BothActive => "both_active",
        SessionState::Terminated => "terminated",
        SessionState::FailedToStart => "failed_to_start",
        SessionState::SessionError => "session_error",
    }
}

fn parse_state(s: &str) -> Option<SessionState> {
    Some(match s {
        "idle" => SessionState::Idle,
        "polling_active" => SessionState::PollingActive,
        "webhook_active" => SessionState::WebhookActive,
        "both_active" => SessionState::BothActive,
        "terminated" => SessionState::Terminated,
        "failed_to_start" => SessionState::FailedToStart,
        "session_error" => SessionState::SessionError,
        _ => return None,
    })
}

fn polling_mode_str(mode: PollingMode) -> &'static str {
    match mode {
        PollingMode::Manual => "manual",
        PollingMode::Scheduled => "scheduled",
        PollingMode::Fallback => "fallback",
    }
}

fn parse_polling_mode(s: &str) -> PollingMode {
    match s {
        "manual" => PollingMode::Manual,
        "fallback" => PollingMode::Fallback,
        _ => PollingMode::Scheduled,
    }
}

pub struct SessionManager {
    store: Arc<Store>,
    queue: Arc<EmailQueue>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, queue: Arc<EmailQueue>) -> Self {
        Self { store, queue }
    }

    /// Start a fresh session in `both_active` (webhook enabled) or
    /// `polling_active` (webhook disabled). Only valid from `idle` or an
    /// absent record — a session already in progress is left untouched.
    pub async fn start_session(&self, webhook_enabled: bool, polling_interval: u64, polling_mode: PollingMode) -> Result<()> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let initial_state = if webhook_enabled { SessionState::BothActive } else { SessionState::PollingActive };

        let admitted = self.store.hset_if_in(SESSION_KEY, "state", &["", state_str(SessionState::Idle)], state_str(initial_state)).await.map_err(store_err)?;
        if !admitted {
            warn!("start_session called while a session was already in progress");
            return Err(IngestError::InvalidTransition { from: SessionState::Idle, to: initial_state });
        }

        self.store
            .hset_multiple(
                SESSION_KEY,
                &[
                    ("session_id", session_id.as_str()),
                    ("start_time", &Utc::now().to_rfc3339()),
                    ("polling_interval", &polling_interval.to_string()),
                    ("webhook_enabled", if webhook_enabled { "true" } else { "false" }),
                    ("polling_mode", polling_mode_str(polling_mode)),
                    ("polling_errors", "0"),
                    ("webhook_errors", "0"),
                ],
            )
            .await
            .map_err(store_err)?;
        self.store.expire(SESSION_KEY, SESSION_TTL).await.map_err(store_err)?;
        info!(session_id, state = state_str(initial_state), "session started");
        Ok(())
    }

    /// Start failed before a session record could be fully established.
    pub async fn mark_start_failed(&self, reason: &str) -> Result<()> {
        self.store
            .hset_multiple(SESSION_KEY, &[("state", state_str(SessionState::FailedToStart)), ("failure_reason", reason)])
            .await
            .map_err(store_err)?;
        self.store.expire(SESSION_KEY, SESSION_TTL).await.map_err(store_err)?;
        warn!(reason, "session failed to start");
        Ok(())
    }

    /// `both_active -> webhook_active`, fired once the initial polling
    /// sweep has caught up and the webhook can take over alone.
    pub async fn complete_initial_polling(&self) -> Result<()> {
        self.transition(&[SessionState::BothActive], SessionState::WebhookActive).await
    }

    /// `webhook_active -> both_active`, fired when the webhook path is
    /// unhealthy enough that polling must resume as a fallback.
    pub async fn activate_fallback_polling(&self) -> Result<()> {
        self.transition(&[SessionState::WebhookActive], SessionState::BothActive).await
    }

    /// `both_active -> webhook_active`, fired once fallback polling is no
    /// longer needed and the webhook can resume sole responsibility.
    pub async fn restore_webhook_only(&self) -> Result<()> {
        self.transition(&[SessionState::BothActive], SessionState::WebhookActive).await
    }

    /// Any active state transitions to `session_error` on an unrecoverable
    /// runtime failure.
    pub async fn record_error(&self, details: &str) -> Result<()> {
        let from_states = [
            SessionState::PollingActive,
            SessionState::WebhookActive,
            SessionState::BothActive,
        ];
        self.transition(&from_states, SessionState::SessionError).await?;
        self.store.hset(SESSION_KEY, "error_details", details).await.map_err(store_err)?;
        Ok(())
    }

    /// Snapshot the current record into history, then reset to `idle` so
    /// the orchestrator can attempt a fresh start.
    pub async fn recover_from_error(&self) -> Result<()> {
        self.snapshot_to_history().await?;
        self.store.del(SESSION_KEY).await.map_err(store_err)?;
        self.store.hset(SESSION_KEY, "state", state_str(SessionState::Idle)).await.map_err(store_err)?;
        self.store.expire(SESSION_KEY, SESSION_TTL).await.map_err(store_err)?;
        info!("session recovered to idle");
        Ok(())
    }

    /// Write `end_time` and `reason`, snapshot to history, then clear the
    /// live record entirely.
    pub async fn terminate_session(&self, reason: &str) -> Result<()> {
        self.store
            .hset_multiple(
                SESSION_KEY,
                &[("state", state_str(SessionState::Terminated)), ("end_time", &Utc::now().to_rfc3339()), ("failure_reason", reason)],
            )
            .await
            .map_err(store_err)?;
        self.snapshot_to_history().await?;
        self.store.del(SESSION_KEY).await.map_err(store_err)?;
        info!(reason, "session terminated");
        Ok(())
    }

    async fn transition(&self, allowed: &[SessionState], next: SessionState) -> Result<()> {
        let allowed_strs: Vec<&str> = allowed.iter().map(|s| state_str(*s)).collect();
        let ok = self.store.hset_if_in(SESSION_KEY, "state", &allowed_strs, state_str(next)).await.map_err(store_err)?;
        if !ok {
            let current = self.current_state().await?.unwrap_or(SessionState::Idle);
            return Err(IngestError::InvalidTransition { from: current, to: next });
        }
        Ok(())
    }

    async fn snapshot_to_history(&self) -> Result<()> {
        if let Some(record) = self.current().await? {
            let serialized = serde_json::to_string(&record)?;
            self.store.lpush(HISTORY_KEY, &serialized).await.map_err(store_err)?;
            self.store.ltrim(HISTORY_KEY, 0, HISTORY_CAP - 1).await.map_err(store_err)?;
        }
        Ok(())
    }

    pub async fn current_state(&self) -> Result<Option<SessionState>> {
        let raw = self.store.hget(SESSION_KEY, "state").await.map_err(store_err)?;
        Ok(raw.and_then(|s| parse_state(&s)))
    }

    pub async fn current(&self) -> Result<Option<SessionRecord>> {
        let fields = self.store.hgetall(SESSION_KEY).await.map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let state = fields.get("state").and_then(|s| parse_state(s)).unwrap_or(SessionState::Idle);
        let start_time = fields
            .get("start_time")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let end_time = fields.get("end_time").and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc));

        // processed/pending/failed are derived from ei-queue's own
        // cardinalities at read time, never from this hash, so a lost
        // hincrby can't let the reported counters diverge from ground truth.
        let processed = self.queue.processed_count().await.map_err(|e| IngestError::Queue(e.to_string()))?;
        let pending = self.queue.pending_count().await.map_err(|e| IngestError::Queue(e.to_string()))?;
        let failed = self.queue.failed_count().await.map_err(|e| IngestError::Queue(e.to_string()))?;

        Ok(Some(SessionRecord {
            session_id: fields.get("session_id").cloned().unwrap_or_default(),
            state,
            start_time,
            end_time,
            polling_interval: fields.get("polling_interval").and_then(|s| s.parse().ok()).unwrap_or(300),
            webhook_enabled: fields.get("webhook_enabled").map(|s| s == "true").unwrap_or(false),
            polling_mode: fields.get("polling_mode").map(|s| parse_polling_mode(s)).unwrap_or(PollingMode::Scheduled),
            counters: SessionCounters {
                processed,
                pending,
                failed,
                polling_errors: fields.get("polling_errors").and_then(|s| s.parse().ok()).unwrap_or(0),
                webhook_errors: fields.get("webhook_errors").and_then(|s| s.parse().ok()).unwrap_or(0),
            },
            failure_reason: fields.get("failure_reason").cloned(),
            error_details: fields.get("error_details").cloned(),
        }))
    }

    pub async fn increment_polling_errors(&self, delta: i64) -> Result<()> {
        self.store.hincrby(SESSION_KEY, "polling_errors", delta).await.map_err(store_err)?;
        Ok(())
    }

    pub async fn increment_webhook_errors(&self, delta: i64) -> Result<()> {
        self.store.hincrby(SESSION_KEY, "webhook_errors", delta).await.map_err(store_err)?;
        Ok(())
    }

    /// Late-dedup check used by the poller and webhook receiver: has this
    /// id already been fully processed, independent of whether it's still
    /// sitting in the queue.
    pub async fn is_processed(&self, id: &str) -> Result<bool> {
        Ok(self.store.contains(PROCESSED_SET, id).await.map_err(store_err)?)
    }

    pub async fn history(&self, limit: isize) -> Result<Vec<SessionRecord>> {
        let raw = self.store.lrange(HISTORY_KEY, 0, limit.saturating_sub(1)).await.map_err(store_err)?;
        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            out.push(serde_json::from_str(&entry)?);
        }
        Ok(out)
    }

    /// A coarse health rollup: the session manager only knows whether the
    /// store itself answers, not the health of poller/webhook/worker pool
    /// — those feed warnings in through the orchestrator.
    pub async fn health(&self, active_warnings: u32, critical_warnings: u32) -> HealthReport {
        let store_reachable = self.store.get("health:probe").await.is_ok();
        let status = if critical_warnings > 0 || !store_reachable {
            HealthStatus::Degraded
        } else if active_warnings > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        HealthReport { status, store_reachable, active_warnings, critical_warnings, issues: Vec::new() }
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
    fn state_round_trips_through_strings() {
        for state in [
            SessionState::Idle,
            SessionState::PollingActive,
            SessionState::WebhookActive,
            SessionState::BothActive,
            SessionState::Terminated,
            SessionState::FailedToStart,
            SessionState::SessionError,
        ] {
            assert_eq!(parse_state(state_str(state)), Some(state));
        }
    }

    #[test]
    fn polling_mode_round_trips() {
        for mode in [PollingMode::Manual, PollingMode::Scheduled, PollingMode::Fallback] {
            assert_eq!(parse_polling_mode(polling_mode_str(mode)), mode);
        }
    }
}
