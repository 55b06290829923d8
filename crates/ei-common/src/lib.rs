use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;
pub mod provider;

// ============================================================================
// Core Message Types
// ============================================================================

/// A single unread message as observed from the mail provider.
///
/// `raw_message` retains the provider's JSON verbatim so downstream
/// components never have to guess at fields the upstream API didn't
/// document; everything else is pulled out once, at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub received_at: DateTime<Utc>,
    pub has_attachments: bool,
    pub body_preview: String,
    pub raw_message: serde_json::Value,
}

/// Payload handed to the persistence API, built by the batch worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadataItem {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub received_date: DateTime<Utc>,
    pub has_attachments: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    pub status: ItemStatus,
}

/// Outcome recorded against a message as it moves through the worker pool
/// and outbound forwarder. Mirrors the small, explicit status vocabulary
/// the persistence API expects rather than a free-form string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Processed,
    Spam,
    Failed,
}

// ============================================================================
// Session Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    PollingActive,
    WebhookActive,
    BothActive,
    Terminated,
    FailedToStart,
    SessionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingMode {
    Manual,
    Scheduled,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCounters {
    pub processed: u64,
    pub pending: u64,
    pub failed: u64,
    pub polling_errors: u64,
    pub webhook_errors: u64,
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self {
            processed: 0,
            pending: 0,
            failed: 0,
            polling_errors: 0,
            webhook_errors: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub polling_interval: u64,
    pub webhook_enabled: bool,
    pub polling_mode: PollingMode,
    pub counters: SessionCounters,
    pub failure_reason: Option<String>,
    pub error_details: Option<String>,
}

// ============================================================================
// Warning / Health Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    Polling,
    Webhook,
    Queue,
    RateLimiting,
    StoreConnectivity,
    Forwarding,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Warning {
    pub fn new(category: WarningCategory, severity: WarningSeverity, message: String, source: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store_reachable: bool,
    pub active_warnings: u32,
    pub critical_warnings: u32,
    pub issues: Vec<String>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("store error: {0}")]
    Store(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("lock timeout acquiring {0}")]
    LockTimeout(String),

    #[error("provider API error: {message}")]
    Provider { status: Option<u16>, retry_after: Option<std::time::Duration>, message: String },

    #[error("token error: {0}")]
    Token(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("message bus error: {0}")]
    MessageBus(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// The HTTP status behind a `Provider` error, if the failure came from
    /// a response rather than a transport-level error.
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            IngestError::Provider { status, .. } => *status,
            _ => None,
        }
    }

    /// A server-dictated retry delay carried by a `Provider` error, if any.
    pub fn provider_retry_after(&self) -> Option<std::time::Duration> {
        match self {
            IngestError::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
