//! HTTP surface: the validation handshake and the notification handler.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use ei_common::provider::MailProvider;
use ei_queue::EmailQueue;
use ei_ratelimit::RateLimitGovernor;
use ei_retry::{classify_status, retry_with_backoff, Attempt, RetryDecision};
use ei_session::SessionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::WebhookConfig;

const RATE_LIMIT_CHANNEL: &str = "graph_webhook_fetch";

#[derive(Clone)]
pub struct WebhookState {
    pub queue: Arc<EmailQueue>,
    pub session: Arc<SessionManager>,
    pub rate_limit: Arc<RateLimitGovernor>,
    pub tokens: Arc<ei_auth::TokenProvider>,
    pub provider: Arc<dyn MailProvider>,
    pub config: WebhookConfig,
    pub error_count: Arc<AtomicU32>,
    pub fallback: Arc<dyn Fn() -> FallbackFuture + Send + Sync>,
}

pub type FallbackFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

#[derive(Deserialize)]
pub struct ValidationQuery {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

pub async fn validate(Query(query): Query<ValidationQuery>) -> impl IntoResponse {
    match query.validation_token {
        Some(token) => (StatusCode::OK, token),
        None => (StatusCode::BAD_REQUEST, String::new()),
    }
}

pub async fn health(State(state): State<WebhookState>) -> impl IntoResponse {
    let errors = state.error_count.load(Ordering::SeqCst);
    let critical = if errors >= state.config.error_threshold { 1 } else { 0 };
    let report = state.session.health(0, critical).await;
    let status = if report.store_reachable { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

#[derive(Deserialize)]
pub struct ResourceData {
    id: String,
}

#[derive(Deserialize)]
pub struct Notification {
    #[serde(rename = "resourceData")]
    resource_data: ResourceData,
}

#[derive(Deserialize)]
pub struct NotificationBatch {
    value: Vec<Notification>,
}

#[derive(Serialize)]
pub struct NotificationResponse {
    enqueued: usize,
    skipped: usize,
}

pub async fn notify(State(state): State<WebhookState>, Json(batch): Json<NotificationBatch>) -> impl IntoResponse {
    let mut seen = HashSet::new();
    let mut enqueued = 0usize;
    let mut skipped = 0usize;
    let mut error_count = 0usize;
    let mut mark_read_ids = Vec::new();

    for notification in batch.value {
        let id = notification.resource_data.id;
        if !seen.insert(id.clone()) {
            skipped += 1;
            continue;
        }

        match process_one(&state, &id).await {
            Ok(true) => {
                enqueued += 1;
                mark_read_ids.push(id);
            }
            Ok(false) => skipped += 1,
            Err(e) => {
                warn!(id, error = %e, "notification processing failed");
                error_count += 1;
                let count = state.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= state.config.error_threshold {
                    warn!(count, "webhook error threshold exceeded, triggering fallback polling");
                    (state.fallback)().await;
                    state.error_count.store(0, Ordering::SeqCst);
                }
            }
        }
    }

    if !mark_read_ids.is_empty() {
        let state = state.clone();
        tokio::spawn(async move {
            if let Ok(access_token) = state.tokens.get_access_token().await {
                if let Err(e) = state.provider.mark_read_batch(&mark_read_ids, &access_token).await {
                    debug!(error = %e, "async mark-read after webhook enqueue failed");
                }
            }
        });
    }

    let response = NotificationResponse { enqueued, skipped };
    if error_count == 0 || enqueued > 0 {
        (StatusCode::ACCEPTED, Json(response))
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(response))
    }
}

async fn process_one(state: &WebhookState, id: &str) -> ei_common::Result<bool> {
    if state.queue.is_pending(id).await.map_err(|e| ei_common::IngestError::Queue(e.to_string()))? {
        return Ok(false);
    }
    if state.session.is_processed(id).await? {
        return Ok(false);
    }

    let allowed = state
        .rate_limit
        .wait_for_permit(RATE_LIMIT_CHANNEL, state.config.rate_limit_threshold, Duration::from_secs(60), Duration::from_secs(5))
        .await?;
    if !allowed {
        return Ok(false);
    }

    let access_token = state.tokens.get_access_token().await?;
    let provider = state.provider.clone();
    let id_owned = id.to_string();
    let message = retry_with_backoff(&state.config.retry_policy, move |_attempt| {
        let provider = provider.clone();
        let id = id_owned.clone();
        let access_token = access_token.clone();
        async move {
            match provider.fetch_message(&id, &access_token).await {
                Ok(message) => Attempt::Success(message),
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
    .map_err(|msg| ei_common::IngestError::Provider { status: None, retry_after: None, message: msg })?;
    let payload = serde_json::to_string(&message)?;

    let accepted = state.queue.enqueue(id, &payload, None).await.map_err(|e| ei_common::IngestError::Queue(e.to_string()))?;
    Ok(accepted.is_some())
}
