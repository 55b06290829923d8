//! Webhook Receiver (C8): the push-notification half of dual-path
//! ingestion. Two endpoints — the provider's validation handshake and
//! the notification handler — plus a background subscription-renewal
//! loop.

pub mod handlers;
pub mod subscription;

pub use handlers::{FallbackFuture, WebhookState};
pub use subscription::{SubscriptionManager, SubscriptionRecord};

use axum::routing::{get, post};
use axum::Router;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub error_threshold: u32,
    pub rate_limit_threshold: u64,
    pub retry_policy: ei_retry::RetryPolicy,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { error_threshold: 5, rate_limit_threshold: 100, retry_policy: ei_retry::RetryPolicy::default() }
    }
}

/// Build the axum router for the notification endpoints. The caller owns
/// binding it to a listener — this crate never opens a socket itself, to
/// keep the composition root in full control of startup/shutdown order.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", get(handlers::validate).post(handlers::notify))
        .route("/health", get(handlers::health))
        .with_state(state)
}

pub fn new_error_counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = WebhookConfig::default();
        assert_eq!(config.error_threshold, 5);
    }
}
