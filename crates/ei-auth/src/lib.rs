//! Token Provider (C3): exchanges a long-lived refresh token for a
//! short-lived access token against the provider's OAuth endpoint,
//! caching the result in the shared store so every process (and every
//! caller within a process) sees the same token without racing each
//! other's refreshes.
//!
//! `reqwest` is an async HTTP client, so the token exchange is already a
//! suspension point rather than a blocking call — unlike the original
//! source's synchronous-client-on-a-thread split, there is no OS thread to
//! isolate it to. Single-flight is still required: concurrent callers
//! must not all fire a refresh at once, so a `tokio::sync::Mutex` guards
//! the refresh path itself.

use ei_common::{IngestError, Result};
use ei_store::Store;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ACCESS_TOKEN_KEY: &str = "auth:access_token";
const REFRESH_TOKEN_KEY: &str = "auth:refresh_token";
/// Refresh this many seconds before the token's reported expiry, so a
/// caller never hands out a token that expires mid-flight.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

pub struct TokenProvider {
    store: Arc<Store>,
    http: reqwest::Client,
    settings: OAuthSettings,
    refresh_lock: Mutex<()>,
}

impl TokenProvider {
    pub fn new(store: Arc<Store>, settings: OAuthSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            store,
            http,
            settings,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Seed the store with the bootstrap refresh token obtained once via
    /// the out-of-scope interactive consent flow. A no-op if a refresh
    /// token is already present — the interactive flow is a one-time
    /// bootstrap, not something re-run on every start.
    pub async fn bootstrap_refresh_token(&self, refresh_token: &str) -> Result<()> {
        if self.store.get(REFRESH_TOKEN_KEY).await.map_err(store_err)?.is_none() {
            self.store
                .set_ex(REFRESH_TOKEN_KEY, refresh_token, Duration::from_secs(365 * 24 * 3600))
                .await
                .map_err(store_err)?;
            info!("bootstrapped refresh token into shared store");
        }
        Ok(())
    }

    /// Return a valid access token, refreshing if absent or near expiry.
    pub async fn get_access_token(&self) -> Result<String> {
        if let Some(token) = self.store.get(ACCESS_TOKEN_KEY).await.map_err(store_err)? {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.store.get(ACCESS_TOKEN_KEY).await.map_err(store_err)? {
            debug!("access token refreshed by a concurrent caller");
            return Ok(token);
        }

        self.refresh().await
    }

    async fn refresh(&self) -> Result<String> {
        let refresh_token = self
            .store
            .get(REFRESH_TOKEN_KEY)
            .await
            .map_err(store_err)?
            .ok_or_else(|| IngestError::Token("no refresh token bootstrapped".to_string()))?;

        let params = [
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        let response = self
            .http
            .post(&self.settings.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| IngestError::Token(format!("token exchange request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Token(format!("token exchange returned {status}: {body}")));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Token(format!("malformed token response: {e}")))?;

        let ttl = Duration::from_secs(parsed.expires_in).saturating_sub(EXPIRY_SKEW).max(Duration::from_secs(1));
        self.store
            .set_ex(ACCESS_TOKEN_KEY, &parsed.access_token, ttl)
            .await
            .map_err(store_err)?;

        if let Some(new_refresh) = parsed.refresh_token {
            self.store
                .set_ex(REFRESH_TOKEN_KEY, &new_refresh, Duration::from_secs(365 * 24 * 3600))
                .await
                .map_err(store_err)?;
        }

        info!("refreshed access token");
        Ok(parsed.access_token)
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
    fn expiry_skew_clamps_to_at_least_one_second() {
        let ttl = Duration::from_secs(30).saturating_sub(EXPIRY_SKEW).max(Duration::from_secs(1));
        assert_eq!(ttl, Duration::from_secs(1));
    }

    #[test]
    fn expiry_skew_subtracts_normally() {
        let ttl = Duration::from_secs(3600).saturating_sub(EXPIRY_SKEW).max(Duration::from_secs(1));
        assert_eq!(ttl, Duration::from_secs(3540));
    }
}
