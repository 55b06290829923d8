//! Webhook subscription lifecycle: create on start, renew in the
//! background when less than an hour remains, recreate if the provider
//! reports the subscription gone.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ei_auth::TokenProvider;
use ei_common::{IngestError, Result};
use ei_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SUBSCRIPTION_KEY: &str = "webhook:subscription";
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(300);

fn subscription_lifetime() -> ChronoDuration {
    ChronoDuration::days(3)
}

fn renewal_threshold() -> ChronoDuration {
    ChronoDuration::hours(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub notification_url: String,
    pub expires_at: DateTime<Utc>,
    pub client_state: String,
}

#[derive(Deserialize)]
struct GraphSubscriptionResponse {
    id: String,
    #[serde(rename = "expirationDateTime")]
    expiration_date_time: DateTime<Utc>,
}

pub struct SubscriptionManager {
    http: reqwest::Client,
    base_url: String,
    store: Arc<Store>,
    tokens: Arc<TokenProvider>,
    notification_url: String,
}

impl SubscriptionManager {
    pub fn new(base_url: String, store: Arc<Store>, tokens: Arc<TokenProvider>, notification_url: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, store, tokens, notification_url }
    }

    pub async fn start(&self) -> Result<SubscriptionRecord> {
        let record = self.create_subscription().await?;
        self.persist(&record).await?;
        Ok(record)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(record) = self.current().await? {
            let access_token = self.tokens.get_access_token().await?;
            let url = format!("{}/subscriptions/{}", self.base_url, record.subscription_id);
            if let Err(e) = self.http.delete(&url).bearer_auth(&access_token).send().await {
                warn!(error = %e, "failed to delete webhook subscription on stop");
            }
        }
        self.store.del(SUBSCRIPTION_KEY).await.map_err(store_err)?;
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<SubscriptionRecord>> {
        let raw = self.store.get(SUBSCRIPTION_KEY).await.map_err(store_err)?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    /// Background renewal task: wakes every five minutes, renews when
    /// less than an hour of subscription lifetime remains, and recreates
    /// the subscription entirely if the provider reports it gone (404).
    pub async fn run_renewal_loop(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_CHECK_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }

            if let Err(e) = self.renew_if_needed().await {
                error!(error = %e, "webhook subscription renewal failed");
            }
        }
    }

    async fn renew_if_needed(&self) -> Result<()> {
        let Some(record) = self.current().await? else {
            return Ok(());
        };
        if record.expires_at - Utc::now() > renewal_threshold() {
            return Ok(());
        }

        let access_token = self.tokens.get_access_token().await?;
        let url = format!("{}/subscriptions/{}", self.base_url, record.subscription_id);
        let new_expiry = Utc::now() + subscription_lifetime();
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&access_token)
            .json(&json!({ "expirationDateTime": new_expiry.to_rfc3339() }))
            .send()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("subscription renewal request failed: {e}") })?;

        if response.status().as_u16() == 404 {
            warn!("webhook subscription gone, recreating");
            let record = self.create_subscription().await?;
            self.persist(&record).await?;
            return Ok(());
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(IngestError::Provider { status: Some(status.as_u16()), retry_after: None, message: format!("subscription renewal returned {status}") });
        }

        info!(subscription_id = record.subscription_id, "renewed webhook subscription");
        let renewed = SubscriptionRecord { expires_at: new_expiry, ..record };
        self.persist(&renewed).await
    }

    async fn create_subscription(&self) -> Result<SubscriptionRecord> {
        let access_token = self.tokens.get_access_token().await?;
        let client_state = uuid::Uuid::new_v4().to_string();
        let expires_at = Utc::now() + subscription_lifetime();

        let response = self
            .http
            .post(format!("{}/subscriptions", self.base_url))
            .bearer_auth(&access_token)
            .json(&json!({
                "changeType": "created",
                "notificationUrl": self.notification_url,
                "resource": "me/mailFolders('inbox')/messages",
                "expirationDateTime": expires_at.to_rfc3339(),
                "clientState": client_state,
            }))
            .send()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("subscription create request failed: {e}") })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(IngestError::Provider { status: Some(status.as_u16()), retry_after: None, message: format!("subscription create returned {status}") });
        }

        let parsed: GraphSubscriptionResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("malformed subscription response: {e}") })?;

        Ok(SubscriptionRecord {
            subscription_id: parsed.id,
            notification_url: self.notification_url.clone(),
            expires_at: parsed.expiration_date_time,
            client_state,
        })
    }

    async fn persist(&self, record: &SubscriptionRecord) -> Result<()> {
        let serialized = serde_json::to_string(record)?;
        let ttl = (record.expires_at - Utc::now()).to_std().unwrap_or(Duration::from_secs(60));
        self.store.set_ex(SUBSCRIPTION_KEY, &serialized, ttl).await.map_err(store_err)?;
        Ok(())
    }
}

fn store_err(e: ei_store::StoreError) -> IngestError {
    match e {
        ei_store::StoreError::Connection(msg) => IngestError::StoreUnavailable(msg),
        other => IngestError::Store(other.to_string()),
    }
}
