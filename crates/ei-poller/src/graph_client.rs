//! Microsoft-Graph-shaped HTTP client: unread-mail enumeration paginated
//! via `@odata.nextLink`, single-message fetch, and best-effort batch
//! read-marking.

use async_trait::async_trait;
use chrono::Utc;
use ei_common::provider::{MailProvider, UnreadPage};
use ei_common::{EmailMessage, IngestError, Result};
use ei_retry::parse_retry_after;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const PAGE_SIZE: u32 = 100;

fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response.headers().get("Retry-After").and_then(|v| v.to_str().ok()).and_then(parse_retry_after)
}

pub struct GraphMailProvider {
    http: reqwest::Client,
    base_url: String,
}

impl GraphMailProvider {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        Self { http, base_url }
    }
}

#[derive(Deserialize)]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: String,
    from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients", default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: chrono::DateTime<Utc>,
    #[serde(rename = "hasAttachments", default)]
    has_attachments: bool,
    #[serde(rename = "bodyPreview", default)]
    body_preview: String,
}

#[derive(Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
}

#[derive(Deserialize)]
struct GraphPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

fn recipient_address(recipient: &Option<GraphRecipient>) -> String {
    recipient
        .as_ref()
        .and_then(|r| r.email_address.as_ref())
        .and_then(|a| a.address.clone())
        .unwrap_or_default()
}

fn to_email_message(raw: GraphMessage) -> EmailMessage {
    let sender = recipient_address(&raw.from);
    let recipient = raw
        .to_recipients
        .first()
        .and_then(|r| r.email_address.as_ref())
        .and_then(|a| a.address.clone())
        .unwrap_or_default();
    let raw_message = json!({
        "id": raw.id,
        "subject": raw.subject,
        "hasAttachments": raw.has_attachments,
    });
    EmailMessage {
        id: raw.id,
        subject: raw.subject,
        sender,
        recipient,
        received_at: raw.received_date_time,
        has_attachments: raw.has_attachments,
        body_preview: raw.body_preview,
        raw_message,
    }
}

#[async_trait]
impl MailProvider for GraphMailProvider {
    async fn fetch_unread_page(&self, cursor: Option<&str>, access_token: &str) -> Result<UnreadPage> {
        let url = match cursor {
            Some(next_link) => next_link.to_string(),
            None => format!(
                "{}/me/mailFolders/inbox/messages?$filter=isRead eq false&$orderby=receivedDateTime desc&$top={}",
                self.base_url, PAGE_SIZE
            ),
        };

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("poll request failed: {e}") })?;

        let status = response.status();
        if status.as_u16() == 410 || status.as_u16() == 404 {
            return Ok(UnreadPage { messages: Vec::new(), next_cursor: None });
        }
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Provider {
                status: Some(status.as_u16()),
                retry_after,
                message: format!("poll returned {status}: {body}"),
            });
        }

        let page: GraphPage = response
            .json()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("malformed poll response: {e}") })?;

        Ok(UnreadPage {
            messages: page.value.into_iter().map(to_email_message).collect(),
            next_cursor: page.next_link,
        })
    }

    async fn fetch_message(&self, id: &str, access_token: &str) -> Result<EmailMessage> {
        let url = format!("{}/me/messages/{}", self.base_url, id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("fetch message failed: {e}") })?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_header(&response);
            return Err(IngestError::Provider { status: Some(status.as_u16()), retry_after, message: format!("fetch message returned {status}") });
        }

        let raw: GraphMessage = response
            .json()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("malformed message response: {e}") })?;
        Ok(to_email_message(raw))
    }

    async fn mark_read_batch(&self, ids: &[String], access_token: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let requests: Vec<_> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "method": "PATCH",
                    "url": format!("/me/messages/{id}"),
                    "body": { "isRead": true },
                    "headers": { "Content-Type": "application/json" },
                })
            })
            .collect();

        let response = self
            .http
            .post(format!("{}/$batch", self.base_url))
            .bearer_auth(access_token)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| IngestError::Provider { status: None, retry_after: None, message: format!("mark-read batch failed: {e}") })?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_header(&response);
            return Err(IngestError::Provider { status: Some(status.as_u16()), retry_after, message: format!("mark-read batch returned {status}") });
        }
        Ok(())
    }
}
