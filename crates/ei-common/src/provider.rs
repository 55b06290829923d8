//! The mail-provider boundary: a trait so the poller and webhook receiver
//! never talk to a concrete HTTP client directly, and tests can swap in
//! a fixture implementation.

use crate::{EmailMessage, Result};
use async_trait::async_trait;

/// One page of the unread-messages enumeration.
#[derive(Debug, Clone)]
pub struct UnreadPage {
    pub messages: Vec<EmailMessage>,
    /// Present iff the provider indicated more pages remain.
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Fetch one page of unread messages, ordered newest-first. `cursor`
    /// is an opaque continuation token from a prior page; `None` starts a
    /// fresh enumeration.
    async fn fetch_unread_page(&self, cursor: Option<&str>, access_token: &str) -> Result<UnreadPage>;

    /// Fetch a single message's full detail, used by the webhook receiver
    /// after a notification names an id with no payload yet.
    async fn fetch_message(&self, id: &str, access_token: &str) -> Result<EmailMessage>;

    /// Best-effort: mark messages read. Failure is logged by the caller,
    /// never fatal to the ingestion pipeline.
    async fn mark_read_batch(&self, ids: &[String], access_token: &str) -> Result<()>;
}
