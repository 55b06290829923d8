//! Attachment persistence is an external collaborator the pool only
//! knows about through this trait. The default implementation is a
//! no-op so the pool works without one wired in; a real writer lives
//! outside this workspace and is injected by the composition root.

use async_trait::async_trait;
use ei_common::EmailMessage;

#[async_trait]
pub trait AttachmentWriter: Send + Sync {
    /// Persist attachments for `message`, returning a name/identifier to
    /// surface on the outbound payload when at least one was saved.
    async fn save(&self, message: &EmailMessage) -> Result<Option<String>, String>;
}

pub struct NoopAttachmentWriter;

#[async_trait]
impl AttachmentWriter for NoopAttachmentWriter {
    async fn save(&self, _message: &EmailMessage) -> Result<Option<String>, String> {
        Ok(None)
    }
}
