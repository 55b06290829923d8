//! Batch Worker Pool (C9): fetches batches off the email queue, filters
//! and enriches each message, publishes to the message bus, and stages
//! the resulting metadata for the outbound forwarder.

pub mod attachment;
pub mod message_bus;
pub mod pool;
pub mod spam_filter;

pub use attachment::{AttachmentWriter, NoopAttachmentWriter};
pub use message_bus::{MessageBus, MessageBusConfig};
pub use pool::{BatchWorkerPool, WorkerPoolConfig};
pub use spam_filter::SpamFilter;
