//! Outbound staging and forwarding (C10): the last hop in the pipeline.
//! The batch worker pool stages a serialized `BatchMetadataItem` per
//! processed message; this crate drains the staging list in batches and
//! POSTs them to the persistence API, independent of the worker pool's
//! own pace.

pub mod forwarder;
pub mod staging;

pub use forwarder::{ForwarderConfig, OutboundForwarder};
pub use staging::OutboundStaging;
