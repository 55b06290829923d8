//! FIFO list of serialized metadata payloads awaiting forwarding.

use ei_common::{IngestError, Result};
use ei_store::Store;
use std::sync::Arc;

const STAGING_KEY: &str = "ms4:outbound";

pub struct OutboundStaging {
    store: Arc<Store>,
}

impl OutboundStaging {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn push(&self, payload: &str) -> Result<()> {
        self.store.lpush(STAGING_KEY, payload).await.map_err(store_err)
    }

    pub async fn pop_batch(&self, n: usize) -> Result<Vec<String>> {
        self.store.rpop_n(STAGING_KEY, n).await.map_err(store_err)
    }

    pub async fn size(&self) -> Result<u64> {
        self.store.llen(STAGING_KEY).await.map_err(store_err)
    }
}

fn store_err(e: ei_store::StoreError) -> IngestError {
    match e {
        ei_store::StoreError::Connection(msg) => IngestError::StoreUnavailable(msg),
        other => IngestError::Store(other.to_string()),
    }
}
