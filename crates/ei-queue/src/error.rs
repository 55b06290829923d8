use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ei_store::StoreError> for QueueError {
    fn from(e: ei_store::StoreError) -> Self {
        QueueError::Store(e.to_string())
    }
}
