use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("lock acquisition timed out for {0}")]
    LockTimeout(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
