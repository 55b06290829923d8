//! Distributed lock built on `SET NX EX` for acquisition and a
//! check-and-delete Lua script for release, the same compare-then-act
//! shape used for leader election elsewhere in this family of services:
//! the releasing caller must prove it still holds the lock (by token)
//! before the delete is allowed to run, so a lock that outlived its TTL
//! and was re-acquired by someone else is never yanked out from under
//! them.

use crate::error::{Result, StoreError};
use crate::Store;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Total time to keep retrying acquisition before giving up.
    pub acquire_timeout: Duration,
    /// Delay between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// A held lock. Dropping it does not release it — callers must `release`
/// explicitly (or let the TTL expire), since release is an async op.
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Store {
    /// Block (without occupying an OS thread) until the lock is acquired
    /// or `options.acquire_timeout` elapses.
    pub async fn acquire_lock(&self, name: &str, options: &LockOptions) -> Result<LockGuard> {
        let key = format!("lock:{name}");
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + options.acquire_timeout;

        loop {
            if self.setnx_ex(&key, &token, options.ttl).await? {
                return Ok(LockGuard { key, token });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(name.to_string()));
            }
            tokio::time::sleep(options.poll_interval).await;
        }
    }

    /// Release a lock previously returned by `acquire_lock`. A no-op
    /// (logged, not erroring) if the lock was already lost to expiry and
    /// re-acquired by another owner.
    pub async fn release_lock(&self, guard: LockGuard) -> Result<()> {
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("DEL", KEYS[1])
                return 1
            else
                return 0
            end
            "#,
        );
        let mut conn = self.conn();
        let released: i32 = script
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            warn!(key = %guard.key, "lock release no-op: already lost to expiry");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_sane() {
        let opts = LockOptions::default();
        assert!(opts.poll_interval < opts.acquire_timeout);
        assert!(opts.ttl >= opts.acquire_timeout);
    }
}
