//! Exponential backoff with full jitter, plus `Retry-After` parsing and
//! HTTP status classification shared by the poller, webhook receiver and
//! outbound forwarder whenever they call out over HTTP.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the (1-indexed) `attempt`-th retry: the deterministic
    /// exponential term plus a small additive jitter in `[0, 1)` seconds,
    /// so a struggling downstream always gets at least the unjittered
    /// delay to recover.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt as i32);
        let ceiling = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(ceiling + jitter)
    }
}

/// What an attempt closure reports back to the retry loop.
pub enum Attempt<T> {
    Success(T),
    /// Worth retrying; carries an optional server-dictated delay override
    /// (from a `Retry-After` header).
    Retryable(String, Option<Duration>),
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    Fatal,
}

/// Classify an HTTP status per the provider/persistence-API contract:
/// 429 and 5xx are transient, everything else in the 4xx range is a
/// permanent rejection not worth retrying.
pub fn classify_status(status: u16) -> RetryDecision {
    match status {
        429 => RetryDecision::Retryable,
        500..=599 => RetryDecision::Retryable,
        400..=499 => RetryDecision::Fatal,
        _ => RetryDecision::Retryable,
    }
}

/// Parse a `Retry-After` header value, which per RFC 9110 is either a
/// number of seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let target: DateTime<Utc> = DateTime::parse_from_rfc2822(value.trim()).ok()?.with_timezone(&Utc);
    let now = Utc::now();
    let delta = target.signed_duration_since(now);
    delta.to_std().ok()
}

/// Run `attempt` up to `policy.max_retries + 1` times, sleeping between
/// retries using the server-supplied delay if present, else the
/// policy's jittered exponential backoff. The closure is called with the
/// zero-indexed attempt number.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, String>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut last_error = String::from("no attempts made");
    for attempt_num in 0..=policy.max_retries {
        match attempt(attempt_num).await {
            Attempt::Success(value) => return Ok(value),
            Attempt::Fatal(msg) => return Err(msg),
            Attempt::Retryable(msg, retry_after) => {
                last_error = msg;
                metrics::counter!("ei.retry.attempts_total").increment(1);
                if attempt_num == policy.max_retries {
                    break;
                }
                let delay = retry_after.unwrap_or_else(|| policy.backoff_for(attempt_num + 1));
                warn!(attempt = attempt_num, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(format!("exhausted {} retries: {last_error}", policy.max_retries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_and_server_errors_as_retryable() {
        assert_eq!(classify_status(429), RetryDecision::Retryable);
        assert_eq!(classify_status(503), RetryDecision::Retryable);
        assert_eq!(classify_status(400), RetryDecision::Fatal);
        assert_eq!(classify_status(401), RetryDecision::Fatal);
    }

    #[test]
    fn parses_numeric_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_garbage_retry_after() {
        assert_eq!(parse_retry_after("not-a-date"), None);
    }

    #[test]
    fn backoff_stays_near_ceiling_plus_small_jitter() {
        let policy = RetryPolicy { max_backoff: Duration::from_secs(10), ..RetryPolicy::default() };
        for attempt in 0..10 {
            let delay = policy.backoff_for(attempt);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay < Duration::from_secs(11));
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy { initial_backoff: Duration::from_millis(1), max_backoff: Duration::from_millis(2), ..RetryPolicy::default() };
        let mut calls = 0;
        let result = retry_with_backoff(&policy, |attempt| {
            calls += 1;
            async move {
                if attempt < 2 {
                    Attempt::Retryable("not yet".to_string(), Some(Duration::from_millis(1)))
                } else {
                    Attempt::Success(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_short_circuits() {
        let policy = RetryPolicy::default();
        let result: Result<i32, String> = retry_with_backoff(&policy, |_| async { Attempt::Fatal("bad request".to_string()) }).await;
        assert_eq!(result, Err("bad request".to_string()));
    }
}
