//! Shared store: set / sorted-queue / hash / list / string+TTL primitives
//! over Redis, plus the two compound atomic operations everything else in
//! this workspace is built on — atomic dequeue-with-visibility-timeout and
//! distributed locking.
//!
//! Every Redis round trip that can fail with a connection error is a fatal
//! error for the caller: this crate never swallows a connection failure,
//! it surfaces it as `StoreError::Connection` and lets the caller decide
//! (per the original spec's failure semantics for C1).

pub mod error;
pub mod lock;

pub use error::{Result, StoreError};
pub use lock::{LockGuard, LockOptions};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

/// Handle to the shared store. Cheap to clone — it wraps a
/// `ConnectionManager`, which multiplexes over a single underlying
/// connection and reconnects transparently.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
}

impl Store {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // ------------------------------------------------------------------
    // Set
    // ------------------------------------------------------------------

    pub async fn contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.sismember(key, member).await?)
    }

    pub async fn add(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        Ok(conn.sadd(key, members).await?)
    }

    pub async fn card(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(conn.scard(key).await?)
    }

    pub async fn batch_contains(&self, key: &str, members: &[String]) -> Result<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for m in members {
            pipe.sismember(key, m);
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    // ------------------------------------------------------------------
    // Sorted queue
    // ------------------------------------------------------------------

    pub async fn push(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    pub async fn batch_push(&self, key: &str, items: &[(String, f64)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let pairs: Vec<(f64, &str)> = items.iter().map(|(m, s)| (*s, m.as_str())).collect();
        let _: () = conn.zadd_multiple(key, &pairs).await?;
        Ok(())
    }

    /// Atomically pop up to `n` lowest-score members, removing them from
    /// the set. Used directly by `remove`-free callers; the queue crate
    /// uses `atomic_dequeue` below for the visibility-timeout variant.
    pub async fn pop_min_n(&self, key: &str, n: u64) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let script = redis::Script::new(
            r#"
            local members = redis.call('ZRANGE', KEYS[1], 0, ARGV[1] - 1)
            if #members > 0 then
                redis.call('ZREM', KEYS[1], unpack(members))
            end
            return members
            "#,
        );
        let mut conn = self.conn();
        Ok(script.key(key).arg(n).invoke_async(&mut conn).await?)
    }

    pub async fn remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: u64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    pub async fn score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        Ok(conn.zscore(key, member).await?)
    }

    pub async fn range_by_score(&self, key: &str, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.zrangebyscore(key, f64::NEG_INFINITY, max).await?)
    }

    pub async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(conn.zcard(key).await?)
    }

    /// The crucial primitive (§4.1): atomically move up to `n` lowest-score
    /// members from `queue_key` into `inflight_key` with score
    /// `now + visibility_ttl`, in one server-side round trip. Never
    /// returns a partial move — whatever is returned has already landed in
    /// `inflight_key`.
    pub async fn atomic_dequeue(
        &self,
        queue_key: &str,
        inflight_key: &str,
        n: u64,
        visibility_ttl: Duration,
        now_unix: f64,
    ) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let script = redis::Script::new(
            r#"
            local members = redis.call('ZRANGE', KEYS[1], 0, ARGV[1] - 1)
            if #members == 0 then
                return members
            end
            redis.call('ZREM', KEYS[1], unpack(members))
            local deadline = tonumber(ARGV[2]) + tonumber(ARGV[3])
            for _, m in ipairs(members) do
                redis.call('ZADD', KEYS[2], deadline, m)
            end
            return members
            "#,
        );
        let mut conn = self.conn();
        Ok(script
            .key(queue_key)
            .key(inflight_key)
            .arg(n)
            .arg(now_unix)
            .arg(visibility_ttl.as_secs_f64())
            .invoke_async(&mut conn)
            .await?)
    }

    /// Atomically admit `member` into `queue_key` with `score` unless it is
    /// already present in `processed_key`, `queue_key`, or `inflight_key`.
    /// Returns whether the member was newly admitted — the dedup primitive
    /// every enqueue path is built on, so two concurrent callers racing on
    /// the same id never both win.
    pub async fn claim_new(
        &self,
        processed_key: &str,
        queue_key: &str,
        inflight_key: &str,
        member: &str,
        score: f64,
    ) -> Result<bool> {
        let script = redis::Script::new(
            r#"
            if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then return 0 end
            if redis.call('ZSCORE', KEYS[2], ARGV[1]) then return 0 end
            if redis.call('ZSCORE', KEYS[3], ARGV[1]) then return 0 end
            redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
            return 1
            "#,
        );
        let mut conn = self.conn();
        let admitted: i32 = script
            .key(processed_key)
            .key(queue_key)
            .key(inflight_key)
            .arg(member)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    /// Batch form of [`claim_new`](Self::claim_new) in one round trip.
    /// Returns which of `items` were newly admitted, in the same order.
    pub async fn claim_new_batch(
        &self,
        processed_key: &str,
        queue_key: &str,
        inflight_key: &str,
        items: &[(String, f64)],
    ) -> Result<Vec<bool>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let script = redis::Script::new(
            r#"
            local results = {}
            for i = 4, #KEYS do
                local member = KEYS[i]
                local score = ARGV[i - 3]
                if redis.call('SISMEMBER', KEYS[1], member) == 1
                    or redis.call('ZSCORE', KEYS[2], member)
                    or redis.call('ZSCORE', KEYS[3], member) then
                    table.insert(results, 0)
                else
                    redis.call('ZADD', KEYS[2], score, member)
                    table.insert(results, 1)
                end
            end
            return results
            "#,
        );
        let mut invocation = script.key(processed_key).key(queue_key).key(inflight_key);
        for (member, _) in items {
            invocation = invocation.key(member);
        }
        for (_, score) in items {
            invocation = invocation.arg(score);
        }
        let mut conn = self.conn();
        let raw: Vec<i32> = invocation.invoke_async(&mut conn).await?;
        Ok(raw.into_iter().map(|v| v == 1).collect())
    }

    // ------------------------------------------------------------------
    // Hash
    // ------------------------------------------------------------------

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    pub async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<std::collections::HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.hget(key, field).await?)
    }

    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.hincr(key, field, delta).await?)
    }

    /// Compare-and-set a hash field: set `field` to `new_value` only if
    /// its current value is one of `expected` (or the field is absent and
    /// `expected` contains an empty string, representing "not yet set").
    /// The guarded state-machine transition primitive every state machine
    /// in this workspace is built on.
    pub async fn hset_if_in(&self, key: &str, field: &str, expected: &[&str], new_value: &str) -> Result<bool> {
        let script = redis::Script::new(
            r#"
            local current = redis.call('HGET', KEYS[1], ARGV[1])
            if current == false then current = '' end
            for i = 3, #ARGV do
                if current == ARGV[i] then
                    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                    return 1
                end
            end
            return 0
            "#,
        );
        let mut invocation = script.key(key).arg(field).arg(new_value);
        for e in expected {
            invocation = invocation.arg(*e);
        }
        let mut conn = self.conn();
        let ok: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(ok == 1)
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // List
    // ------------------------------------------------------------------

    pub async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.rpop(key, None).await?)
    }

    pub async fn rpop_n(&self, key: &str, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        Ok(conn.rpop(key, std::num::NonZeroUsize::new(n)).await?)
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.lrange(key, start, stop).await?)
    }

    pub async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    pub async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(conn.llen(key).await?)
    }

    // ------------------------------------------------------------------
    // String with TTL
    // ------------------------------------------------------------------

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.incr(key, 1).await?)
    }

    /// `SET key value NX EX ttl` — true iff the key was absent and is now set.
    pub async fn setnx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }
}

pub type SharedStore = Arc<Store>;
