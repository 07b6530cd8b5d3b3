//! Shared key-value store abstraction.
//!
//! Every piece of cross-process coordination state lives in one shared store
//! with Redis-equivalent semantics. This module defines:
//!
//! - [`KeyValueStore`]: the primitive command surface (strings, lists with
//!   blocking variants, sets, sorted sets, hashes)
//! - [`AtomicScript`]: the catalogue of multi-key operations that must run
//!   all-or-nothing on the store side
//! - [`RedisStore`]: the production implementation (Lua scripts via EVALSHA)
//! - [`MemoryStore`]: an in-process implementation with identical script
//!   semantics, used by tests and single-process embedding
//!
//! # Conventions
//!
//! Lists are FIFO with producers pushing on the left (`LPUSH`) and consumers
//! popping on the right (`RPOP`, `BRPOPLPUSH`). Script replies are always a
//! list of strings whose first element names the outcome.

#[cfg(test)]
mod flaky;
pub mod keys;
pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

#[cfg(test)]
pub(crate) use self::flaky::FlakyStore;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Multi-key operations executed atomically by the store.
///
/// Each variant documents its `KEYS` and `ARGV` layout; implementations
/// reject calls with the wrong key count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicScript {
    /// KEYS: state, source, destination. ARGV: queued state value.
    UniqueAcquire,
    /// KEYS: state, deferred, source. ARGV: running state value,
    /// deferrable flag (`"1"`/`"0"`), payload.
    UniqueLock,
    /// KEYS: state, deferred.
    UniqueUnlock,
    /// KEYS: batch list, batch registry, incoming. ARGV: payload, batch id.
    BatchAppend,
    /// KEYS: batch registry, incoming. ARGV: batch id.
    BatchRegister,
    /// KEYS: source hash, backlog, target unit, unit zset.
    /// ARGV: source id, batch id, unit id.
    BatchAssign,
    /// KEYS: unit queue, unit zset, source hash, backlog, committed,
    /// batch list, batch registry. ARGV: batch id, source id.
    BatchRemove,
    /// KEYS: old unit, new unit, unit zset, source hash.
    /// ARGV: batch id, source id, new unit id.
    BatchMigrate,
    /// KEYS: bucket, schedule zset. ARGV: value, timestamp.
    BucketPush,
    /// KEYS: bucket, schedule zset. ARGV: timestamp.
    BucketCleanup,
    /// KEYS: plan, bucket, schedule zset, plan index.
    /// ARGV: plan id, payload, timestamp.
    PlanStore,
    /// KEYS: old bucket, new bucket, schedule zset, plan.
    /// ARGV: plan id, new timestamp, payload, old timestamp.
    PlanReschedule,
    /// KEYS: plan, bucket, schedule zset, plan index. ARGV: plan id, timestamp.
    PlanRemove,
}

impl AtomicScript {
    /// Short name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            AtomicScript::UniqueAcquire => "unique_acquire",
            AtomicScript::UniqueLock => "unique_lock",
            AtomicScript::UniqueUnlock => "unique_unlock",
            AtomicScript::BatchAppend => "batch_append",
            AtomicScript::BatchRegister => "batch_register",
            AtomicScript::BatchAssign => "batch_assign",
            AtomicScript::BatchRemove => "batch_remove",
            AtomicScript::BatchMigrate => "batch_migrate",
            AtomicScript::BucketPush => "bucket_push",
            AtomicScript::BucketCleanup => "bucket_cleanup",
            AtomicScript::PlanStore => "plan_store",
            AtomicScript::PlanReschedule => "plan_reschedule",
            AtomicScript::PlanRemove => "plan_remove",
        }
    }

    /// Number of `KEYS` the script expects.
    pub fn key_count(self) -> usize {
        match self {
            AtomicScript::UniqueAcquire | AtomicScript::UniqueLock => 3,
            AtomicScript::UniqueUnlock => 2,
            AtomicScript::BatchAppend => 3,
            AtomicScript::BatchRegister => 2,
            AtomicScript::BatchAssign => 4,
            AtomicScript::BatchRemove => 7,
            AtomicScript::BatchMigrate => 4,
            AtomicScript::BucketPush | AtomicScript::BucketCleanup => 2,
            AtomicScript::PlanStore | AtomicScript::PlanReschedule | AtomicScript::PlanRemove => 4,
        }
    }

    /// Number of `ARGV` entries the script expects.
    pub fn arg_count(self) -> usize {
        match self {
            AtomicScript::UniqueAcquire => 1,
            AtomicScript::UniqueLock => 3,
            AtomicScript::UniqueUnlock => 0,
            AtomicScript::BatchAppend => 2,
            AtomicScript::BatchRegister => 1,
            AtomicScript::BatchAssign => 3,
            AtomicScript::BatchRemove => 2,
            AtomicScript::BatchMigrate => 3,
            AtomicScript::BucketPush => 2,
            AtomicScript::BucketCleanup => 1,
            AtomicScript::PlanStore => 3,
            AtomicScript::PlanReschedule => 4,
            AtomicScript::PlanRemove => 2,
        }
    }

    /// Checks key and argument counts before dispatch.
    pub fn check_arity(self, keys: &[String], args: &[String]) -> StoreResult<()> {
        if keys.len() != self.key_count() || args.len() != self.arg_count() {
            return Err(StoreError::InvalidScriptCall {
                script: self.name().to_string(),
                reason: format!(
                    "expected {} keys and {} args, got {} and {}",
                    self.key_count(),
                    self.arg_count(),
                    keys.len(),
                    args.len()
                ),
            });
        }
        Ok(())
    }
}

/// Abstract store with Redis-equivalent single-key commands and atomic
/// multi-key scripts.
///
/// Transport failures surface as [`StoreError`]; implementations never map
/// them to "no data".
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    // Strings

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// `SET NX`. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// `SET XX`. Returns whether the value was written.
    async fn set_xx(&self, key: &str, value: &str) -> StoreResult<bool>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Deletes a key of any type. Returns whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    // Lists

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn llen(&self, key: &str) -> StoreResult<u64>;

    /// `LREM` with Redis count semantics (positive from head, negative from
    /// tail, zero for all occurrences).
    async fn lrem(&self, key: &str, count: isize, value: &str) -> StoreResult<u64>;

    async fn lindex(&self, key: &str, index: isize) -> StoreResult<Option<String>>;

    /// Blocking right pop; `None` once `timeout` elapses.
    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>>;

    async fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>>;

    /// Blocking `RPOPLPUSH`; `None` once `timeout` elapses.
    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>>;

    // Sets

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    // Sorted sets

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64>;

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Members in rank order (score, then member) with their scores.
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Members with `min <= score <= max` in rank order, optionally limited.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    // Hashes

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    // Scripts

    /// Runs one of the catalogued scripts atomically.
    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>>;
}

/// Builds the `StoreError` returned when a script reply has an unknown shape.
pub(crate) fn unexpected_reply(script: AtomicScript, reply: &[String]) -> StoreError {
    StoreError::UnexpectedReply {
        operation: script.name().to_string(),
        reply: format!("{reply:?}"),
    }
}

/// Current time as fractional epoch seconds.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_arity_rejects_wrong_counts() {
        let keys = vec!["a".to_string(), "b".to_string()];
        let err = AtomicScript::UniqueAcquire
            .check_arity(&keys, &["x".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("unique_acquire"));

        assert!(AtomicScript::UniqueUnlock.check_arity(&keys, &[]).is_ok());
    }

    #[test]
    fn test_now_epoch_is_recent() {
        let now = now_epoch();
        assert!(now > 1_600_000_000.0);
    }
}
