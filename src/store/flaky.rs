//! Store wrapper that injects failures, for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{AtomicScript, KeyValueStore, MemoryStore, StoreResult};
use crate::error::StoreError;

/// Memory store that fails the first `times` calls of one operation.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing: &'static str,
    remaining: Mutex<u32>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, failing: &'static str, times: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing,
            remaining: Mutex::new(times),
        })
    }

    fn trip(&self, operation: &str) -> StoreResult<()> {
        let mut remaining = self.remaining.lock().unwrap();
        if operation == self.failing && *remaining > 0 {
            *remaining -= 1;
            return Err(StoreError::ConnectionFailed(format!("{operation} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.trip("get")?;
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.trip("set")?;
        self.inner.set(key, value).await
    }
    async fn set_nx(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.trip("set_nx")?;
        self.inner.set_nx(key, value).await
    }
    async fn set_xx(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.trip("set_xx")?;
        self.inner.set_xx(key, value).await
    }
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.trip("set_ex")?;
        self.inner.set_ex(key, value, ttl).await
    }
    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.trip("del")?;
        self.inner.del(key).await
    }
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.trip("lpush")?;
        self.inner.lpush(key, value).await
    }
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.trip("rpush")?;
        self.inner.rpush(key, value).await
    }
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.trip("lpop")?;
        self.inner.lpop(key).await
    }
    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.trip("rpop")?;
        self.inner.rpop(key).await
    }
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.trip("lrange")?;
        self.inner.lrange(key, start, stop).await
    }
    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.trip("llen")?;
        self.inner.llen(key).await
    }
    async fn lrem(&self, key: &str, count: isize, value: &str) -> StoreResult<u64> {
        self.trip("lrem")?;
        self.inner.lrem(key, count, value).await
    }
    async fn lindex(&self, key: &str, index: isize) -> StoreResult<Option<String>> {
        self.trip("lindex")?;
        self.inner.lindex(key, index).await
    }
    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        self.trip("brpop")?;
        self.inner.brpop(key, timeout).await
    }
    async fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>> {
        self.trip("rpoplpush")?;
        self.inner.rpoplpush(source, destination).await
    }
    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>> {
        self.trip("brpoplpush")?;
        self.inner.brpoplpush(source, destination, timeout).await
    }
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.trip("sadd")?;
        self.inner.sadd(key, member).await
    }
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.trip("srem")?;
        self.inner.srem(key, member).await
    }
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.trip("smembers")?;
        self.inner.smembers(key).await
    }
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.trip("sismember")?;
        self.inner.sismember(key, member).await
    }
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.trip("zadd")?;
        self.inner.zadd(key, member, score).await
    }
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        self.trip("zincrby")?;
        self.inner.zincrby(key, member, delta).await
    }
    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.trip("zscore")?;
        self.inner.zscore(key, member).await
    }
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.trip("zrange_with_scores")?;
        self.inner.zrange_with_scores(key, start, stop).await
    }
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.trip("zrangebyscore")?;
        self.inner.zrangebyscore(key, min, max, limit).await
    }
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.trip("zrem")?;
        self.inner.zrem(key, member).await
    }
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.trip("hset")?;
        self.inner.hset(key, field, value).await
    }
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.trip("hget")?;
        self.inner.hget(key, field).await
    }
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.trip("hdel")?;
        self.inner.hdel(key, field).await
    }
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.trip("hgetall")?;
        self.inner.hgetall(key).await
    }
    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        self.trip("eval")?;
        self.inner.eval(script, keys, args).await
    }
}
