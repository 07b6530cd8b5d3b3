//! Redis-backed store.
//!
//! Single-key commands map one-to-one onto Redis commands. Each
//! [`AtomicScript`] is a Lua script loaded once and invoked via `EVALSHA`
//! (falling back to `EVAL` when the script cache was flushed).
//!
//! Blocking pops run on their own connection so that a parked
//! `BRPOPLPUSH` never stalls the commands of the same process. Processes
//! running several workers should give each worker its own `RedisStore`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use async_trait::async_trait;

use super::{AtomicScript, KeyValueStore, StoreResult};
use crate::error::StoreError;

const UNIQUE_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return {'exists'}
end
local payload = redis.call('RPOPLPUSH', KEYS[2], KEYS[3])
if not payload then
  return {'empty'}
end
redis.call('SET', KEYS[1], ARGV[1])
return {'acquired', payload}
"#;

const UNIQUE_LOCK: &str = r#"
local state = redis.call('GET', KEYS[1])
if state and string.sub(state, 1, 8) == 'running:' then
  local popped = redis.call('LREM', KEYS[3], -1, ARGV[3])
  if popped > 0 and ARGV[2] == '1' and redis.call('SETNX', KEYS[2], ARGV[3]) == 1 then
    return {'deferred'}
  end
  return {'discarded'}
end
redis.call('SET', KEYS[1], ARGV[1])
return {'locked'}
"#;

const UNIQUE_UNLOCK: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'missing'}
end
local deferred = redis.call('GET', KEYS[2])
redis.call('DEL', KEYS[1], KEYS[2])
if deferred then
  return {'unlocked', deferred}
end
return {'unlocked'}
"#;

const BATCH_APPEND: &str = r#"
redis.call('LPUSH', KEYS[1], ARGV[1])
if redis.call('SADD', KEYS[2], ARGV[2]) == 1 then
  redis.call('LPUSH', KEYS[3], ARGV[2])
  return {'registered'}
end
return {'appended'}
"#;

const BATCH_REGISTER: &str = r#"
if redis.call('SADD', KEYS[1], ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[1])
  return {'registered'}
end
return {'known'}
"#;

const BATCH_ASSIGN: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[2])
  return {'backlogged'}
end
if not redis.call('ZSCORE', KEYS[4], KEYS[3]) then
  return {'stale'}
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
local len = redis.call('LPUSH', KEYS[3], ARGV[2])
redis.call('ZADD', KEYS[4], len, KEYS[3])
return {'assigned'}
"#;

const BATCH_REMOVE: &str = r#"
if redis.call('LLEN', KEYS[6]) > 0 then
  return {'pending'}
end
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return {'absent'}
end
local len = redis.call('LLEN', KEYS[1])
if redis.call('ZSCORE', KEYS[2], KEYS[1]) then
  redis.call('ZADD', KEYS[2], len, KEYS[1])
end
redis.call('HDEL', KEYS[3], ARGV[2])
redis.call('SREM', KEYS[7], ARGV[1])
local nextBatch = redis.call('RPOPLPUSH', KEYS[4], KEYS[5])
if nextBatch then
  return {'removed', nextBatch}
end
return {'removed'}
"#;

const BATCH_MIGRATE: &str = r#"
if not redis.call('ZSCORE', KEYS[3], KEYS[2]) then
  return {'stale'}
end
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return {'absent'}
end
local len = redis.call('LPUSH', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], len, KEYS[2])
if redis.call('ZSCORE', KEYS[3], KEYS[1]) then
  redis.call('ZADD', KEYS[3], redis.call('LLEN', KEYS[1]), KEYS[1])
end
redis.call('HSET', KEYS[4], ARGV[2], ARGV[3])
return {'migrated'}
"#;

const BUCKET_PUSH: &str = r#"
redis.call('LPUSH', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[2])
return {'pushed'}
"#;

const BUCKET_CLEANUP: &str = r#"
if redis.call('LLEN', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[1])
  redis.call('ZREM', KEYS[2], ARGV[1])
  return {'cleaned'}
end
return {'pending'}
"#;

const PLAN_STORE: &str = r#"
redis.call('SET', KEYS[1], ARGV[2])
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('LPUSH', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[3])
redis.call('SADD', KEYS[4], ARGV[1])
return {'stored'}
"#;

const PLAN_RESCHEDULE: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
local gone = redis.call('EXISTS', KEYS[4]) == 0
if not gone then
  redis.call('LREM', KEYS[2], 0, ARGV[1])
  redis.call('LPUSH', KEYS[2], ARGV[1])
  redis.call('ZADD', KEYS[3], ARGV[2], ARGV[2])
  redis.call('SET', KEYS[4], ARGV[3])
end
if redis.call('LLEN', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[1])
  redis.call('ZREM', KEYS[3], ARGV[4])
end
if gone then
  return {'gone'}
end
return {'moved'}
"#;

const PLAN_REMOVE: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
if redis.call('LLEN', KEYS[2]) == 0 then
  redis.call('DEL', KEYS[2])
  redis.call('ZREM', KEYS[3], ARGV[2])
end
return {'removed'}
"#;

const ALL_SCRIPTS: [AtomicScript; 13] = [
    AtomicScript::UniqueAcquire,
    AtomicScript::UniqueLock,
    AtomicScript::UniqueUnlock,
    AtomicScript::BatchAppend,
    AtomicScript::BatchRegister,
    AtomicScript::BatchAssign,
    AtomicScript::BatchRemove,
    AtomicScript::BatchMigrate,
    AtomicScript::BucketPush,
    AtomicScript::BucketCleanup,
    AtomicScript::PlanStore,
    AtomicScript::PlanReschedule,
    AtomicScript::PlanRemove,
];

/// Lua source of a catalogued script.
pub fn lua_source(script: AtomicScript) -> &'static str {
    match script {
        AtomicScript::UniqueAcquire => UNIQUE_ACQUIRE,
        AtomicScript::UniqueLock => UNIQUE_LOCK,
        AtomicScript::UniqueUnlock => UNIQUE_UNLOCK,
        AtomicScript::BatchAppend => BATCH_APPEND,
        AtomicScript::BatchRegister => BATCH_REGISTER,
        AtomicScript::BatchAssign => BATCH_ASSIGN,
        AtomicScript::BatchRemove => BATCH_REMOVE,
        AtomicScript::BatchMigrate => BATCH_MIGRATE,
        AtomicScript::BucketPush => BUCKET_PUSH,
        AtomicScript::BucketCleanup => BUCKET_CLEANUP,
        AtomicScript::PlanStore => PLAN_STORE,
        AtomicScript::PlanReschedule => PLAN_RESCHEDULE,
        AtomicScript::PlanRemove => PLAN_REMOVE,
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

/// Blocking-command timeout in seconds. Zero would block forever.
fn block_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(0.01)
}

/// Store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    /// Connection for regular commands and scripts.
    redis: ConnectionManager,
    /// Connection reserved for blocking pops.
    blocking: ConnectionManager,
    scripts: Arc<HashMap<AtomicScript, Script>>,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if either connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let blocking = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let scripts = ALL_SCRIPTS
            .iter()
            .map(|s| (*s, Script::new(lua_source(*s))))
            .collect();

        debug!(url = %redis_url, "Connected to Redis store");

        Ok(Self {
            redis,
            blocking,
            scripts: Arc::new(scripts),
        })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut conn = self.redis.clone();
        Ok(cmd.query_async(&mut conn).await?)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn set_nx(&self, key: &str, value: &str) -> StoreResult<bool> {
        let reply: Option<String> = self
            .query(redis::cmd("SET").arg(key).arg(value).arg("NX"))
            .await?;
        Ok(reply.is_some())
    }

    async fn set_xx(&self, key: &str, value: &str) -> StoreResult<bool> {
        let reply: Option<String> = self
            .query(redis::cmd("SET").arg(key).arg(value).arg("XX"))
            .await?;
        Ok(reply.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.query(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1)),
        )
        .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("LPOP").arg(key)).await
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("RPOP").arg(key)).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LREM").arg(key).arg(count).arg(value))
            .await
    }

    async fn lindex(&self, key: &str, index: isize) -> StoreResult<Option<String>> {
        self.query(redis::cmd("LINDEX").arg(key).arg(index)).await
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let mut conn = self.blocking.clone();
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(block_secs(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("RPOPLPUSH").arg(source).arg(destination))
            .await
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.blocking.clone();
        let reply: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(block_secs(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let added: u64 = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.query(redis::cmd("SISMEMBER").arg(key).arg(member))
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let _: u64 = self
            .query(redis::cmd("ZADD").arg(key).arg(score_arg(score)).arg(member))
            .await?;
        Ok(())
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        self.query(redis::cmd("ZINCRBY").arg(key).arg(delta).arg(member))
            .await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.query(redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.query(
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        if let Some(count) = limit {
            cmd.arg("LIMIT").arg(0).arg(count);
        }
        self.query(&cmd).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("ZREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let _: u64 = self
            .query(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        script.check_arity(keys, args)?;
        let lua = self
            .scripts
            .get(&script)
            .ok_or_else(|| StoreError::InvalidScriptCall {
                script: script.name().to_string(),
                reason: "script not loaded".to_string(),
            })?;

        let mut invocation = lua.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.redis.clone();
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_arg_formats_infinities() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(42.0), "42");
    }

    #[test]
    fn test_every_script_has_source() {
        for script in ALL_SCRIPTS {
            assert!(lua_source(script).contains("return"));
        }
    }

    #[test]
    fn test_block_secs_never_zero() {
        assert!(block_secs(Duration::ZERO) > 0.0);
    }

    // Requires a running Redis server at REDIS_URL.
    #[tokio::test]
    #[ignore]
    async fn test_unique_acquire_against_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let store = RedisStore::connect(&url).await.unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let state = format!("test:{id}:state");
        let staging = format!("test:{id}:staging");
        let queue = format!("test:{id}:queue");

        store.lpush(&staging, "payload").await.unwrap();
        let reply = store
            .eval(
                AtomicScript::UniqueAcquire,
                &[state.clone(), staging.clone(), queue.clone()],
                &["queued:1".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(reply, vec!["acquired", "payload"]);

        store.del(&state).await.unwrap();
        store.del(&queue).await.unwrap();
    }
}
