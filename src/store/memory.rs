//! In-process store with Redis-equivalent semantics.
//!
//! All data sits behind one mutex, so every command and every
//! [`AtomicScript`] is trivially atomic. Blocking pops wait on a
//! [`Notify`] that is signalled after each write.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{AtomicScript, KeyValueStore, StoreResult};

#[derive(Debug, Default)]
struct Data {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Resolves a Redis-style inclusive index range against a length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl Data {
    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.lists.contains_key(key)
            || self.sets.contains_key(key)
            || self.zsets.contains_key(key)
            || self.hashes.contains_key(key)
    }

    fn del(&mut self, key: &str) -> bool {
        let mut existed = self.strings.remove(key).is_some();
        existed |= self.lists.remove(key).is_some();
        existed |= self.sets.remove(key).is_some();
        existed |= self.zsets.remove(key).is_some();
        existed |= self.hashes.remove(key).is_some();
        existed
    }

    fn lpush(&mut self, key: &str, value: &str) -> u64 {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.len() as u64
    }

    fn rpush(&mut self, key: &str, value: &str) -> u64 {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        list.len() as u64
    }

    fn pop(&mut self, key: &str, front: bool) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = if front {
            list.pop_front()
        } else {
            list.pop_back()
        };
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    fn rpoplpush(&mut self, source: &str, destination: &str) -> Option<String> {
        let value = self.pop(source, false)?;
        self.lpush(destination, &value);
        Some(value)
    }

    fn llen(&self, key: &str) -> u64 {
        self.lists.get(key).map(|l| l.len() as u64).unwrap_or(0)
    }

    fn lrange(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        let Some(list) = self.lists.get(key) else {
            return Vec::new();
        };
        match resolve_range(list.len(), start, stop) {
            Some((s, e)) => list.range(s..=e).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn lrem(&mut self, key: &str, count: isize, value: &str) -> u64 {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs()
        };
        let mut removed = 0usize;
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        if list.is_empty() {
            self.lists.remove(key);
        }
        removed as u64
    }

    fn lindex(&self, key: &str, index: isize) -> Option<String> {
        let list = self.lists.get(key)?;
        let idx = if index < 0 {
            list.len() as isize + index
        } else {
            index
        };
        if idx < 0 {
            return None;
        }
        list.get(idx as usize).cloned()
    }

    fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        self.zsets.get(key)?.get(member).copied()
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    fn zsorted(&self, key: &str) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        let Some(hash) = self.hashes.get_mut(key) else {
            return false;
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            self.hashes.remove(key);
        }
        removed
    }

    fn run_script(&mut self, script: AtomicScript, k: &[String], a: &[String]) -> Vec<String> {
        let reply = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match script {
            AtomicScript::UniqueAcquire => {
                if self.exists(&k[0]) {
                    return reply(&["exists"]);
                }
                match self.rpoplpush(&k[1], &k[2]) {
                    Some(payload) => {
                        self.strings.insert(k[0].clone(), a[0].clone());
                        vec!["acquired".to_string(), payload]
                    }
                    None => reply(&["empty"]),
                }
            }
            AtomicScript::UniqueLock => {
                let running = self
                    .strings
                    .get(&k[0])
                    .is_some_and(|s| s.starts_with("running:"));
                if running {
                    let popped = self.lrem(&k[2], -1, &a[2]) > 0;
                    if popped && a[1] == "1" && !self.exists(&k[1]) {
                        self.strings.insert(k[1].clone(), a[2].clone());
                        return reply(&["deferred"]);
                    }
                    return reply(&["discarded"]);
                }
                self.strings.insert(k[0].clone(), a[0].clone());
                reply(&["locked"])
            }
            AtomicScript::UniqueUnlock => {
                if !self.exists(&k[0]) {
                    return reply(&["missing"]);
                }
                let deferred = self.strings.get(&k[1]).cloned();
                self.del(&k[0]);
                self.del(&k[1]);
                match deferred {
                    Some(payload) => vec!["unlocked".to_string(), payload],
                    None => reply(&["unlocked"]),
                }
            }
            AtomicScript::BatchAppend => {
                self.lpush(&k[0], &a[0]);
                if self.sadd(&k[1], &a[1]) {
                    self.lpush(&k[2], &a[1]);
                    return reply(&["registered"]);
                }
                reply(&["appended"])
            }
            AtomicScript::BatchRegister => {
                if self.sadd(&k[0], &a[0]) {
                    self.lpush(&k[1], &a[0]);
                    return reply(&["registered"]);
                }
                reply(&["known"])
            }
            AtomicScript::BatchAssign => {
                let in_flight = self
                    .hashes
                    .get(&k[0])
                    .is_some_and(|h| h.contains_key(&a[0]));
                if in_flight {
                    self.lpush(&k[1], &a[1]);
                    return reply(&["backlogged"]);
                }
                if self.zscore(&k[3], &k[2]).is_none() {
                    return reply(&["stale"]);
                }
                self.hset(&k[0], &a[0], &a[2]);
                let len = self.lpush(&k[2], &a[1]);
                self.zadd(&k[3], &k[2], len as f64);
                reply(&["assigned"])
            }
            AtomicScript::BatchRemove => {
                if self.llen(&k[5]) > 0 {
                    return reply(&["pending"]);
                }
                if self.lrem(&k[0], 1, &a[0]) == 0 {
                    return reply(&["absent"]);
                }
                let len = self.llen(&k[0]);
                if self.zscore(&k[1], &k[0]).is_some() {
                    self.zadd(&k[1], &k[0], len as f64);
                }
                self.hdel(&k[2], &a[1]);
                self.srem(&k[6], &a[0]);
                match self.rpoplpush(&k[3], &k[4]) {
                    Some(next) => vec!["removed".to_string(), next],
                    None => reply(&["removed"]),
                }
            }
            AtomicScript::BatchMigrate => {
                if self.zscore(&k[2], &k[1]).is_none() {
                    return reply(&["stale"]);
                }
                if self.lrem(&k[0], 1, &a[0]) == 0 {
                    return reply(&["absent"]);
                }
                let len = self.lpush(&k[1], &a[0]);
                self.zadd(&k[2], &k[1], len as f64);
                if self.zscore(&k[2], &k[0]).is_some() {
                    let old_len = self.llen(&k[0]);
                    self.zadd(&k[2], &k[0], old_len as f64);
                }
                self.hset(&k[3], &a[1], &a[2]);
                reply(&["migrated"])
            }
            AtomicScript::BucketPush => {
                self.lpush(&k[0], &a[0]);
                let score = a[1].parse::<f64>().unwrap_or_default();
                self.zadd(&k[1], &a[1], score);
                reply(&["pushed"])
            }
            AtomicScript::BucketCleanup => {
                if self.llen(&k[0]) == 0 {
                    self.del(&k[0]);
                    self.zrem(&k[1], &a[0]);
                    return reply(&["cleaned"]);
                }
                reply(&["pending"])
            }
            AtomicScript::PlanStore => {
                self.strings.insert(k[0].clone(), a[1].clone());
                self.lrem(&k[1], 0, &a[0]);
                self.lpush(&k[1], &a[0]);
                let score = a[2].parse::<f64>().unwrap_or_default();
                self.zadd(&k[2], &a[2], score);
                self.sadd(&k[3], &a[0]);
                reply(&["stored"])
            }
            AtomicScript::PlanReschedule => {
                self.lrem(&k[0], 0, &a[0]);
                let gone = !self.strings.contains_key(&k[3]);
                if !gone {
                    self.lrem(&k[1], 0, &a[0]);
                    self.lpush(&k[1], &a[0]);
                    let score = a[1].parse::<f64>().unwrap_or_default();
                    self.zadd(&k[2], &a[1], score);
                    self.strings.insert(k[3].clone(), a[2].clone());
                }
                if self.llen(&k[0]) == 0 {
                    self.del(&k[0]);
                    self.zrem(&k[2], &a[3]);
                }
                if gone {
                    reply(&["gone"])
                } else {
                    reply(&["moved"])
                }
            }
            AtomicScript::PlanRemove => {
                self.del(&k[0]);
                self.lrem(&k[1], 0, &a[0]);
                self.srem(&k[3], &a[0]);
                if self.llen(&k[1]) == 0 {
                    self.del(&k[1]);
                    self.zrem(&k[2], &a[1]);
                }
                reply(&["removed"])
            }
        }
    }
}

/// Store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<Data>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a write under the lock and wakes blocked poppers.
    fn write<T>(&self, f: impl FnOnce(&mut Data) -> T) -> T {
        let out = {
            let mut guard = self.lock();
            f(&mut *guard)
        };
        self.pushed.notify_waiters();
        out
    }

    /// Retries `attempt` each time a write lands until it yields a value or
    /// `timeout` elapses.
    async fn blocking<T>(
        &self,
        timeout: Duration,
        mut attempt: impl FnMut(&mut Data) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.write(&mut attempt) {
                return Some(value);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Every key currently holding data, for test assertions.
    pub fn keys(&self) -> Vec<String> {
        let data = self.lock();
        let mut keys: Vec<String> = data
            .strings
            .keys()
            .chain(data.lists.keys())
            .chain(data.sets.keys())
            .chain(data.zsets.keys())
            .chain(data.hashes.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write(|d| {
            d.del(key);
            d.strings.insert(key.to_string(), value.to_string());
        });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> StoreResult<bool> {
        Ok(self.write(|d| {
            if d.exists(key) {
                return false;
            }
            d.strings.insert(key.to_string(), value.to_string());
            true
        }))
    }

    async fn set_xx(&self, key: &str, value: &str) -> StoreResult<bool> {
        Ok(self.write(|d| {
            if !d.exists(key) {
                return false;
            }
            d.del(key);
            d.strings.insert(key.to_string(), value.to_string());
            true
        }))
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl: Duration) -> StoreResult<()> {
        // Expiry is not modelled in memory.
        self.set(key, value).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        Ok(self.write(|d| d.del(key)))
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        Ok(self.write(|d| d.lpush(key, value)))
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        Ok(self.write(|d| d.rpush(key, value)))
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.write(|d| d.pop(key, true)))
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.write(|d| d.pop(key, false)))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        Ok(self.lock().lrange(key, start, stop))
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        Ok(self.lock().llen(key))
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> StoreResult<u64> {
        Ok(self.write(|d| d.lrem(key, count, value)))
    }

    async fn lindex(&self, key: &str, index: isize) -> StoreResult<Option<String>> {
        Ok(self.lock().lindex(key, index))
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        Ok(self.blocking(timeout, |d| d.pop(key, false)).await)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>> {
        Ok(self.write(|d| d.rpoplpush(source, destination)))
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .blocking(timeout, |d| d.rpoplpush(source, destination))
            .await)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.write(|d| d.sadd(key, member)))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.write(|d| d.srem(key, member)))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .is_some_and(|s| s.contains(member)))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.write(|d| d.zadd(key, member, score));
        Ok(())
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        Ok(self.write(|d| {
            let score = d.zscore(key, member).unwrap_or(0.0) + delta;
            d.zadd(key, member, score);
            score
        }))
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        Ok(self.lock().zscore(key, member))
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let sorted = self.lock().zsorted(key);
        Ok(match resolve_range(sorted.len(), start, stop) {
            Some((s, e)) => sorted[s..=e].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let sorted = self.lock().zsorted(key);
        Ok(sorted
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, _)| member)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.write(|d| d.zrem(key, member)))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.write(|d| d.hset(key, field, value));
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self.write(|d| d.hdel(key, field)))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        script.check_arity(keys, args)?;
        Ok(self.write(|d| d.run_script(script, keys, args)))
    }
}
