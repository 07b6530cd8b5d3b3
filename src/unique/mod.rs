//! Unique-job coordination.
//!
//! Prevents two jobs sharing a unique id from executing at the same time
//! and coalesces superseding attempts into a single deferred payload.
//!
//! # State machine
//!
//! ```text
//!   absent --try_acquire--> queued --lock--> running --unlock--> absent
//!                                              |
//!                                  lock (other copy): deferred | discarded
//! ```
//!
//! The state is a single string `"<state>:<startTime>"` at
//! `unique:<id>:state`; the deferred payload lives at `unique:<id>:deferred`.
//! Every multi-key transition is one [`AtomicScript`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::UniqueError;
use crate::maintainer::ProcessRegistry;
use crate::store::{keys, now_epoch, unexpected_reply, AtomicScript, KeyValueStore};

/// Default age after which a running lock is checked for abandonment.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(3600);

/// Named state of a unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueStateName {
    Queued,
    Running,
}

impl UniqueStateName {
    pub fn as_str(self) -> &'static str {
        match self {
            UniqueStateName::Queued => "queued",
            UniqueStateName::Running => "running",
        }
    }
}

/// Stored state of a unique id with the time it was last set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniqueState {
    pub name: UniqueStateName,
    pub start_time: f64,
}

impl UniqueState {
    pub fn new(name: UniqueStateName, start_time: f64) -> Self {
        Self { name, start_time }
    }

    pub fn now(name: UniqueStateName) -> Self {
        Self::new(name, now_epoch())
    }

    /// Seconds since the state was set.
    pub fn age(&self, now: f64) -> f64 {
        (now - self.start_time).max(0.0)
    }
}

impl fmt::Display for UniqueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:.6}", self.name.as_str(), self.start_time)
    }
}

impl FromStr for UniqueState {
    type Err = UniqueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UniqueError::InvalidState(s.to_string());
        let (name, time) = s.split_once(':').ok_or_else(invalid)?;
        let name = match name {
            "queued" => UniqueStateName::Queued,
            "running" => UniqueStateName::Running,
            _ => return Err(invalid()),
        };
        let start_time = time.parse::<f64>().map_err(|_| invalid())?;
        Ok(Self { name, start_time })
    }
}

/// Result of [`UniqueCoordinator::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// State was absent; the payload moved to the destination.
    Acquired(String),
    /// A state already exists; the payload stays at the source.
    Exists,
    /// The source held no payload.
    Empty,
}

/// Coordinates unique ids through the shared store.
pub struct UniqueCoordinator {
    store: Arc<dyn KeyValueStore>,
    registry: ProcessRegistry,
    stale_after: Duration,
}

impl UniqueCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            registry: ProcessRegistry::new(store.clone()),
            store,
            stale_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Reads the current state of a unique id.
    pub async fn state(&self, uid: &str) -> Result<Option<UniqueState>, UniqueError> {
        if uid.is_empty() {
            return Ok(None);
        }
        match self.store.get(&keys::unique_state(uid)).await? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Marks `uid` as queued and moves one payload from `source` to
    /// `destination`, unless a state already exists.
    ///
    /// An empty id disables uniqueness: the payload is moved unconditionally.
    pub async fn try_acquire(
        &self,
        uid: &str,
        source: &str,
        destination: &str,
    ) -> Result<AcquireOutcome, UniqueError> {
        if uid.is_empty() {
            return Ok(match self.store.rpoplpush(source, destination).await? {
                Some(payload) => AcquireOutcome::Acquired(payload),
                None => AcquireOutcome::Empty,
            });
        }

        let script = AtomicScript::UniqueAcquire;
        let reply = self
            .store
            .eval(
                script,
                &[
                    keys::unique_state(uid),
                    source.to_string(),
                    destination.to_string(),
                ],
                &[UniqueState::now(UniqueStateName::Queued).to_string()],
            )
            .await?;

        match reply.as_slice() {
            [status, payload] if status == "acquired" => {
                debug!(unique_id = %uid, "Unique id acquired");
                Ok(AcquireOutcome::Acquired(payload.clone()))
            }
            [status] if status == "exists" => Ok(AcquireOutcome::Exists),
            [status] if status == "empty" => Ok(AcquireOutcome::Empty),
            _ => Err(unexpected_reply(script, &reply).into()),
        }
    }

    /// Takes the running lock for `uid` before executing `payload`.
    ///
    /// If another copy is running, `payload` is removed from `source` and
    /// either parked in the deferred slot (`UniqueError::Deferred`) or
    /// dropped (`UniqueError::Discarded`). The deferred slot is first-writer
    /// wins.
    pub async fn lock(
        &self,
        uid: &str,
        source: &str,
        payload: &str,
        deferrable: bool,
    ) -> Result<(), UniqueError> {
        if uid.is_empty() {
            return Err(UniqueError::EmptyId);
        }

        self.reclaim_stale(uid).await?;

        let script = AtomicScript::UniqueLock;
        let reply = self
            .store
            .eval(
                script,
                &[
                    keys::unique_state(uid),
                    keys::unique_deferred(uid),
                    source.to_string(),
                ],
                &[
                    UniqueState::now(UniqueStateName::Running).to_string(),
                    if deferrable { "1" } else { "0" }.to_string(),
                    payload.to_string(),
                ],
            )
            .await?;

        match reply.first().map(String::as_str) {
            Some("locked") => {
                debug!(unique_id = %uid, "Unique lock taken");
                Ok(())
            }
            Some("deferred") => {
                warn!(unique_id = %uid, "Job deferred behind running copy");
                Err(UniqueError::Deferred(uid.to_string()))
            }
            Some("discarded") => {
                warn!(unique_id = %uid, "Job discarded: copy already running");
                Err(UniqueError::Discarded(uid.to_string()))
            }
            _ => Err(unexpected_reply(script, &reply).into()),
        }
    }

    /// Releases the lock and returns the deferred payload, if any.
    pub async fn unlock(&self, uid: &str) -> Result<Option<String>, UniqueError> {
        if uid.is_empty() {
            return Err(UniqueError::EmptyId);
        }

        let script = AtomicScript::UniqueUnlock;
        let reply = self
            .store
            .eval(
                script,
                &[keys::unique_state(uid), keys::unique_deferred(uid)],
                &[],
            )
            .await?;

        match reply.as_slice() {
            [status] if status == "missing" => Err(UniqueError::MissingLock(uid.to_string())),
            [status] if status == "unlocked" => Ok(None),
            [status, payload] if status == "unlocked" => Ok(Some(payload.clone())),
            _ => Err(unexpected_reply(script, &reply).into()),
        }
    }

    /// Overwrites the state only if one exists. Returns whether it did.
    pub async fn edit_state(&self, uid: &str, name: UniqueStateName) -> Result<bool, UniqueError> {
        if uid.is_empty() {
            return Ok(false);
        }
        let state = UniqueState::now(name).to_string();
        Ok(self.store.set_xx(&keys::unique_state(uid), &state).await?)
    }

    /// Clears state and deferred slot.
    pub async fn remove_all(&self, uid: &str) -> Result<(), UniqueError> {
        if uid.is_empty() {
            return Ok(());
        }
        self.store.del(&keys::unique_state(uid)).await?;
        self.store.del(&keys::unique_deferred(uid)).await?;
        Ok(())
    }

    pub async fn remove_deferred_only(&self, uid: &str) -> Result<(), UniqueError> {
        if uid.is_empty() {
            return Ok(());
        }
        self.store.del(&keys::unique_deferred(uid)).await?;
        Ok(())
    }

    /// Clears a running lock older than the stale threshold when no live
    /// worker reports executing `uid`. Returns whether the lock was cleared.
    ///
    /// Not atomic with the following `lock`; a race costs at most one
    /// duplicate execution.
    pub async fn reclaim_stale(&self, uid: &str) -> Result<bool, UniqueError> {
        let state = match self.state(uid).await {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(false),
            Err(UniqueError::InvalidState(raw)) => {
                warn!(unique_id = %uid, state = %raw, "Clearing unreadable unique state");
                self.remove_all(uid).await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        if state.name != UniqueStateName::Running
            || state.age(now_epoch()) < self.stale_after.as_secs_f64()
        {
            return Ok(false);
        }

        if let Some(worker) = self.registry.find_executing(uid).await? {
            info!(
                unique_id = %uid,
                worker = %worker,
                age_secs = state.age(now_epoch()),
                "Long-running unique job still executing, keeping lock"
            );
            return Ok(false);
        }

        warn!(
            unique_id = %uid,
            age_secs = state.age(now_epoch()),
            "Reclaiming abandoned unique lock"
        );
        self.remove_all(uid).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn coordinator() -> (Arc<MemoryStore>, UniqueCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = UniqueCoordinator::new(store.clone());
        (store, coordinator)
    }

    #[test]
    fn test_state_string_format() {
        let state = UniqueState::new(UniqueStateName::Running, 1700000000.5);
        assert_eq!(state.to_string(), "running:1700000000.500000");
        assert_eq!(state.to_string().parse::<UniqueState>().unwrap(), state);
        assert!("idle:1".parse::<UniqueState>().is_err());
        assert!("running".parse::<UniqueState>().is_err());
    }

    #[tokio::test]
    async fn test_try_acquire_moves_payload_once() {
        let (store, coordinator) = coordinator();
        store.lpush("staging", "p1").await.unwrap();

        let outcome = coordinator.try_acquire("u1", "staging", "queue").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired("p1".to_string()));
        let state = coordinator.state("u1").await.unwrap().unwrap();
        assert_eq!(state.name, UniqueStateName::Queued);

        store.lpush("staging", "p2").await.unwrap();
        let outcome = coordinator.try_acquire("u1", "staging", "queue").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Exists);
        assert_eq!(store.lrange("staging", 0, -1).await.unwrap(), vec!["p2"]);
        assert_eq!(store.lrange("queue", 0, -1).await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_try_acquire_empty_source() {
        let (_store, coordinator) = coordinator();
        let outcome = coordinator.try_acquire("u1", "staging", "queue").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Empty);
        assert!(coordinator.state("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_exclusivity() {
        let (store, coordinator) = coordinator();
        store.lpush("buf1", "first").await.unwrap();
        coordinator.lock("u1", "buf1", "first", false).await.unwrap();

        store.lpush("buf2", "second").await.unwrap();
        let err = coordinator.lock("u1", "buf2", "second", false).await.unwrap_err();
        assert!(matches!(err, UniqueError::Discarded(_)));
        assert_eq!(store.llen("buf2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deferral_is_first_writer_wins() {
        let (store, coordinator) = coordinator();
        store.lpush("buf0", "running").await.unwrap();
        coordinator.lock("u1", "buf0", "running", true).await.unwrap();

        for i in 1..=3 {
            let source = format!("buf{i}");
            let payload = format!("attempt{i}");
            store.lpush(&source, &payload).await.unwrap();
            let err = coordinator.lock("u1", &source, &payload, true).await.unwrap_err();
            if i == 1 {
                assert!(matches!(err, UniqueError::Deferred(_)));
            } else {
                assert!(matches!(err, UniqueError::Discarded(_)));
            }
            assert_eq!(store.llen(&source).await.unwrap(), 0);
        }

        let deferred = coordinator.unlock("u1").await.unwrap();
        assert_eq!(deferred, Some("attempt1".to_string()));
        assert!(coordinator.state("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_missing() {
        let (_store, coordinator) = coordinator();
        let err = coordinator.unlock("u1").await.unwrap_err();
        assert!(matches!(err, UniqueError::MissingLock(_)));
    }

    #[tokio::test]
    async fn test_empty_id_rules() {
        let (_store, coordinator) = coordinator();
        assert!(matches!(
            coordinator.lock("", "buf", "p", false).await,
            Err(UniqueError::EmptyId)
        ));
        assert!(matches!(coordinator.unlock("").await, Err(UniqueError::EmptyId)));
        assert!(!coordinator
            .edit_state("", UniqueStateName::Running)
            .await
            .unwrap());
        coordinator.remove_all("").await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_state_only_when_present() {
        let (store, coordinator) = coordinator();
        assert!(!coordinator
            .edit_state("u1", UniqueStateName::Running)
            .await
            .unwrap());
        assert!(store.get("unique:u1:state").await.unwrap().is_none());

        store.set("unique:u1:state", "queued:1.0").await.unwrap();
        assert!(coordinator
            .edit_state("u1", UniqueStateName::Running)
            .await
            .unwrap());
        let state = coordinator.state("u1").await.unwrap().unwrap();
        assert_eq!(state.name, UniqueStateName::Running);
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let (store, coordinator) = coordinator();
        store.set("unique:u1:state", "running:1000.0").await.unwrap();
        store.set("unique:u1:deferred", "old").await.unwrap();
        store.lpush("buf", "fresh").await.unwrap();

        coordinator.lock("u1", "buf", "fresh", true).await.unwrap();

        let state = coordinator.state("u1").await.unwrap().unwrap();
        assert_eq!(state.name, UniqueStateName::Running);
        assert!(state.start_time > 1000.0);
        assert!(store.get("unique:u1:deferred").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_lock_kept_while_worker_executes() {
        let (store, coordinator) = coordinator();
        let registry = ProcessRegistry::new(store.clone());
        let image = crate::identity::WorkerImage::new("n1", "default", "w0", 12).unwrap();
        registry.register_worker(&image).await.unwrap();
        registry
            .mark_running(&image, "LongJob", Some("u1"))
            .await
            .unwrap();

        store.set("unique:u1:state", "running:1000.0").await.unwrap();
        store.lpush("buf", "copy").await.unwrap();

        let err = coordinator.lock("u1", "buf", "copy", false).await.unwrap_err();
        assert!(matches!(err, UniqueError::Discarded(_)));
    }

    #[tokio::test]
    async fn test_fresh_running_lock_is_not_reclaimed() {
        let (store, coordinator) = coordinator();
        let state = UniqueState::now(UniqueStateName::Running).to_string();
        store.set("unique:u1:state", &state).await.unwrap();
        assert!(!coordinator.reclaim_stale("u1").await.unwrap());
    }
}
