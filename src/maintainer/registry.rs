use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::StoreError;
use crate::identity::{ProcessIdentity, WorkerImage};
use crate::store::{keys, now_epoch, KeyValueStore};

const FIELD_STARTED_AT: &str = "started_at";
const FIELD_JOB: &str = "job";
const FIELD_UNIQUE_ID: &str = "unique_id";

/// What a worker reports it is executing.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeState {
    pub started_at: f64,
    pub job: String,
    pub unique_id: Option<String>,
}

impl RuntimeState {
    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let job = fields.get(FIELD_JOB)?.clone();
        let started_at = fields
            .get(FIELD_STARTED_AT)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        let unique_id = fields
            .get(FIELD_UNIQUE_ID)
            .filter(|uid| !uid.is_empty())
            .cloned();
        Some(Self {
            started_at,
            job,
            unique_id,
        })
    }
}

/// Live-process records kept in the store.
///
/// Each process kind has a set of its ids (`workers`, `allocators`,
/// `schedulers`); workers also keep a runtime hash while executing.
#[derive(Clone)]
pub struct ProcessRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl ProcessRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn register<I: ProcessIdentity>(&self, image: &I) -> Result<bool, StoreError> {
        self.store.sadd(I::REGISTRY, &image.to_string()).await
    }

    pub async fn unregister<I: ProcessIdentity>(&self, image: &I) -> Result<bool, StoreError> {
        self.store.srem(I::REGISTRY, &image.to_string()).await
    }

    pub async fn register_worker(&self, image: &WorkerImage) -> Result<bool, StoreError> {
        self.register(image).await
    }

    /// Removes the worker and its runtime record.
    pub async fn unregister_worker(&self, image: &WorkerImage) -> Result<bool, StoreError> {
        self.store.del(&image.runtime_key()).await?;
        self.unregister(image).await
    }

    /// Every registered process of kind `I`. Unparseable ids are dropped
    /// from the registry.
    pub async fn list<I: ProcessIdentity>(&self) -> Result<Vec<I>, StoreError> {
        let mut images = Vec::new();
        for raw in self.store.smembers(I::REGISTRY).await? {
            match raw.parse::<I>() {
                Ok(image) => images.push(image),
                Err(e) => {
                    warn!(registry = I::REGISTRY, id = %raw, error = %e, "Removing invalid process id");
                    self.store.srem(I::REGISTRY, &raw).await?;
                }
            }
        }
        Ok(images)
    }

    pub async fn mark_running(
        &self,
        image: &WorkerImage,
        job: &str,
        unique_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = image.runtime_key();
        self.store
            .hset(&key, FIELD_STARTED_AT, &format!("{:.6}", now_epoch()))
            .await?;
        self.store.hset(&key, FIELD_JOB, job).await?;
        match unique_id {
            Some(uid) => self.store.hset(&key, FIELD_UNIQUE_ID, uid).await?,
            None => {
                self.store.hdel(&key, FIELD_UNIQUE_ID).await?;
            }
        }
        Ok(())
    }

    pub async fn clear_running(&self, image: &WorkerImage) -> Result<(), StoreError> {
        self.store.del(&image.runtime_key()).await?;
        Ok(())
    }

    pub async fn runtime(&self, image: &WorkerImage) -> Result<Option<RuntimeState>, StoreError> {
        let fields = self.store.hgetall(&image.runtime_key()).await?;
        Ok(RuntimeState::from_fields(&fields))
    }

    /// The registered worker currently executing `uid`, if any.
    pub async fn find_executing(&self, uid: &str) -> Result<Option<WorkerImage>, StoreError> {
        for image in self.list::<WorkerImage>().await? {
            let running = self
                .store
                .hget(&image.runtime_key(), FIELD_UNIQUE_ID)
                .await?;
            if running.as_deref() == Some(uid) {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }
}
