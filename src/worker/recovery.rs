//! Buffer recovery for workers that died mid-job.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::identity::WorkerImage;
use crate::job::QueuedJob;
use crate::store::{keys, KeyValueStore};
use crate::unique::UniqueCoordinator;

/// Moves everything left in a dead worker's buffer to `orphaned_jobs`.
///
/// Each decodable entry has its unique id cleared so a resubmission is not
/// blocked by the dead worker's lock. Corrupt entries are kept raw. An
/// entry leaves the buffer only after its record is written, so a failed
/// run can be repeated without losing jobs. The runtime record is deleted.
/// Returns the number of entries recovered.
pub async fn recover_buffer(
    store: Arc<dyn KeyValueStore>,
    image: &WorkerImage,
) -> Result<usize, WorkerError> {
    let unique = UniqueCoordinator::new(store.clone());
    let buffer = image.buffer_key();
    let worker = image.to_string();
    let mut recovered = 0;

    while let Some(raw) = store.lindex(&buffer, -1).await? {
        let record = match QueuedJob::decode(&raw) {
            Ok(queued) => {
                if let Some(uid) = queued.job.unique_id() {
                    unique.remove_all(uid).await?;
                }
                warn!(
                    worker = %worker,
                    job_id = %queued.id,
                    class = %queued.job.class,
                    "Recovered job from dead worker"
                );
                json!({ "job": queued, "reason": "worker died", "worker": worker })
            }
            Err(e) => {
                error!(worker = %worker, raw = %raw, error = %e, "Recovered corrupt payload from dead worker");
                json!({ "raw": raw, "reason": "corrupt payload", "worker": worker })
            }
        };
        store.lpush(keys::ORPHANED_JOBS, &record.to_string()).await?;
        store.lrem(&buffer, -1, &raw).await?;
        recovered += 1;
    }

    store.del(&image.runtime_key()).await?;
    if recovered > 0 {
        info!(worker = %worker, recovered = recovered, "Worker buffer recovered");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, UniqueDescriptor};
    use crate::store::{FlakyStore, MemoryStore};

    #[tokio::test]
    async fn test_recovery_moves_buffer_and_clears_unique() {
        let store = Arc::new(MemoryStore::new());
        let image = WorkerImage::new("n1", "default", "w0", 7).unwrap();
        let queued = QueuedJob::new(Job::new("Sync").with_unique(UniqueDescriptor::new("u1")));
        store.lpush(&image.buffer_key(), &queued.encode().unwrap()).await.unwrap();
        store.lpush(&image.buffer_key(), "not json").await.unwrap();
        store.set("unique:u1:state", "running:1.0").await.unwrap();
        store.hset(&image.runtime_key(), "job", "Sync").await.unwrap();

        let recovered = recover_buffer(store.clone(), &image).await.unwrap();
        assert_eq!(recovered, 2);

        let orphans = store.lrange(keys::ORPHANED_JOBS, 0, -1).await.unwrap();
        assert_eq!(orphans.len(), 2);
        let corrupt: serde_json::Value = serde_json::from_str(&orphans[0]).unwrap();
        assert_eq!(corrupt["raw"], "not json");
        let orphan: serde_json::Value = serde_json::from_str(&orphans[1]).unwrap();
        assert_eq!(orphan["job"]["class"], "Sync");
        assert_eq!(orphan["worker"], image.to_string());

        assert!(store.get("unique:u1:state").await.unwrap().is_none());
        assert_eq!(store.llen(&image.buffer_key()).await.unwrap(), 0);
        assert!(store.hgetall(&image.runtime_key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_record_write_keeps_entry_buffered() {
        let memory = Arc::new(MemoryStore::new());
        let image = WorkerImage::new("n1", "default", "w0", 7).unwrap();
        let queued = QueuedJob::new(Job::new("Sync"));
        memory.lpush(&image.buffer_key(), &queued.encode().unwrap()).await.unwrap();

        let store = FlakyStore::new(memory.clone(), "lpush", 1);
        assert!(recover_buffer(store.clone(), &image).await.is_err());
        assert_eq!(memory.llen(&image.buffer_key()).await.unwrap(), 1);
        assert_eq!(memory.llen(keys::ORPHANED_JOBS).await.unwrap(), 0);

        assert_eq!(recover_buffer(store, &image).await.unwrap(), 1);
        assert_eq!(memory.llen(&image.buffer_key()).await.unwrap(), 0);
        assert_eq!(memory.llen(keys::ORPHANED_JOBS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_buffer_recovers_nothing() {
        let store = Arc::new(MemoryStore::new());
        let image = WorkerImage::new("n1", "default", "w0", 7).unwrap();
        assert_eq!(recover_buffer(store, &image).await.unwrap(), 0);
    }
}
