//! Unit rebalancing for batch pools.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{ConfigError, MaintainerError, PoolError};
use crate::pool::{BatchImage, BatchPoolAssigner, MigrateOutcome};
use crate::store::KeyValueStore;

const MIGRATE_ATTEMPTS: usize = 3;

/// Result of [`PoolMaintainer::rebalance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Desired worker count per live unit.
    pub desired: Vec<(u32, u32)>,
    pub retired: Vec<u32>,
    pub migrated: usize,
}

/// Resizes a pool's set of units.
pub struct PoolMaintainer {
    store: Arc<dyn KeyValueStore>,
    assigner: BatchPoolAssigner,
}

impl PoolMaintainer {
    pub fn new(store: Arc<dyn KeyValueStore>, pool: impl Into<String>) -> Self {
        Self {
            assigner: BatchPoolAssigner::new(store.clone(), pool),
            store,
        }
    }

    /// Makes units `0..units` live and folds every higher unit into them.
    ///
    /// A retired unit leaves the sorted set before its batches move, so the
    /// allocator stops targeting it and its workers see their source become
    /// unavailable. Each batch goes to the least-loaded remaining unit.
    pub async fn rebalance(
        &self,
        units: u32,
        workers_per_unit: u32,
    ) -> Result<RebalanceReport, MaintainerError> {
        if units == 0 {
            return Err(ConfigError::InvalidValue {
                key: "units".to_string(),
                message: "a pool needs at least one unit".to_string(),
            }
            .into());
        }

        let pool = self.assigner.pool().to_string();
        for unit in 0..units {
            self.assigner.ensure_unit(unit).await?;
        }

        let mut retired = Vec::new();
        let mut migrated = 0;
        for (unit, _) in self.assigner.units().await? {
            if unit < units {
                continue;
            }
            self.assigner.retire_unit(unit).await?;
            migrated += self.drain_unit(unit).await?;
            retired.push(unit);
        }
        retired.sort_unstable();

        if !retired.is_empty() || migrated > 0 {
            info!(pool = %pool, units = units, retired = ?retired, migrated = migrated, "Pool rebalanced");
        }

        Ok(RebalanceReport {
            desired: (0..units).map(|unit| (unit, workers_per_unit)).collect(),
            retired,
            migrated,
        })
    }

    async fn drain_unit(&self, unit: u32) -> Result<usize, MaintainerError> {
        let key = self.assigner.unit_key(unit);
        let mut migrated = 0;

        // Oldest batch first.
        for batch_id in self.assigner.batch_ids(unit).await?.into_iter().rev() {
            let batch: BatchImage = match batch_id.parse() {
                Ok(batch) => batch,
                Err(e) => {
                    error!(unit_queue = %key, raw = %batch_id, error = %e, "Dropping invalid batch id");
                    self.store.lrem(&key, 0, &batch_id).await?;
                    continue;
                }
            };
            if self.migrate_batch(&batch, unit).await? {
                migrated += 1;
            }
        }

        if self.store.llen(&key).await? == 0 {
            self.store.del(&key).await?;
        } else {
            warn!(unit_queue = %key, "Retired unit still holds batches");
        }
        Ok(migrated)
    }

    async fn migrate_batch(&self, batch: &BatchImage, from: u32) -> Result<bool, MaintainerError> {
        let mut attempts = 0;
        loop {
            let target = self.assigner.resolve_target().await?;
            match self.assigner.migrate(batch, from, &target).await {
                Ok(MigrateOutcome::Migrated) => return Ok(true),
                Ok(MigrateOutcome::Absent) => return Ok(false),
                Err(PoolError::StaleTarget(_)) if attempts + 1 < MIGRATE_ATTEMPTS => attempts += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{keys, MemoryStore};

    async fn seeded_pool(units: u32, batches_per_unit: u32) -> (Arc<MemoryStore>, PoolMaintainer) {
        let store = Arc::new(MemoryStore::new());
        let maintainer = PoolMaintainer::new(store.clone(), "reports");
        maintainer.rebalance(units, 1).await.unwrap();
        for unit in 0..units {
            for i in 0..batches_per_unit {
                let batch = BatchImage::new(format!("s{unit}-{i}"), "Sync", "").unwrap();
                let target = crate::pool::UnitTarget {
                    unit,
                    key: keys::unit_queue("reports", unit),
                };
                maintainer.assigner.assign(&batch, &target).await.unwrap();
            }
        }
        (store, maintainer)
    }

    #[tokio::test]
    async fn test_grow_adds_units() {
        let store = Arc::new(MemoryStore::new());
        let maintainer = PoolMaintainer::new(store.clone(), "reports");
        let report = maintainer.rebalance(3, 2).await.unwrap();

        assert_eq!(report.desired, vec![(0, 2), (1, 2), (2, 2)]);
        assert!(report.retired.is_empty());
        assert_eq!(maintainer.assigner.units().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_shrink_migrates_batches_and_keeps_scores() {
        let (store, maintainer) = seeded_pool(3, 2).await;

        let report = maintainer.rebalance(1, 1).await.unwrap();
        assert_eq!(report.retired, vec![1, 2]);
        assert_eq!(report.migrated, 4);

        let units = maintainer.assigner.units().await.unwrap();
        assert_eq!(units, vec![(0, 6)]);
        assert_eq!(store.llen("pool:reports:0:queues").await.unwrap(), 6);
        assert_eq!(store.llen("pool:reports:1:queues").await.unwrap(), 0);
        assert_eq!(
            store.hget("pool:reports:sources", "s2-0").await.unwrap(),
            Some("0".to_string())
        );
    }

    #[tokio::test]
    async fn test_zero_units_rejected() {
        let store = Arc::new(MemoryStore::new());
        let maintainer = PoolMaintainer::new(store, "reports");
        assert!(matches!(
            maintainer.rebalance(0, 1).await,
            Err(MaintainerError::Config(_))
        ));
    }
}
