//! Validation and placement of incoming observations.

use crate::core::{Observation, ObservationId, Result, StoreError};
use crate::rollup::{Granularity, RollupFeed};
use crate::storage::partition_manager::PartitionManager;
use crate::storage::types::StoreStats;
use rayon::prelude::*;
use std::sync::Arc;

/// Accepts observations and publishes rollup events for them.
pub struct WritePath {
    manager: Arc<PartitionManager>,
    feed: RollupFeed,
    stats: Arc<StoreStats>,
}

impl WritePath {
    /// Create a write path over a partition manager
    pub fn new(manager: Arc<PartitionManager>, feed: RollupFeed, stats: Arc<StoreStats>) -> Self {
        Self {
            manager,
            feed,
            stats,
        }
    }

    /// Validate and store one observation.
    ///
    /// The row is readable as soon as this returns. Late writes into a sealed
    /// partition land in its correction segment and trigger a recomputation
    /// of their hour bucket.
    pub fn append(&self, observation: Observation) -> Result<ObservationId> {
        if let Err(e) = observation.validate() {
            self.stats.record_validation_rejection(1);
            tracing::debug!("Rejected observation: {}", e);
            return Err(e);
        }

        let partition = match self.manager.partition_for(observation.timestamp) {
            Ok(partition) => partition,
            Err(e) => {
                if matches!(e, StoreError::ExpiredWindow { .. }) {
                    self.stats.record_expired_rejection(1);
                    tracing::warn!("Rejected write to expired window: {}", e);
                }
                return Err(e);
            },
        };

        let series = observation.series();
        let hour_start = Granularity::Hour.bucket_start(observation.timestamp);
        let value = observation.value;
        let timestamp = observation.timestamp;

        let (id, late) = match partition.append_or_correct(observation) {
            Ok(appended) => appended,
            Err(StoreError::PartitionUnavailable(key)) => {
                self.stats.record_expired_rejection(1);
                tracing::warn!("Partition {} was retired during a write", key);
                return Err(StoreError::ExpiredWindow {
                    timestamp,
                    retained_from: self.manager.retained_from(),
                });
            },
            Err(e) => return Err(e),
        };

        self.stats.record_written(1);
        if late {
            self.stats.record_correction(1);
            tracing::debug!("Late write {:?} into sealed partition {}", id, partition.key());
            self.feed.correction(series, hour_start);
        } else {
            self.feed.fold(series, hour_start, id, value);
        }
        Ok(id)
    }

    /// Store a batch; exactly one result per input, in input order.
    ///
    /// Records are independent: a rejected record does not affect the others.
    pub fn append_batch(&self, observations: Vec<Observation>) -> Vec<Result<ObservationId>> {
        let total = observations.len();
        let results: Vec<Result<ObservationId>> = observations
            .into_par_iter()
            .map(|observation| self.append(observation))
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::info!("{}", StoreError::PartialBatchFailure { failed, total });
        }
        results
    }
}
