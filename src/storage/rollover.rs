//! Sealing and compression of partitions whose window has closed.

use crate::core::Result;
use crate::rollup::RollupFeed;
use crate::storage::partition::PartitionHandle;
use crate::storage::partition_manager::PartitionManager;
use crate::storage::types::StoreStats;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What one rollover cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloverReport {
    /// Partitions sealed this cycle
    pub sealed: usize,
    /// Partitions compressed this cycle (including retries)
    pub compressed: usize,
    /// Compression attempts that failed; those partitions stay sealed
    pub failed: usize,
    /// True if the cycle stopped early on cancellation
    pub cancelled: bool,
}

/// Seals closed windows and compresses their bodies.
pub struct RolloverJob {
    manager: Arc<PartitionManager>,
    feed: RollupFeed,
    stats: Arc<StoreStats>,
    grace: ChronoDuration,
}

impl RolloverJob {
    /// Create the job; `grace` is how long a closed window keeps accepting plain appends
    pub fn new(
        manager: Arc<PartitionManager>,
        feed: RollupFeed,
        stats: Arc<StoreStats>,
        grace: ChronoDuration,
    ) -> Self {
        Self {
            manager,
            feed,
            stats,
            grace,
        }
    }

    /// Seal every sealable partition, then compress sealed ones.
    pub fn run_cycle(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> RolloverReport {
        let mut report = RolloverReport::default();

        for partition in self.manager.sealable_partitions(now, self.grace) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            if partition.seal() {
                report.sealed += 1;
                self.stats.record_sealed(1);
                self.feed
                    .partition_sealed(partition.window_start(), partition.window_end());
                tracing::info!(
                    "Sealed partition {} ({} rows)",
                    partition.key(),
                    partition.row_count()
                );
            }
        }

        // Newly sealed partitions plus any left sealed by an earlier failure
        for partition in self.manager.uncompressed_sealed() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            match self.compress(&partition) {
                Ok(true) => report.compressed += 1,
                Ok(false) => {},
                Err(e) => {
                    report.failed += 1;
                    self.stats.record_compression_failure(1);
                    tracing::warn!(
                        "Failed to compress partition {} (will retry): {}",
                        partition.key(),
                        e
                    );
                },
            }
        }

        if report.sealed > 0 || report.compressed > 0 || report.failed > 0 {
            tracing::debug!(
                "Rollover cycle: {} sealed, {} compressed, {} failed",
                report.sealed,
                report.compressed,
                report.failed
            );
        }
        report
    }

    fn compress(&self, partition: &PartitionHandle) -> Result<bool> {
        let compressed = partition.compress(self.manager.blocks())?;
        if compressed {
            self.stats.record_compressed(1);
            tracing::info!("Compressed partition {}", partition.key());
        }
        Ok(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, Observation, RetentionPolicy, StoreError};
    use crate::rollup::{ContinuousAggregator, Granularity, RawSource};
    use crate::storage::blocks::BlockStore;
    use crate::storage::compression::{
        BlockCodec, CompressedBlock, CompressionEngine, CompressionLevel, CompressionStats,
    };
    use crate::storage::types::{Lifecycle, Row};
    use arc_swap::ArcSwap;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Codec that fails until switched on
    struct FlakyCodec {
        inner: CompressionEngine,
        healthy: AtomicBool,
    }

    impl BlockCodec for FlakyCodec {
        fn encode(&self, rows: &[Row], level: CompressionLevel) -> Result<CompressedBlock> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(StoreError::compression("injected failure"));
            }
            self.inner.encode(rows, level)
        }

        fn decode(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<Row>> {
            self.inner.decode(data, level)
        }

        fn stats(&self) -> CompressionStats {
            self.inner.stats()
        }
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_failed_compression_leaves_partition_sealed_and_readable() {
        let dir = TempDir::new().unwrap();
        let codec = Arc::new(FlakyCodec {
            inner: CompressionEngine::new(),
            healthy: AtomicBool::new(false),
        });
        let blocks = Arc::new(BlockStore::new(codec.clone(), dir.path(), 4));
        let clock = Arc::new(ManualClock::new(at(20, 0)));
        let manager = Arc::new(
            PartitionManager::new(
                std::time::Duration::from_secs(24 * 3600),
                Arc::new(ArcSwap::from_pointee(RetentionPolicy::default())),
                clock.clone(),
                blocks,
            )
            .unwrap(),
        );
        let aggregator = ContinuousAggregator::new(
            manager.clone() as Arc<dyn RawSource>,
            clock,
            64,
            vec![Granularity::Hour],
            64,
        );
        let stats = Arc::new(StoreStats::default());
        let job = RolloverJob::new(manager.clone(), aggregator.feed(), stats.clone(), ChronoDuration::hours(2));

        let partition = manager.partition_for(at(15, 10)).unwrap();
        let id = partition
            .append(
                Observation::builder()
                    .timestamp(at(15, 10))
                    .metric_id("RL.1.1")
                    .organization_id("42")
                    .value(1.0)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(job.run_cycle(at(16, 1), &cancel).sealed, 0);

        let report = job.run_cycle(at(16, 2), &cancel);
        assert_eq!(report.sealed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(partition.lifecycle(), Lifecycle::Sealed);
        assert!(partition.find(id, manager.blocks()).unwrap().is_some());
        assert_eq!(stats.snapshot().compression_failures, 1);

        codec.healthy.store(true, Ordering::SeqCst);
        let report = job.run_cycle(at(16, 3), &cancel);
        assert_eq!(report.sealed, 0);
        assert_eq!(report.compressed, 1);
        assert_eq!(partition.lifecycle(), Lifecycle::Compressed);
        assert_eq!(partition.find(id, manager.blocks()).unwrap().unwrap().value, 1.0);
    }

    #[test]
    fn test_cancelled_cycle_does_nothing() {
        let dir = TempDir::new().unwrap();
        let blocks = Arc::new(BlockStore::new(Arc::new(CompressionEngine::new()), dir.path(), 4));
        let clock = Arc::new(ManualClock::new(at(20, 0)));
        let manager = Arc::new(
            PartitionManager::new(
                std::time::Duration::from_secs(3600),
                Arc::new(ArcSwap::from_pointee(RetentionPolicy::default())),
                clock.clone(),
                blocks,
            )
            .unwrap(),
        );
        let aggregator = ContinuousAggregator::new(manager.clone() as Arc<dyn RawSource>, clock, 64, vec![], 64);
        let job = RolloverJob::new(manager.clone(), aggregator.feed(), Arc::new(StoreStats::default()), ChronoDuration::zero());
        manager.partition_for(at(15, 10)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = job.run_cycle(at(20, 0), &cancel);
        assert!(report.cancelled);
        assert_eq!(manager.tier_counts().open, 1);
    }
}
