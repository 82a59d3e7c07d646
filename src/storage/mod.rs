//! Partitioned observation storage.
//!
//! [`ObservationStore`] ties together the partition manager, the write path,
//! the continuous aggregator, the rollover and retention jobs and the query
//! engine. Background workers call the `run_*`/`drain_*` methods; everything
//! else is the public read/write surface.

pub mod archive;
pub mod blocks;
pub mod compression;
pub mod partition;
pub mod partition_manager;
pub mod retention;
pub mod rollover;
pub mod types;
pub mod write_path;

use crate::core::{
    Clock, Config, Observation, ObservationId, Result, RetentionPolicy, SeriesKey, SystemClock,
};
use crate::query::{QueryEngine, QueryRequest, QueryStream};
use crate::rollup::{ContinuousAggregator, DrainReport, Granularity, RawSource, Rollup};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Re-export commonly used types
pub use archive::{ArchiveIndex, ArchiveSink, DirectorySink};
pub use blocks::BlockStore;
pub use compression::{BlockCodec, CompressionEngine, CompressionLevel, CompressionStats};
pub use partition::{Partition, PartitionHandle};
pub use partition_manager::PartitionManager;
pub use retention::{plan_transition, RetentionManager, RetentionReport};
pub use rollover::{RolloverJob, RolloverReport};
pub use types::{Lifecycle, Row, StoreStats, StoreStatsSnapshot, StoreStatus, Tier, TierCounts};
pub use write_path::WritePath;

/// Builder for [`ObservationStore`] with injectable clock and codec.
pub struct ObservationStoreBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn BlockCodec>,
    archive_sink: Option<Arc<dyn ArchiveSink>>,
}

impl ObservationStoreBuilder {
    /// Use a different time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different block codec
    pub fn codec(mut self, codec: Arc<dyn BlockCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Archive expired partitions here instead of the policy's directory
    pub fn archive_sink(mut self, sink: Arc<dyn ArchiveSink>) -> Self {
        self.archive_sink = Some(sink);
        self
    }

    /// Validate the configuration and assemble the store
    pub fn build(self) -> Result<ObservationStore> {
        let config = self.config;
        config.validate()?;

        let stats = Arc::new(StoreStats::default());
        let policy = Arc::new(ArcSwap::from_pointee(config.retention.clone()));
        let blocks = Arc::new(BlockStore::new(
            self.codec,
            &config.storage.data_dir,
            config.storage.cold_cache_capacity,
        ));
        let manager = Arc::new(PartitionManager::new(
            config.storage.partition_window,
            Arc::clone(&policy),
            Arc::clone(&self.clock),
            blocks,
        )?);
        let aggregator = Arc::new(ContinuousAggregator::new(
            Arc::clone(&manager) as Arc<dyn RawSource>,
            Arc::clone(&self.clock),
            config.storage.aggregator_queue_capacity,
            config.aggregation.materialize.clone(),
            config.aggregation.max_events_per_drain,
        ));
        let grace = ChronoDuration::from_std(config.storage.seal_grace)
            .map_err(|e| crate::core::StoreError::config(format!("seal_grace out of range: {}", e)))?;

        tracing::info!(
            "Observation store ready: window {:?}, grace {:?}, data dir {:?}",
            config.storage.partition_window,
            config.storage.seal_grace,
            config.storage.data_dir
        );

        let mut retention = RetentionManager::new(Arc::clone(&manager), Arc::clone(&stats));
        if let Some(sink) = self.archive_sink {
            retention = retention.with_sink(sink);
        }

        Ok(ObservationStore {
            write_path: WritePath::new(Arc::clone(&manager), aggregator.feed(), Arc::clone(&stats)),
            rollover: RolloverJob::new(
                Arc::clone(&manager),
                aggregator.feed(),
                Arc::clone(&stats),
                grace,
            ),
            retention,
            query: QueryEngine::new(
                Arc::clone(&manager),
                Arc::clone(&aggregator),
                Arc::clone(&stats),
                config.query.clone(),
            ),
            config,
            clock: self.clock,
            policy,
            manager,
            aggregator,
            stats,
        })
    }
}

/// The observation store.
pub struct ObservationStore {
    config: Config,
    clock: Arc<dyn Clock>,
    policy: Arc<ArcSwap<RetentionPolicy>>,
    manager: Arc<PartitionManager>,
    aggregator: Arc<ContinuousAggregator>,
    write_path: WritePath,
    rollover: RolloverJob,
    retention: RetentionManager,
    query: QueryEngine,
    stats: Arc<StoreStats>,
}

impl ObservationStore {
    /// Store with the system clock and the default codec
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a store
    pub fn builder(config: Config) -> ObservationStoreBuilder {
        ObservationStoreBuilder {
            config,
            clock: Arc::new(SystemClock),
            codec: Arc::new(CompressionEngine::new()),
            archive_sink: None,
        }
    }

    /// Store one observation
    pub fn append(&self, observation: Observation) -> Result<ObservationId> {
        self.write_path.append(observation)
    }

    /// Store a batch; one result per input, in order
    pub fn append_batch(&self, observations: Vec<Observation>) -> Vec<Result<ObservationId>> {
        self.write_path.append_batch(observations)
    }

    /// Start a bucketed query
    pub fn query(&self, request: QueryRequest) -> Result<QueryStream> {
        self.query.query(request)
    }

    /// Start a cancellable bucketed query
    pub fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryStream> {
        self.query.query_with_cancel(request, cancel)
    }

    /// Point lookup
    pub fn get(&self, id: ObservationId) -> Result<Option<Observation>> {
        self.query.get(id)
    }

    /// Apply queued rollup events now
    pub fn drain_aggregator(&self) -> DrainReport {
        self.aggregator.drain()
    }

    /// Seal and compress closed windows as of the store clock
    pub fn run_rollover(&self, cancel: &CancellationToken) -> RolloverReport {
        self.rollover.run_cycle(self.clock.now(), cancel)
    }

    /// Apply the current retention policy as of the store clock
    pub fn run_retention(&self, cancel: &CancellationToken) -> RetentionReport {
        let policy = self.policy.load_full();
        self.retention.run_cycle(self.clock.now(), &policy, cancel)
    }

    /// Replace the retention policy; takes effect on the next cycle
    pub fn update_policy(&self, policy: RetentionPolicy) -> Result<()> {
        policy.validate()?;
        let current = self.policy.load();
        if **current != policy {
            tracing::info!(
                "Retention policy updated: hot {}d, warm {}d, cold {}d, archive {:?}",
                policy.hot_days,
                policy.warm_days,
                policy.cold_days,
                policy.archive_sink
            );
            self.policy.store(Arc::new(policy));
        }
        Ok(())
    }

    /// Current retention policy
    pub fn policy(&self) -> Arc<RetentionPolicy> {
        self.policy.load_full()
    }

    /// Build coarser rollups on demand
    pub fn materialize(
        &self,
        granularity: Granularity,
        series: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize> {
        self.aggregator.materialize(granularity, series, from, to)
    }

    /// Schedule recomputation of an hour bucket
    pub fn request_recompute(&self, series: &SeriesKey, hour_start: DateTime<Utc>) {
        self.aggregator.request_recompute(series, hour_start)
    }

    /// Stored rollups overlapping `[from, to)`
    pub fn rollups(
        &self,
        series: &SeriesKey,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Rollup> {
        self.aggregator.rollups(series, granularity, from, to)
    }

    /// Operator-visible status
    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            partitions: self.manager.tier_counts(),
            retained_from: Some(self.manager.retained_from()),
            aggregator: self.aggregator.status(),
            stats: self.stats.snapshot(),
            compression: self.manager.blocks().stats(),
        }
    }

    /// Configuration the store was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Store clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Partition manager
    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.manager
    }

    /// Continuous aggregator
    pub fn aggregator(&self) -> &Arc<ContinuousAggregator> {
        &self.aggregator
    }

    /// Store counters
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }
}
