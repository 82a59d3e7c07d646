//! Maps timestamps to partitions and owns the partition map.

use crate::core::{
    Clock, ObservationId, OrganizationId, Result, RetentionPolicy, SeriesKey, StoreError,
};
use crate::rollup::{Aggregate, RawAggregate, RawSource};
use crate::storage::blocks::BlockStore;
use crate::storage::partition::{ordinal_of, Partition, PartitionHandle};
use crate::storage::types::{Lifecycle, Tier, TierCounts};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Owner of every live partition.
///
/// The map lock is only held for lookups and inserts; all row work happens
/// under the individual partition locks.
pub struct PartitionManager {
    window: ChronoDuration,
    partitions: RwLock<BTreeMap<DateTime<Utc>, PartitionHandle>>,
    /// End of the newest archived or purged window
    watermark: RwLock<Option<DateTime<Utc>>>,
    policy: Arc<ArcSwap<RetentionPolicy>>,
    clock: Arc<dyn Clock>,
    blocks: Arc<BlockStore>,
    archived: AtomicU64,
    purged: AtomicU64,
}

impl PartitionManager {
    /// Create a manager with a fixed window width
    pub fn new(
        window: std::time::Duration,
        policy: Arc<ArcSwap<RetentionPolicy>>,
        clock: Arc<dyn Clock>,
        blocks: Arc<BlockStore>,
    ) -> Result<Self> {
        let window = ChronoDuration::from_std(window)
            .map_err(|e| StoreError::config(format!("partition window out of range: {}", e)))?;
        if window < ChronoDuration::hours(1) || window.num_seconds() % 3600 != 0 {
            return Err(StoreError::config(format!(
                "partition window must be a whole number of hours, got {}s",
                window.num_seconds()
            )));
        }
        Ok(Self {
            window,
            partitions: RwLock::new(BTreeMap::new()),
            watermark: RwLock::new(None),
            policy,
            clock,
            blocks,
            archived: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        })
    }

    /// Partition width
    pub fn window(&self) -> ChronoDuration {
        self.window
    }

    /// Shared block store
    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    /// Epoch-aligned start of the window containing `ts`, with its ordinal
    fn locate(&self, ts: DateTime<Utc>) -> Result<(DateTime<Utc>, u32)> {
        let width = self.window.num_seconds();
        let index = ts.timestamp().div_euclid(width);
        let ordinal = u32::try_from(index).map_err(|_| StoreError::ExpiredWindow {
            timestamp: ts,
            retained_from: DateTime::<Utc>::UNIX_EPOCH,
        })?;
        let start = DateTime::from_timestamp(index * width, 0)
            .ok_or_else(|| StoreError::validation("timestamp", format!("{} is out of range", ts)))?;
        Ok((start, ordinal))
    }

    /// Start of the window containing `ts`
    pub fn window_start_for(&self, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.locate(ts).map(|(start, _)| start)
    }

    /// Oldest instant whose raw data is still retained, if anything was dropped
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.read()
    }

    /// Writes before this instant are rejected
    pub fn retained_from(&self) -> DateTime<Utc> {
        let horizon = self.clock.now() - self.policy.load().horizon();
        match self.watermark() {
            Some(watermark) if watermark > horizon => watermark,
            _ => horizon,
        }
    }

    fn check_retained(&self, ts: DateTime<Utc>, window_start: DateTime<Utc>) -> Result<()> {
        let window_end = window_start + self.window;
        let dropped = self.watermark().map_or(false, |w| window_start < w);
        let beyond_horizon = window_end <= self.clock.now() - self.policy.load().horizon();
        if dropped || beyond_horizon {
            return Err(StoreError::ExpiredWindow {
                timestamp: ts,
                retained_from: self.retained_from(),
            });
        }
        Ok(())
    }

    /// Partition whose window contains `timestamp`, created open and hot if absent.
    pub fn partition_for(&self, timestamp: DateTime<Utc>) -> Result<PartitionHandle> {
        let (window_start, ordinal) = self.locate(timestamp)?;
        self.check_retained(timestamp, window_start)?;

        if let Some(partition) = self.partitions.read().get(&window_start) {
            return Ok(Arc::clone(partition));
        }

        let mut partitions = self.partitions.write();
        let partition = partitions.entry(window_start).or_insert_with(|| {
            tracing::debug!("Creating partition for window starting {}", window_start);
            Arc::new(Partition::new(window_start, window_start + self.window, ordinal))
        });
        Ok(Arc::clone(partition))
    }

    /// Existing partition for a window start
    pub fn get(&self, window_start: DateTime<Utc>) -> Option<PartitionHandle> {
        self.partitions.read().get(&window_start).cloned()
    }

    /// Partitions overlapping `[from, to)`, in time order
    pub fn partitions_in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<PartitionHandle> {
        if from >= to {
            return Vec::new();
        }
        let first = match self.window_start_for(from) {
            Ok(start) => start,
            Err(_) => DateTime::<Utc>::UNIX_EPOCH,
        };
        self.partitions
            .read()
            .range(first..to)
            .map(|(_, p)| Arc::clone(p))
            .collect()
    }

    /// Every live partition, in time order
    pub fn all(&self) -> Vec<PartitionHandle> {
        self.partitions.read().values().cloned().collect()
    }

    /// Open partitions whose window plus grace has passed
    pub fn sealable_partitions(&self, now: DateTime<Utc>, grace: ChronoDuration) -> Vec<PartitionHandle> {
        self.partitions
            .read()
            .values()
            .filter(|p| p.lifecycle() == Lifecycle::Open && p.window_end() + grace <= now)
            .cloned()
            .collect()
    }

    /// Sealed partitions still holding a raw body
    pub fn uncompressed_sealed(&self) -> Vec<PartitionHandle> {
        self.partitions
            .read()
            .values()
            .filter(|p| p.lifecycle() == Lifecycle::Sealed)
            .cloned()
            .collect()
    }

    /// Remove a partition whose data was archived or purged and advance the watermark
    pub fn retire(&self, window_start: DateTime<Utc>, tier: Tier) -> Option<PartitionHandle> {
        let removed = self.partitions.write().remove(&window_start)?;
        let end = removed.window_end();
        {
            let mut watermark = self.watermark.write();
            if watermark.map_or(true, |w| end > w) {
                *watermark = Some(end);
            }
        }
        match tier {
            Tier::Archived => self.archived.fetch_add(1, Ordering::Relaxed),
            _ => self.purged.fetch_add(1, Ordering::Relaxed),
        };
        tracing::info!("Retired partition {} as {}", removed.key(), tier);
        Some(removed)
    }

    /// Partition holding an observation id
    pub fn lookup_id(&self, id: ObservationId) -> Option<PartitionHandle> {
        let width = self.window.num_seconds();
        let start = DateTime::from_timestamp(i64::from(ordinal_of(id)) * width, 0)?;
        self.get(start)
    }

    /// Live partitions per tier and lifecycle
    pub fn tier_counts(&self) -> TierCounts {
        let mut counts = TierCounts {
            archived: self.archived.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            ..TierCounts::default()
        };
        for partition in self.partitions.read().values() {
            match partition.tier() {
                Tier::Hot => counts.hot += 1,
                Tier::Warm => counts.warm += 1,
                Tier::Cold => counts.cold += 1,
                Tier::Archived | Tier::Purged => {},
            }
            match partition.lifecycle() {
                Lifecycle::Open => counts.open += 1,
                Lifecycle::Sealed => counts.sealed += 1,
                Lifecycle::Compressed => counts.compressed += 1,
            }
        }
        counts
    }

    /// Number of live partitions
    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    /// True when no partition exists
    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }
}

impl RawSource for PartitionManager {
    fn aggregate_raw(
        &self,
        series: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<RawAggregate> {
        if let Some(watermark) = self.watermark() {
            if from < watermark {
                return Err(StoreError::PartitionUnavailable(format!(
                    "raw rows before {} are no longer retained",
                    watermark
                )));
            }
        }

        let mut result = RawAggregate {
            aggregate: Aggregate::empty(),
            watermark: None,
            rows_scanned: 0,
        };
        let organization: &OrganizationId = &series.organization_id;
        for partition in self.partitions_in_range(from, to) {
            let outcome = partition.scan(&self.blocks, Some(organization), |row| {
                let obs = &row.observation;
                if obs.metric_id == series.metric_id && from <= obs.timestamp && obs.timestamp < to {
                    result.aggregate.fold(obs.value);
                }
                ControlFlow::Continue(())
            })?;
            result.rows_scanned += outcome.visited;
            result.watermark = result.watermark.max(outcome.last_id);
        }
        Ok(result)
    }
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("window", &self.window)
            .field("partitions", &self.len())
            .field("watermark", &self.watermark())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, Observation};
    use crate::storage::compression::CompressionEngine;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, clock: ManualClock) -> PartitionManager {
        let blocks = Arc::new(BlockStore::new(Arc::new(CompressionEngine::new()), dir.path(), 4));
        PartitionManager::new(
            std::time::Duration::from_secs(24 * 3600),
            Arc::new(ArcSwap::from_pointee(RetentionPolicy::default())),
            Arc::new(clock),
            blocks,
        )
        .unwrap()
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_partition_for_is_epoch_aligned_and_lazy() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManualClock::new(at(20, 0)));
        assert!(manager.is_empty());

        let a = manager.partition_for(at(15, 10)).unwrap();
        let b = manager.partition_for(at(15, 23)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.window_start(), at(15, 0));
        assert_eq!(a.window_end(), at(16, 0));

        manager.partition_for(at(14, 1)).unwrap();
        let starts: Vec<_> = manager.all().iter().map(|p| p.window_start()).collect();
        assert_eq!(starts, vec![at(14, 0), at(15, 0)]);
    }

    #[test]
    fn test_rejects_non_hour_window() {
        let dir = TempDir::new().unwrap();
        let blocks = Arc::new(BlockStore::new(Arc::new(CompressionEngine::new()), dir.path(), 4));
        let result = PartitionManager::new(
            std::time::Duration::from_secs(5400),
            Arc::new(ArcSwap::from_pointee(RetentionPolicy::default())),
            Arc::new(ManualClock::new(at(1, 0))),
            blocks,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_sealable_respects_grace() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManualClock::new(at(20, 0)));
        manager.partition_for(at(15, 10)).unwrap();

        let grace = ChronoDuration::hours(2);
        assert!(manager.sealable_partitions(at(16, 1), grace).is_empty());
        assert_eq!(manager.sealable_partitions(at(16, 2), grace).len(), 1);
    }

    #[test]
    fn test_retire_advances_watermark() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManualClock::new(at(20, 0)));
        manager.partition_for(at(15, 10)).unwrap();

        manager.retire(at(15, 0), Tier::Purged).unwrap();
        assert_eq!(manager.watermark(), Some(at(16, 0)));

        let err = manager.partition_for(at(15, 11)).unwrap_err();
        assert!(matches!(err, StoreError::ExpiredWindow { .. }));
        assert!(manager.partition_for(at(16, 0)).is_ok());
        assert_eq!(manager.tier_counts().purged, 1);
    }

    #[test]
    fn test_rejects_beyond_horizon() {
        let dir = TempDir::new().unwrap();
        let now = at(20, 0);
        let manager = manager(&dir, ManualClock::new(now));
        let ancient = now - ChronoDuration::days(8 * 365);

        let err = manager.partition_for(ancient).unwrap_err();
        match err {
            StoreError::ExpiredWindow { retained_from, .. } => assert!(retained_from > ancient),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_lookup_and_raw_aggregate() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManualClock::new(at(20, 0)));
        let partition = manager.partition_for(at(15, 10)).unwrap();

        let mut last = None;
        for (org, value) in [("42", 98.5), ("42", 97.0), ("7", 10.0), ("42", 99.1)] {
            let obs = Observation::builder()
                .timestamp(at(15, 10))
                .metric_id("RL.1.1")
                .organization_id(org)
                .value(value)
                .build()
                .unwrap();
            last = Some(partition.append(obs).unwrap());
        }

        let id = last.unwrap();
        assert!(Arc::ptr_eq(&manager.lookup_id(id).unwrap(), &partition));

        let series = SeriesKey::new(
            crate::core::MetricId::new("RL.1.1").unwrap(),
            OrganizationId::new("42").unwrap(),
        );
        let raw = manager.aggregate_raw(&series, at(15, 10), at(15, 11)).unwrap();
        assert_eq!(raw.aggregate.count, 3);
        assert_eq!(raw.aggregate.min, 97.0);
        assert_eq!(raw.watermark, Some(id));
    }
}
