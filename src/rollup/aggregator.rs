//! Continuous aggregation of hour/day/week/month rollups.
//!
//! Producers publish [`RollupEvent`]s through a [`RollupFeed`]; the
//! [`ContinuousAggregator`] applies them in drains:
//!
//! 1. Events are grouped per hour bucket and applied in enqueue order, one
//!    writer per bucket, buckets in parallel.
//! 2. Coarse buckets containing a touched hour are updated, again one writer
//!    per bucket: plain folds are added, recomputed hours cause the coarse
//!    bucket to be re-derived from its hour rollups.
//!
//! A bucket stays *pending* from publish until the drain that applied it
//! finishes, and *dirty* from a dropped publish until it is recomputed.
//! Readers fall back to raw rows for either.

use crate::core::{Clock, ObservationId, Result, SeriesKey, StoreError};
use crate::rollup::granularity::Granularity;
use crate::rollup::types::{Aggregate, AggregatorStatus, Rollup, RollupEvent, RollupStatus};
use ahash::AHashMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Aggregate computed directly from raw rows
#[derive(Debug, Clone, Copy)]
pub struct RawAggregate {
    /// Values in the range
    pub aggregate: Aggregate,
    /// Highest id assigned in the scanned partitions at scan time
    pub watermark: Option<ObservationId>,
    /// Rows visited
    pub rows_scanned: usize,
}

/// Access to raw rows for recomputation
pub trait RawSource: Send + Sync {
    /// Aggregate the series' raw values in `[from, to)`.
    ///
    /// Fails when part of the range is no longer retained.
    fn aggregate_raw(
        &self,
        series: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<RawAggregate>;
}

type HourKey = (SeriesKey, DateTime<Utc>);

#[derive(Debug, Default)]
struct FeedShared {
    /// Published but not yet applied events per hour bucket
    pending: DashMap<HourKey, u64>,
    /// Buckets needing recomputation, tagged with the marking generation
    dirty: DashMap<HourKey, u64>,
    generation: AtomicU64,
    sealed_backlog: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    dropped: AtomicU64,
}

/// Producer handle; cheap to clone.
#[derive(Clone)]
pub struct RollupFeed {
    sender: Sender<RollupEvent>,
    shared: Arc<FeedShared>,
}

impl RollupFeed {
    /// Publish a fold for a freshly appended value. Never blocks.
    pub fn fold(&self, series: SeriesKey, hour_start: DateTime<Utc>, id: ObservationId, value: f64) {
        let key = (series.clone(), hour_start);
        self.publish_bucket_event(
            key,
            RollupEvent::Fold {
                series,
                hour_start,
                id,
                value,
            },
        );
    }

    /// Publish a correction for a late write into a sealed partition. Never blocks.
    pub fn correction(&self, series: SeriesKey, hour_start: DateTime<Utc>) {
        let key = (series.clone(), hour_start);
        self.publish_bucket_event(key, RollupEvent::Correction { series, hour_start });
    }

    /// Publish that a partition was sealed
    pub fn partition_sealed(&self, window_start: DateTime<Utc>, window_end: DateTime<Utc>) {
        let event = RollupEvent::PartitionSealed {
            window_start,
            window_end,
        };
        if self.sender.try_send(event).is_err() {
            self.shared
                .sealed_backlog
                .lock()
                .push((window_start, window_end));
        }
    }

    /// Flag an hour bucket for recomputation from raw on the next drain
    pub fn mark_dirty(&self, series: SeriesKey, hour_start: DateTime<Utc>) {
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.dirty.insert((series, hour_start), generation);
    }

    fn publish_bucket_event(&self, key: HourKey, event: RollupEvent) {
        // Counted before sending so the aggregator can never settle it first.
        *self.shared.pending.entry(key.clone()).or_insert(0) += 1;
        if let Err(e) = self.sender.try_send(event) {
            // Dirty before settling so the hour never looks settled in between.
            self.mark_dirty(key.0.clone(), key.1);
            self.settle(&key);
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) => {
                    tracing::debug!("Aggregator queue full, marking {}@{} dirty", key.0, key.1)
                },
                TrySendError::Disconnected(_) => {
                    tracing::warn!("Aggregator queue closed, marking {}@{} dirty", key.0, key.1)
                },
            }
        }
    }

    fn settle(&self, key: &HourKey) {
        if let Some(mut count) = self.shared.pending.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        self.shared.pending.remove_if(key, |_, count| *count == 0);
    }

    fn clear_dirty(&self, key: &HourKey, generation: u64) {
        self.shared.dirty.remove_if(key, |_, g| *g == generation);
    }

    /// Events waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum HourOp {
    Fold { id: ObservationId, value: f64 },
    Recompute,
}

#[derive(Debug)]
struct HourOutcome {
    key: HourKey,
    delta: Aggregate,
    recomputed: bool,
}

/// Rollups of one series, one ordered map per granularity
#[derive(Debug, Default)]
pub struct SeriesRollups {
    hour: RwLock<BTreeMap<DateTime<Utc>, Rollup>>,
    day: RwLock<BTreeMap<DateTime<Utc>, Rollup>>,
    week: RwLock<BTreeMap<DateTime<Utc>, Rollup>>,
    month: RwLock<BTreeMap<DateTime<Utc>, Rollup>>,
}

impl SeriesRollups {
    fn level(&self, granularity: Granularity) -> &RwLock<BTreeMap<DateTime<Utc>, Rollup>> {
        match granularity {
            Granularity::Hour => &self.hour,
            Granularity::Day => &self.day,
            Granularity::Week => &self.week,
            Granularity::Month => &self.month,
        }
    }
}

/// What one drain did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Events taken off the queue
    pub events: usize,
    /// Folds applied (excluding ones already covered by a recomputation)
    pub folds_applied: u64,
    /// Hour buckets recomputed from raw
    pub recomputed: u64,
    /// Recomputations that failed and left a stale rollup
    pub failed: u64,
    /// Coarse buckets written
    pub coarse_updated: u64,
}

/// Maintains rollups from the event queue.
pub struct ContinuousAggregator {
    receiver: Receiver<RollupEvent>,
    feed: RollupFeed,
    source: Arc<dyn RawSource>,
    clock: Arc<dyn Clock>,
    series: DashMap<SeriesKey, Arc<SeriesRollups>>,
    materialize: Vec<Granularity>,
    max_events_per_drain: usize,
    drain_lock: Mutex<()>,
    events_applied: AtomicU64,
    corrections: AtomicU64,
    recomputations: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_drain: Mutex<Option<DateTime<Utc>>>,
}

impl ContinuousAggregator {
    /// Create an aggregator reading raw rows from `source`
    pub fn new(
        source: Arc<dyn RawSource>,
        clock: Arc<dyn Clock>,
        queue_capacity: usize,
        materialize: Vec<Granularity>,
        max_events_per_drain: usize,
    ) -> Self {
        let (sender, receiver) = bounded(queue_capacity.max(1));
        Self {
            receiver,
            feed: RollupFeed {
                sender,
                shared: Arc::new(FeedShared::default()),
            },
            source,
            clock,
            series: DashMap::new(),
            materialize,
            max_events_per_drain: max_events_per_drain.max(1),
            drain_lock: Mutex::new(()),
            events_applied: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
            recomputations: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_drain: Mutex::new(None),
        }
    }

    /// Producer handle for the write path and the rollover job
    pub fn feed(&self) -> RollupFeed {
        self.feed.clone()
    }

    fn series_entry(&self, series: &SeriesKey) -> Arc<SeriesRollups> {
        if let Some(existing) = self.series.get(series) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.series.entry(series.clone()).or_default().value())
    }

    fn existing_series(&self, series: &SeriesKey) -> Option<Arc<SeriesRollups>> {
        self.series.get(series).map(|entry| Arc::clone(entry.value()))
    }

    /// Apply queued events and recompute dirty buckets.
    ///
    /// Only one drain runs at a time; concurrent callers wait.
    pub fn drain(&self) -> DrainReport {
        let _guard = self.drain_lock.lock();
        let mut report = DrainReport::default();

        let events: Vec<RollupEvent> = self
            .receiver
            .try_iter()
            .take(self.max_events_per_drain)
            .collect();
        report.events = events.len();

        let dirty: Vec<(HourKey, u64)> = self
            .feed
            .shared
            .dirty
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let mut sealed = std::mem::take(&mut *self.feed.shared.sealed_backlog.lock());

        let mut order: Vec<HourKey> = Vec::new();
        let mut groups: AHashMap<HourKey, Vec<HourOp>> = AHashMap::new();
        let mut settled: Vec<HourKey> = Vec::with_capacity(events.len());
        let mut push = |key: HourKey, op: HourOp| {
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(op);
        };

        for event in events {
            match event {
                RollupEvent::Fold {
                    series,
                    hour_start,
                    id,
                    value,
                } => {
                    settled.push((series.clone(), hour_start));
                    push((series, hour_start), HourOp::Fold { id, value });
                },
                RollupEvent::Correction { series, hour_start } => {
                    self.corrections.fetch_add(1, Ordering::Relaxed);
                    settled.push((series.clone(), hour_start));
                    push((series, hour_start), HourOp::Recompute);
                },
                RollupEvent::PartitionSealed {
                    window_start,
                    window_end,
                } => sealed.push((window_start, window_end)),
            }
        }
        for (key, _) in &dirty {
            push(key.clone(), HourOp::Recompute);
        }

        let work: Vec<(HourKey, Vec<HourOp>)> = order
            .into_iter()
            .filter_map(|key| groups.remove(&key).map(|ops| (key, ops)))
            .collect();

        // Phase 1: hour buckets
        let outcomes: Vec<(HourOutcome, u64, u64)> = work
            .into_par_iter()
            .map(|(key, ops)| self.apply_hour(key, ops))
            .collect();

        let mut hour_outcomes = Vec::with_capacity(outcomes.len());
        for (outcome, applied, failed) in outcomes {
            report.folds_applied += applied;
            report.failed += failed;
            if outcome.recomputed {
                report.recomputed += 1;
            }
            hour_outcomes.push(outcome);
        }

        // Phase 2: coarse buckets
        report.coarse_updated = self.update_coarse(&hour_outcomes);

        for (start, end) in sealed {
            self.close_window(start, end);
        }

        for key in &settled {
            self.feed.settle(key);
        }
        for (key, generation) in &dirty {
            self.feed.clear_dirty(key, *generation);
        }

        self.events_applied
            .fetch_add(report.folds_applied, Ordering::Relaxed);
        *self.last_drain.lock() = Some(self.clock.now());

        if report.events > 0 || report.recomputed > 0 {
            tracing::debug!(
                "Aggregator drain: {} events, {} folds, {} recomputed, {} failed, {} coarse",
                report.events,
                report.folds_applied,
                report.recomputed,
                report.failed,
                report.coarse_updated
            );
        }
        report
    }

    /// Single writer for one hour bucket. Returns (outcome, folds applied, failures).
    fn apply_hour(&self, key: HourKey, ops: Vec<HourOp>) -> (HourOutcome, u64, u64) {
        let rollups = self.series_entry(&key.0);
        let hour = key.1;
        let mut outcome = HourOutcome {
            key,
            delta: Aggregate::empty(),
            recomputed: false,
        };
        let mut applied = 0;
        let mut failed = 0;

        for op in ops {
            match op {
                HourOp::Fold { id, value } => {
                    let mut level = rollups.hour.write();
                    let rollup = level
                        .entry(hour)
                        .or_insert_with(|| Rollup::new(Granularity::Hour, hour));
                    if rollup.covers(id) {
                        continue;
                    }
                    rollup.aggregate.fold(value);
                    rollup.updated_at = self.clock.now();
                    outcome.delta.fold(value);
                    applied += 1;
                },
                HourOp::Recompute => {
                    outcome.recomputed = true;
                    if self.recompute_hour(&rollups, &outcome.key.0, hour).is_err() {
                        failed += 1;
                    }
                },
            }
        }

        (outcome, applied, failed)
    }

    /// Replace an hour rollup with a fresh aggregate over raw rows
    fn recompute_hour(
        &self,
        rollups: &SeriesRollups,
        series: &SeriesKey,
        hour: DateTime<Utc>,
    ) -> Result<()> {
        self.recomputations.fetch_add(1, Ordering::Relaxed);
        let end = Granularity::Hour.bucket_end(hour);
        match self.source.aggregate_raw(series, hour, end) {
            Ok(raw) => {
                let mut level = rollups.hour.write();
                let existing = level.contains_key(&hour);
                if !existing && raw.aggregate.is_empty() {
                    return Ok(());
                }
                let rollup = level
                    .entry(hour)
                    .or_insert_with(|| Rollup::new(Granularity::Hour, hour));
                rollup.aggregate = raw.aggregate;
                rollup.watermark = rollup.watermark.max(raw.watermark);
                rollup.status = RollupStatus::Fresh;
                rollup.updated_at = self.clock.now();
                Ok(())
            },
            Err(e) => {
                let reason = e.to_string();
                if let Some(rollup) = rollups.hour.write().get_mut(&hour) {
                    rollup.status = RollupStatus::Stale {
                        reason: reason.clone(),
                    };
                }
                tracing::warn!("Failed to recompute {} at {}: {}", series, hour, reason);
                *self.last_error.lock() = Some(format!("{}@{}: {}", series, hour, reason));
                Err(StoreError::StaleRollup {
                    metric_id: series.metric_id.to_string(),
                    organization_id: series.organization_id.to_string(),
                    bucket_start: hour,
                    reason,
                })
            },
        }
    }

    fn maintains(&self, rollups: &SeriesRollups, granularity: Granularity, bucket: DateTime<Utc>) -> bool {
        self.materialize.contains(&granularity)
            || rollups.level(granularity).read().contains_key(&bucket)
    }

    /// Phase 2; returns the number of coarse buckets written
    fn update_coarse(&self, outcomes: &[HourOutcome]) -> u64 {
        #[derive(Default)]
        struct CoarseWork {
            delta: Aggregate,
            rederive: bool,
        }

        let mut work: AHashMap<(SeriesKey, Granularity, DateTime<Utc>), CoarseWork> = AHashMap::new();
        for outcome in outcomes {
            if outcome.delta.is_empty() && !outcome.recomputed {
                continue;
            }
            for granularity in Granularity::COARSE {
                let bucket = granularity.bucket_start(outcome.key.1);
                let entry = work
                    .entry((outcome.key.0.clone(), granularity, bucket))
                    .or_default();
                entry.delta.merge(&outcome.delta);
                entry.rederive |= outcome.recomputed;
            }
        }

        let work: Vec<_> = work.into_iter().collect();
        work.into_par_iter()
            .map(|((series, granularity, bucket), item)| {
                let rollups = self.series_entry(&series);
                if !self.maintains(&rollups, granularity, bucket) {
                    return 0;
                }
                if item.rederive {
                    self.rederive(&rollups, granularity, bucket);
                } else {
                    let mut level = rollups.level(granularity).write();
                    let rollup = level
                        .entry(bucket)
                        .or_insert_with(|| Rollup::new(granularity, bucket));
                    rollup.aggregate.merge(&item.delta);
                    rollup.updated_at = self.clock.now();
                }
                1
            })
            .sum()
    }

    /// Rebuild a coarse bucket by merging its hour rollups
    fn rederive(&self, rollups: &SeriesRollups, granularity: Granularity, bucket: DateTime<Utc>) -> bool {
        let end = granularity.bucket_end(bucket);
        let mut merged = Aggregate::empty();
        let mut stale_reason = None;
        let mut all_closed = true;
        let mut any = false;
        {
            let hours = rollups.hour.read();
            for rollup in hours.range(bucket..end).map(|(_, r)| r) {
                any = true;
                merged.merge(&rollup.aggregate);
                all_closed &= rollup.closed;
                if let RollupStatus::Stale { reason } = &rollup.status {
                    stale_reason.get_or_insert_with(|| reason.clone());
                }
            }
        }

        let mut level = rollups.level(granularity).write();
        if !any && !level.contains_key(&bucket) {
            return false;
        }
        let rollup = level
            .entry(bucket)
            .or_insert_with(|| Rollup::new(granularity, bucket));
        rollup.aggregate = merged;
        rollup.status = match stale_reason {
            Some(reason) => RollupStatus::Stale { reason },
            None => RollupStatus::Fresh,
        };
        rollup.closed = rollup.closed || (any && all_closed);
        rollup.updated_at = self.clock.now();
        true
    }

    /// Mark rollups inside a sealed window closed
    fn close_window(&self, window_start: DateTime<Utc>, window_end: DateTime<Utc>) {
        for entry in self.series.iter() {
            let rollups = entry.value();
            for rollup in rollups.hour.write().range_mut(window_start..window_end) {
                rollup.1.closed = true;
            }
            for granularity in Granularity::COARSE {
                let first = granularity.bucket_start(window_start);
                for (_, rollup) in rollups.level(granularity).write().range_mut(first..window_end) {
                    if rollup.bucket_end() <= window_end {
                        rollup.closed = true;
                    }
                }
            }
        }
        tracing::debug!("Closed rollups for window {} - {}", window_start, window_end);
    }

    /// Build rollups of `granularity` for every bucket overlapping `[from, to)`.
    ///
    /// Hour buckets are recomputed from raw rows; coarser buckets are merged
    /// from hour rollups. Returns the number of buckets written.
    pub fn materialize(
        &self,
        granularity: Granularity,
        series: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize> {
        let _guard = self.drain_lock.lock();
        let rollups = self.series_entry(series);
        let mut written = 0;
        for bucket in granularity.buckets_in(from, to) {
            match granularity {
                Granularity::Hour => {
                    self.recompute_hour(&rollups, series, bucket)?;
                    written += 1;
                },
                _ => {
                    if self.rederive(&rollups, granularity, bucket) {
                        written += 1;
                    }
                },
            }
        }
        tracing::info!(
            "Materialized {} {} buckets for {} in [{}, {})",
            written,
            granularity,
            series,
            from,
            to
        );
        Ok(written)
    }

    /// Ask for an hour bucket to be recomputed from raw on the next drain
    pub fn request_recompute(&self, series: &SeriesKey, hour_start: DateTime<Utc>) {
        self.feed
            .mark_dirty(series.clone(), Granularity::Hour.bucket_start(hour_start));
    }

    /// Rollups overlapping `[from, to)`, in bucket order
    pub fn rollups(
        &self,
        series: &SeriesKey,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Rollup> {
        if from >= to {
            return Vec::new();
        }
        match self.existing_series(series) {
            Some(rollups) => rollups
                .level(granularity)
                .read()
                .range(granularity.bucket_start(from)..to)
                .map(|(_, r)| r.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// True when queries at this granularity can be answered from rollups
    pub fn is_materialized(&self, series: &SeriesKey, granularity: Granularity) -> bool {
        granularity == Granularity::Hour
            || self.materialize.contains(&granularity)
            || self
                .existing_series(series)
                .map_or(false, |r| !r.level(granularity).read().is_empty())
    }

    /// Hour buckets in `[from, to)` whose rollup may lag behind raw rows
    pub fn unsettled_hours(
        &self,
        series: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BTreeSet<DateTime<Utc>> {
        let shared = &self.feed.shared;
        shared
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .chain(shared.dirty.iter().map(|entry| entry.key().clone()))
            .filter(|(s, hour)| s == series && *hour + ChronoDuration::hours(1) > from && *hour < to)
            .map(|(_, hour)| hour)
            .collect()
    }

    /// True if any hour in `[from, to)` has unapplied writes
    pub fn pending_in(&self, series: &SeriesKey, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        !self.unsettled_hours(series, from, to).is_empty()
    }

    /// Operator-visible health
    pub fn status(&self) -> AggregatorStatus {
        let mut stale_rollups = 0;
        for entry in self.series.iter() {
            for granularity in Granularity::ALL {
                stale_rollups += entry
                    .value()
                    .level(granularity)
                    .read()
                    .values()
                    .filter(|r| r.status.is_stale())
                    .count();
            }
        }

        AggregatorStatus {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            corrections: self.corrections.load(Ordering::Relaxed),
            recomputations: self.recomputations.load(Ordering::Relaxed),
            dropped_enqueues: self.feed.shared.dropped.load(Ordering::Relaxed),
            dirty_buckets: self.feed.shared.dirty.len(),
            queued_events: self.feed.queued(),
            stale_rollups,
            last_error: self.last_error.lock().clone(),
            last_drain: *self.last_drain.lock(),
        }
    }
}
