//! Rollup value types.

use crate::core::{ObservationId, SeriesKey};
use crate::rollup::Granularity;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// count/sum/min/max over a set of values; `avg` is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    /// Number of values folded in
    pub count: u64,
    /// Sum of values
    pub sum: f64,
    /// Smallest value, `+inf` when empty
    pub min: f64,
    /// Largest value, `-inf` when empty
    pub max: f64,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aggregate {
    /// Aggregate over no values
    pub const fn empty() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Aggregate over a single value
    pub fn of(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    /// Aggregate over a slice of values
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut aggregate = Self::empty();
        for value in values {
            aggregate.fold(value);
        }
        aggregate
    }

    /// Fold one value in
    #[inline]
    pub fn fold(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Merge two aggregation results
    pub fn merge(&mut self, other: &Aggregate) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Mean value, `None` when empty
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// True when nothing was folded in
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Compares with a tolerance for floating-point summation order
    pub fn approx_eq(&self, other: &Aggregate) -> bool {
        if self.count != other.count {
            return false;
        }
        if self.count == 0 {
            return true;
        }
        let tolerance = 1e-9 * self.sum.abs().max(1.0);
        (self.sum - other.sum).abs() <= tolerance && self.min == other.min && self.max == other.max
    }
}

impl Serialize for Aggregate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let non_empty = |v: f64| (self.count > 0).then_some(v);
        let mut state = serializer.serialize_struct("Aggregate", 5)?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("sum", &self.sum)?;
        state.serialize_field("min", &non_empty(self.min))?;
        state.serialize_field("max", &non_empty(self.max))?;
        state.serialize_field("avg", &self.avg())?;
        state.end()
    }
}

/// Whether a rollup still matches its raw rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RollupStatus {
    /// Matches raw data
    Fresh,
    /// Recomputation failed; the value is the last one known
    Stale {
        /// Why the last recomputation failed
        reason: String,
    },
}

impl RollupStatus {
    /// True for `Stale`
    pub fn is_stale(&self) -> bool {
        matches!(self, RollupStatus::Stale { .. })
    }
}

/// A cached aggregate for one series, bucket and granularity.
#[derive(Debug, Clone, Serialize)]
pub struct Rollup {
    /// Bucket width
    pub granularity: Granularity,
    /// Inclusive start of the bucket
    pub bucket_start: DateTime<Utc>,
    /// Aggregated values
    pub aggregate: Aggregate,
    /// Fresh or stale
    pub status: RollupStatus,
    /// Set once every partition overlapping the bucket is sealed
    pub closed: bool,
    /// Hour buckets only: highest id reflected by the last full recomputation
    pub watermark: Option<ObservationId>,
    /// Last time the value changed
    pub updated_at: DateTime<Utc>,
}

impl Rollup {
    /// Empty, fresh rollup
    pub fn new(granularity: Granularity, bucket_start: DateTime<Utc>) -> Self {
        Self {
            granularity,
            bucket_start,
            aggregate: Aggregate::empty(),
            status: RollupStatus::Fresh,
            closed: false,
            watermark: None,
            updated_at: Utc::now(),
        }
    }

    /// Exclusive end of the bucket
    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.granularity.bucket_end(self.bucket_start)
    }

    /// True when a fold for `id` is already reflected by a recomputation
    pub fn covers(&self, id: ObservationId) -> bool {
        self.watermark.map_or(false, |w| id <= w)
    }
}

/// Message from the write path and rollover job to the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum RollupEvent {
    /// Fold a newly appended value into its hour bucket
    Fold {
        /// Series the value belongs to
        series: SeriesKey,
        /// Hour bucket
        hour_start: DateTime<Utc>,
        /// Id assigned to the observation
        id: ObservationId,
        /// Observed value
        value: f64,
    },
    /// Late write into a sealed partition; recompute the hour bucket from raw
    Correction {
        /// Series the value belongs to
        series: SeriesKey,
        /// Hour bucket
        hour_start: DateTime<Utc>,
    },
    /// A partition was sealed; buckets inside it are closed
    PartitionSealed {
        /// Window start
        window_start: DateTime<Utc>,
        /// Window end (exclusive)
        window_end: DateTime<Utc>,
    },
}

/// Operator-visible health of the aggregator
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStatus {
    /// Fold events applied
    pub events_applied: u64,
    /// Correction events received
    pub corrections: u64,
    /// Full hour-bucket recomputations
    pub recomputations: u64,
    /// Events that could not be enqueued (bucket marked dirty instead)
    pub dropped_enqueues: u64,
    /// Buckets waiting for recomputation
    pub dirty_buckets: usize,
    /// Events waiting in the queue
    pub queued_events: usize,
    /// Rollups currently marked stale
    pub stale_rollups: usize,
    /// Most recent recomputation failure
    pub last_error: Option<String>,
    /// Completion time of the most recent drain
    pub last_drain: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fold_and_merge() {
        let mut a = Aggregate::from_values([98.5, 97.0]);
        let b = Aggregate::of(99.1);
        a.merge(&b);

        assert_eq!(a.count, 3);
        assert_eq!(a.min, 97.0);
        assert_eq!(a.max, 99.1);
        assert!((a.avg().unwrap() - 98.2).abs() < 1e-9);
    }

    #[test]
    fn test_empty_merge_is_identity() {
        let mut a = Aggregate::of(5.0);
        a.merge(&Aggregate::empty());
        assert_eq!(a, Aggregate::of(5.0));
        assert_eq!(Aggregate::empty().avg(), None);
    }

    #[test]
    fn test_empty_serializes_without_infinities() {
        let json = serde_json::to_value(Aggregate::empty()).unwrap();
        assert_eq!(json["count"], 0);
        assert!(json["min"].is_null());
        assert!(json["avg"].is_null());
    }

    #[test]
    fn test_watermark_cover() {
        let mut rollup = Rollup::new(Granularity::Hour, Utc::now());
        assert!(!rollup.covers(ObservationId(1)));
        rollup.watermark = Some(ObservationId(10));
        assert!(rollup.covers(ObservationId(10)));
        assert!(!rollup.covers(ObservationId(11)));
    }
}
