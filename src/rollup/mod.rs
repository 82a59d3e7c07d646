//! Derived aggregates over observations.
//!
//! Rollups are a cache over raw rows: every rollup can be recomputed from the
//! observations in its bucket, and the query engine does exactly that when a
//! rollup is stale or still has unapplied writes.

pub mod aggregator;
pub mod granularity;
pub mod types;

// Re-export commonly used types
pub use aggregator::{ContinuousAggregator, DrainReport, RawAggregate, RawSource, RollupFeed};
pub use granularity::Granularity;
pub use types::{Aggregate, AggregatorStatus, Rollup, RollupEvent, RollupStatus};
