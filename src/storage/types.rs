//! Storage data types and structures.

use crate::core::{Observation, ObservationId};
use crate::rollup::AggregatorStatus;
use crate::storage::compression::CompressionStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An accepted observation together with its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Id handed back to the producer
    pub id: ObservationId,
    /// The stored record
    pub observation: Observation,
}

/// Write-side state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Accepting appends.
    Open,
    /// No further appends; late writes go to the correction segment.
    Sealed,
    /// Sealed and re-encoded as a compressed block.
    Compressed,
}

impl Lifecycle {
    /// Lifecycle after sealing, `None` if already sealed.
    pub fn seal(self) -> Option<Lifecycle> {
        match self {
            Lifecycle::Open => Some(Lifecycle::Sealed),
            Lifecycle::Sealed | Lifecycle::Compressed => None,
        }
    }

    /// Lifecycle after compression, `None` unless sealed and uncompressed.
    pub fn compress(self) -> Option<Lifecycle> {
        match self {
            Lifecycle::Sealed => Some(Lifecycle::Compressed),
            Lifecycle::Open | Lifecycle::Compressed => None,
        }
    }

    /// True once appends are refused.
    pub fn is_sealed(self) -> bool {
        !matches!(self, Lifecycle::Open)
    }
}

/// Retention tier of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Raw rows in memory.
    Hot,
    /// Compressed block in memory.
    Warm,
    /// Columnar block spilled to disk.
    Cold,
    /// Exported to the archive sink; raw data is gone from the store.
    Archived,
    /// Deleted; raw data is gone.
    Purged,
}

impl Tier {
    /// True for tiers whose raw rows are still readable.
    pub fn is_readable(self) -> bool {
        matches!(self, Tier::Hot | Tier::Warm | Tier::Cold)
    }

    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
            Tier::Archived => "archived",
            Tier::Purged => "purged",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live partitions by tier and lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    /// Hot partitions
    pub hot: usize,
    /// Warm partitions
    pub warm: usize,
    /// Cold partitions
    pub cold: usize,
    /// Partitions still accepting appends
    pub open: usize,
    /// Sealed, not yet compressed
    pub sealed: usize,
    /// Sealed and compressed
    pub compressed: usize,
    /// Partitions exported and removed since start
    pub archived: u64,
    /// Partitions deleted since start
    pub purged: u64,
}

/// Store-wide counters, updated lock-free from every component.
#[derive(Debug, Default)]
pub struct StoreStats {
    observations_written: AtomicU64,
    late_corrections: AtomicU64,
    rejected_validation: AtomicU64,
    rejected_expired: AtomicU64,
    partitions_sealed: AtomicU64,
    partitions_compressed: AtomicU64,
    compression_failures: AtomicU64,
    partitions_demoted: AtomicU64,
    partitions_archived: AtomicU64,
    partitions_purged: AtomicU64,
    retention_failures: AtomicU64,
    queries_executed: AtomicU64,
    queries_truncated: AtomicU64,
    rows_scanned: AtomicU64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increments `", stringify!($field), "`")]
            pub fn $record(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl StoreStats {
    counter! {
        record_written => observations_written,
        record_correction => late_corrections,
        record_validation_rejection => rejected_validation,
        record_expired_rejection => rejected_expired,
        record_sealed => partitions_sealed,
        record_compressed => partitions_compressed,
        record_compression_failure => compression_failures,
        record_demoted => partitions_demoted,
        record_archived => partitions_archived,
        record_purged => partitions_purged,
        record_retention_failure => retention_failures,
        record_query => queries_executed,
        record_truncated_query => queries_truncated,
        record_rows_scanned => rows_scanned,
    }

    /// Consistent-enough copy of every counter
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StoreStatsSnapshot {
            observations_written: load(&self.observations_written),
            late_corrections: load(&self.late_corrections),
            rejected_validation: load(&self.rejected_validation),
            rejected_expired: load(&self.rejected_expired),
            partitions_sealed: load(&self.partitions_sealed),
            partitions_compressed: load(&self.partitions_compressed),
            compression_failures: load(&self.compression_failures),
            partitions_demoted: load(&self.partitions_demoted),
            partitions_archived: load(&self.partitions_archived),
            partitions_purged: load(&self.partitions_purged),
            retention_failures: load(&self.retention_failures),
            queries_executed: load(&self.queries_executed),
            queries_truncated: load(&self.queries_truncated),
            rows_scanned: load(&self.rows_scanned),
        }
    }
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    /// Accepted observations (including late corrections)
    pub observations_written: u64,
    /// Late writes routed to correction segments
    pub late_corrections: u64,
    /// Writes rejected by validation
    pub rejected_validation: u64,
    /// Writes rejected because their window expired
    pub rejected_expired: u64,
    /// Partitions sealed
    pub partitions_sealed: u64,
    /// Partitions compressed by the rollover job
    pub partitions_compressed: u64,
    /// Failed compression attempts
    pub compression_failures: u64,
    /// Hot → warm and warm → cold moves
    pub partitions_demoted: u64,
    /// Partitions exported to the archive sink
    pub partitions_archived: u64,
    /// Partitions deleted
    pub partitions_purged: u64,
    /// Failed retention steps
    pub retention_failures: u64,
    /// Queries executed
    pub queries_executed: u64,
    /// Queries that hit a budget
    pub queries_truncated: u64,
    /// Raw rows visited by queries
    pub rows_scanned: u64,
}

/// Everything the status endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    /// Partitions per tier
    pub partitions: TierCounts,
    /// Writes before this instant are rejected
    pub retained_from: Option<DateTime<Utc>>,
    /// Continuous aggregator health
    pub aggregator: AggregatorStatus,
    /// Store counters
    pub stats: StoreStatsSnapshot,
    /// Block compression counters
    pub compression: CompressionStats,
}
