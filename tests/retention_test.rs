//! Tier transitions driven through the store.

mod common;

use common::{at, observation, TestStoreBuilder};
use chrono::{DateTime, Utc};
use kpistore_lib::core::{Result, RetentionPolicy, StoreError};
use kpistore_lib::rollup::Granularity;
use kpistore_lib::storage::{ArchiveIndex, ArchiveSink, DirectorySink, Row, Tier};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[test]
fn test_cold_partitions_are_archived_with_index() {
    let t = TestStoreBuilder::new().retention(1, 2, 3).with_archive().build();
    for minute in [0, 15, 30] {
        t.store.append(observation(at(15, 10, minute), "42", 1.0)).unwrap();
    }
    t.store.append(observation(at(15, 10, 45), "7", 2.0)).unwrap();
    t.store.drain_aggregator();

    let cancel = CancellationToken::new();
    t.clock.set(at(17, 12, 0));
    t.store.run_rollover(&cancel);
    t.store.run_retention(&cancel);
    assert_eq!(t.partition_at(at(15, 10, 0)).unwrap().tier(), Tier::Cold);

    t.clock.set(at(19, 12, 0));
    let report = t.store.run_retention(&cancel);
    assert_eq!(report.archived, 1);
    assert!(t.partition_at(at(15, 10, 0)).is_none());
    assert_eq!(t.store.status().partitions.archived, 1);

    let archive_dir = t.store.policy().archive_sink.clone().unwrap();
    let sink = DirectorySink::new(&archive_dir).unwrap();
    let index = sink.load_index("20240315T10").unwrap();
    assert_eq!(index.row_count, 4);
    assert_eq!(index.organization_positions("42").unwrap().len(), 3);
    assert_eq!(sink.read_rows("20240315T10").unwrap().len(), 4);

    // Archived windows no longer take writes
    let err = t.store.append(observation(at(15, 10, 50), "42", 1.0)).unwrap_err();
    assert!(matches!(err, StoreError::ExpiredWindow { .. }));

    // Rollups survive
    let day = t
        .store
        .rollups(
            &kpistore_lib::core::SeriesKey::new(
                kpistore_lib::core::MetricId::new("RL.1.1").unwrap(),
                kpistore_lib::core::OrganizationId::new("42").unwrap(),
            ),
            Granularity::Day,
            at(15, 0, 0),
            at(16, 0, 0),
        );
    assert_eq!(day[0].aggregate.count, 3);
}

#[test]
fn test_open_partitions_are_never_demoted() {
    let t = TestStoreBuilder::new().retention(0, 0, 30).build();
    t.store.append(observation(at(15, 10, 0), "42", 1.0)).unwrap();

    let report = t.store.run_retention(&CancellationToken::new());
    assert_eq!(report.demoted, 0);
    assert_eq!(t.partition_at(at(15, 10, 0)).unwrap().tier(), Tier::Hot);
}

#[test]
fn test_policy_update_applies_next_cycle() {
    let t = TestStoreBuilder::new().build();
    t.store.append(observation(at(15, 10, 0), "42", 1.0)).unwrap();
    let cancel = CancellationToken::new();
    t.clock.set(at(20, 0, 0));
    t.store.run_rollover(&cancel);

    assert_eq!(t.store.run_retention(&cancel).demoted, 0);

    t.store
        .update_policy(RetentionPolicy {
            hot_days: 2,
            warm_days: 3,
            cold_days: 30,
            archive_sink: None,
        })
        .unwrap();
    let report = t.store.run_retention(&cancel);
    assert_eq!(report.demoted, 2);
    assert_eq!(t.partition_at(at(15, 10, 0)).unwrap().tier(), Tier::Cold);
}

#[test]
fn test_cancelled_cycle_stops_early() {
    let t = TestStoreBuilder::new().retention(1, 2, 30).build();
    for hour in 0..4 {
        t.store.append(observation(at(15, hour, 0), "42", 1.0)).unwrap();
    }
    let cancel = CancellationToken::new();
    t.clock.set(at(20, 0, 0));
    t.store.run_rollover(&cancel);

    cancel.cancel();
    let report = t.store.run_retention(&cancel);
    assert!(report.cancelled);
    assert_eq!(report.demoted, 0);
}

/// Keeps exported rows in memory, keyed by partition.
#[derive(Default)]
struct MemorySink {
    exported: Mutex<Vec<(String, Vec<Row>)>>,
}

impl ArchiveSink for MemorySink {
    fn export(
        &self,
        partition_key: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        rows: &[Row],
    ) -> Result<ArchiveIndex> {
        self.exported.lock().push((partition_key.to_string(), rows.to_vec()));
        ArchiveIndex::build(partition_key, window_start, window_end, rows)
    }
}

#[test]
fn test_store_archives_through_custom_sink() {
    let sink = Arc::new(MemorySink::default());
    let t = TestStoreBuilder::new()
        .retention(1, 2, 3)
        .archive_sink(sink.clone())
        .build();
    t.store.append(observation(at(15, 10, 0), "42", 1.0)).unwrap();
    t.store.append(observation(at(15, 10, 30), "7", 2.0)).unwrap();

    let cancel = CancellationToken::new();
    t.clock.set(at(20, 0, 0));
    t.store.run_rollover(&cancel);
    let report = t.store.run_retention(&cancel);
    assert_eq!(report.archived, 1);
    assert_eq!(report.purged, 0);
    assert!(t.partition_at(at(15, 10, 0)).is_none());

    let exported = sink.exported.lock();
    assert_eq!(exported.len(), 1);
    assert_eq!(exported[0].0, "20240315T10");
    assert_eq!(exported[0].1.len(), 2);
}
