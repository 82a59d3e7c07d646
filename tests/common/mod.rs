//! Common test utilities and fixtures.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use kpistore_lib::core::{ConfigBuilder, ManualClock, Observation, RetentionPolicy};
use kpistore_lib::rollup::Granularity;
use kpistore_lib::storage::{ArchiveSink, ObservationStore, PartitionHandle};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A store on a manual clock with its data directory kept alive.
pub struct TestStore {
    pub store: Arc<ObservationStore>,
    pub clock: ManualClock,
    _dir: TempDir,
}

impl TestStore {
    pub fn partition_at(&self, ts: DateTime<Utc>) -> Option<PartitionHandle> {
        let manager = self.store.partitions();
        manager.get(manager.window_start_for(ts).ok()?)
    }
}

/// Fixture builder with hourly partitions and a short seal grace.
pub struct TestStoreBuilder {
    start: DateTime<Utc>,
    window: Duration,
    grace: Duration,
    retention: RetentionPolicy,
    queue_capacity: usize,
    materialize: Vec<Granularity>,
    archive: bool,
    sink: Option<Arc<dyn ArchiveSink>>,
}

impl TestStoreBuilder {
    pub fn new() -> Self {
        Self {
            start: at(15, 0, 0),
            window: Duration::from_secs(3600),
            grace: Duration::from_secs(300),
            retention: RetentionPolicy::default(),
            queue_capacity: 4096,
            materialize: vec![Granularity::Hour, Granularity::Day],
            archive: false,
            sink: None,
        }
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    pub fn window_hours(mut self, hours: u64) -> Self {
        self.window = Duration::from_secs(hours * 3600);
        self
    }

    pub fn retention(mut self, hot: u32, warm: u32, cold: u32) -> Self {
        self.retention.hot_days = hot;
        self.retention.warm_days = warm;
        self.retention.cold_days = cold;
        self
    }

    pub fn with_archive(mut self) -> Self {
        self.archive = true;
        self
    }

    pub fn archive_sink(mut self, sink: Arc<dyn ArchiveSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn materialize(mut self, granularities: Vec<Granularity>) -> Self {
        self.materialize = granularities;
        self
    }

    pub fn build(self) -> TestStore {
        let dir = TempDir::new().unwrap();
        let mut retention = self.retention;
        if self.archive {
            retention.archive_sink = Some(dir.path().join("archive"));
        }
        let config = ConfigBuilder::new()
            .data_dir(dir.path().join("blocks"))
            .partition_window(self.window)
            .seal_grace(self.grace)
            .aggregator_queue_capacity(self.queue_capacity)
            .materialize(self.materialize)
            .retention(retention)
            .build()
            .unwrap();

        let clock = ManualClock::new(self.start);
        let mut builder = ObservationStore::builder(config).clock(Arc::new(clock.clone()));
        if let Some(sink) = self.sink {
            builder = builder.archive_sink(sink);
        }
        let store = builder.build().unwrap();

        TestStore {
            store: Arc::new(store),
            clock,
            _dir: dir,
        }
    }
}

/// 2024-03-`day` `hour`:`minute` UTC
pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
}

/// A valid `RL.1.1` observation
pub fn observation(ts: DateTime<Utc>, org: &str, value: f64) -> Observation {
    Observation::builder()
        .timestamp(ts)
        .metric_id("RL.1.1")
        .kpi_code("perfect_order_fulfillment")
        .organization_id(org)
        .unit("percentage")
        .value(value)
        .build()
        .unwrap()
}
