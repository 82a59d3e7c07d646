//! Query planning and the lazy bucket stream.

use super::{
    BucketAggregate, BucketSource, Completion, PlanKind, QueryFilters, QueryRequest, QueryResult,
    TruncationReason,
};
use crate::core::config::QueryConfig;
use crate::core::{
    MetricId, Observation, ObservationId, OrganizationId, Result, SeriesKey, StoreError,
};
use crate::rollup::{Aggregate, ContinuousAggregator, Granularity, RawSource, Rollup};
use crate::storage::partition::PartitionHandle;
use crate::storage::partition_manager::PartitionManager;
use crate::storage::types::StoreStats;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Plans queries and performs point lookups
pub struct QueryEngine {
    manager: Arc<PartitionManager>,
    aggregator: Arc<ContinuousAggregator>,
    stats: Arc<StoreStats>,
    defaults: QueryConfig,
}

impl QueryEngine {
    /// Create a query engine
    pub fn new(
        manager: Arc<PartitionManager>,
        aggregator: Arc<ContinuousAggregator>,
        stats: Arc<StoreStats>,
        defaults: QueryConfig,
    ) -> Self {
        Self {
            manager,
            aggregator,
            stats,
            defaults,
        }
    }

    /// Start a query
    pub fn query(&self, request: QueryRequest) -> Result<QueryStream> {
        self.query_with_cancel(request, CancellationToken::new())
    }

    /// Start a query that stops at the next partition or bucket boundary once `cancel` fires
    pub fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryStream> {
        request.validate()?;
        self.stats.record_query(1);

        let granularity = request.granularity;
        // Whole buckets only: the range is widened to bucket boundaries.
        let from = granularity.bucket_start(request.from);
        let last = granularity.bucket_start(request.to);
        let to = if last == request.to {
            last
        } else {
            granularity.bucket_end(last)
        };

        let timeout = request.options.timeout.unwrap_or(self.defaults.timeout);
        let budget = Budget {
            max_rows: request
                .options
                .max_scanned_rows
                .unwrap_or(self.defaults.max_scanned_rows),
            deadline: Instant::now().checked_add(timeout),
            cancel,
            rows_scanned: 0,
        };

        let rollup_series = match &request.organization_id {
            Some(organization) if request.filters.is_empty() => {
                let series = SeriesKey::new(request.metric_id.clone(), organization.clone());
                self.aggregator
                    .is_materialized(&series, granularity)
                    .then_some(series)
            },
            _ => None,
        };

        let cursor = match rollup_series {
            Some(series) => Cursor::Rollup(RollupCursor {
                series,
                next_bucket: from,
            }),
            None => Cursor::Raw(RawCursor {
                partitions: self.manager.partitions_in_range(from, to).into(),
                open: BTreeMap::new(),
                ready: VecDeque::new(),
                finished: None,
            }),
        };

        tracing::debug!(
            "Query {} org={:?} [{}, {}) {} via {:?}",
            request.metric_id,
            request.organization_id.as_ref().map(|o| o.as_str()),
            from,
            to,
            granularity,
            cursor.kind()
        );

        Ok(QueryStream {
            scope: Scope {
                metric_id: request.metric_id,
                organization_id: request.organization_id,
                from,
                to,
                granularity,
                filters: request.filters,
                manager: Arc::clone(&self.manager),
                aggregator: Arc::clone(&self.aggregator),
            },
            stats: Arc::clone(&self.stats),
            budget,
            cursor,
            completion: None,
        })
    }

    /// Point lookup by id; `None` if unknown or no longer retained
    pub fn get(&self, id: ObservationId) -> Result<Option<Observation>> {
        let Some(partition) = self.manager.lookup_id(id) else {
            return Ok(None);
        };
        match partition.find(id, self.manager.blocks()) {
            Err(StoreError::PartitionUnavailable(_)) => Ok(None),
            other => other,
        }
    }
}

struct Budget {
    max_rows: usize,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    rows_scanned: usize,
}

impl Budget {
    fn exhausted(&self) -> Option<TruncationReason> {
        if self.cancel.is_cancelled() {
            Some(TruncationReason::Cancelled)
        } else if self.deadline.map_or(false, |d| Instant::now() >= d) {
            Some(TruncationReason::Timeout)
        } else if self.rows_scanned >= self.max_rows {
            Some(TruncationReason::RowBudget)
        } else {
            None
        }
    }

    fn remaining_rows(&self) -> usize {
        self.max_rows.saturating_sub(self.rows_scanned)
    }
}

struct Scope {
    metric_id: MetricId,
    organization_id: Option<OrganizationId>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    granularity: Granularity,
    filters: QueryFilters,
    manager: Arc<PartitionManager>,
    aggregator: Arc<ContinuousAggregator>,
}

enum Step {
    Item(BucketAggregate),
    Done(Completion),
}

enum Cursor {
    Rollup(RollupCursor),
    Raw(RawCursor),
}

impl Cursor {
    fn kind(&self) -> PlanKind {
        match self {
            Cursor::Rollup(_) => PlanKind::Rollup,
            Cursor::Raw(_) => PlanKind::Raw,
        }
    }
}

struct RollupCursor {
    series: SeriesKey,
    next_bucket: DateTime<Utc>,
}

impl RollupCursor {
    fn step(&mut self, scope: &Scope, budget: &mut Budget) -> Step {
        loop {
            let bucket = self.next_bucket;
            if bucket >= scope.to {
                return Step::Done(Completion::Complete);
            }
            if let Some(reason) = budget.exhausted() {
                return Step::Done(Completion::Truncated { reason });
            }
            let end = scope.granularity.bucket_end(bucket);
            self.next_bucket = end;

            let refreshed = match scope.granularity {
                Granularity::Hour => self.hour_bucket(scope, budget, bucket, end),
                _ => self.coarse_bucket(scope, budget, bucket, end),
            };
            if let Some(item) = refreshed {
                if !item.aggregate.is_empty() {
                    return Step::Item(item);
                }
            }
        }
    }

    fn raw_hour(
        &self,
        scope: &Scope,
        budget: &mut Budget,
        hour: DateTime<Utc>,
    ) -> Result<Aggregate> {
        let raw = scope
            .manager
            .aggregate_raw(&self.series, hour, Granularity::Hour.bucket_end(hour))?;
        budget.rows_scanned += raw.rows_scanned;
        Ok(raw.aggregate)
    }

    fn hour_bucket(
        &self,
        scope: &Scope,
        budget: &mut Budget,
        bucket: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<BucketAggregate> {
        // Pending state is read before the rollup so a drain landing in between
        // can only make the rollup newer than what the flag describes.
        let unsettled = !scope.aggregator.unsettled_hours(&self.series, bucket, end).is_empty();
        let rollup = find_rollup(scope, &self.series, Granularity::Hour, bucket, end);
        let stale = rollup.as_ref().map_or(false, |r| r.status.is_stale());

        if !unsettled && !stale {
            return rollup.map(|r| output(bucket, end, r.aggregate, BucketSource::Rollup, false));
        }
        match self.raw_hour(scope, budget, bucket) {
            Ok(aggregate) => Some(output(bucket, end, aggregate, BucketSource::Raw, false)),
            Err(e) => {
                tracing::debug!("Serving stale rollup for {} at {}: {}", self.series, bucket, e);
                rollup.map(|r| output(bucket, end, r.aggregate, BucketSource::Rollup, true))
            },
        }
    }

    fn coarse_bucket(
        &self,
        scope: &Scope,
        budget: &mut Budget,
        bucket: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<BucketAggregate> {
        let unsettled = scope.aggregator.unsettled_hours(&self.series, bucket, end);
        let rollup = find_rollup(scope, &self.series, scope.granularity, bucket, end);
        if let Some(rollup) = &rollup {
            if unsettled.is_empty() && !rollup.status.is_stale() {
                return Some(output(bucket, end, rollup.aggregate, BucketSource::Rollup, false));
            }
        }

        // Assemble from hours, refreshing the ones that lag behind raw rows
        let hours: BTreeMap<DateTime<Utc>, Rollup> = scope
            .aggregator
            .rollups(&self.series, Granularity::Hour, bucket, end)
            .into_iter()
            .map(|r| (r.bucket_start, r))
            .collect();
        let starts: BTreeSet<DateTime<Utc>> = hours.keys().chain(unsettled.iter()).copied().collect();

        let mut total = Aggregate::empty();
        let mut source = BucketSource::Rollup;
        let mut stale = false;
        for hour in starts {
            let hour_rollup = hours.get(&hour);
            let refresh =
                unsettled.contains(&hour) || hour_rollup.map_or(false, |r| r.status.is_stale());
            if !refresh {
                if let Some(r) = hour_rollup {
                    total.merge(&r.aggregate);
                }
                continue;
            }
            match self.raw_hour(scope, budget, hour) {
                Ok(aggregate) => {
                    total.merge(&aggregate);
                    source = BucketSource::Raw;
                },
                Err(e) => {
                    tracing::debug!("Serving stale rollup for {} at {}: {}", self.series, hour, e);
                    if let Some(r) = hour_rollup {
                        total.merge(&r.aggregate);
                    }
                    stale = true;
                },
            }
        }
        Some(output(bucket, end, total, source, stale))
    }
}

fn find_rollup(
    scope: &Scope,
    series: &SeriesKey,
    granularity: Granularity,
    bucket: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<Rollup> {
    scope
        .aggregator
        .rollups(series, granularity, bucket, end)
        .into_iter()
        .find(|r| r.bucket_start == bucket)
}

fn output(
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    aggregate: Aggregate,
    source: BucketSource,
    stale: bool,
) -> BucketAggregate {
    BucketAggregate {
        bucket_start,
        bucket_end,
        aggregate,
        source,
        stale,
    }
}

struct RawCursor {
    partitions: VecDeque<PartitionHandle>,
    /// Buckets that may still receive rows from later partitions
    open: BTreeMap<DateTime<Utc>, Aggregate>,
    ready: VecDeque<BucketAggregate>,
    finished: Option<Completion>,
}

impl RawCursor {
    fn step(&mut self, scope: &Scope, budget: &mut Budget) -> Step {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Step::Item(item);
            }
            if let Some(completion) = self.finished.take() {
                return Step::Done(completion);
            }

            let Some(partition) = self.partitions.pop_front() else {
                self.release(scope, None);
                self.finished = Some(Completion::Complete);
                continue;
            };

            if let Some(reason) = budget.exhausted() {
                // Buckets still open are incomplete and are not emitted
                self.finished = Some(Completion::Truncated { reason });
                continue;
            }

            match self.scan(scope, budget, &partition) {
                Ok(false) => {
                    let boundary = self.partitions.front().map(|p| p.window_start());
                    self.release(scope, boundary);
                },
                Ok(true) => {
                    self.finished = Some(Completion::Truncated {
                        reason: TruncationReason::RowBudget,
                    });
                },
                Err(e) => {
                    tracing::warn!("Query scan of partition {} failed: {}", partition.key(), e);
                    self.finished = Some(Completion::Truncated {
                        reason: TruncationReason::PartitionUnavailable,
                    });
                },
            }
        }
    }

    /// Fold one partition's matching rows; true if the row budget ran out
    fn scan(&mut self, scope: &Scope, budget: &mut Budget, partition: &PartitionHandle) -> Result<bool> {
        let allowance = budget.remaining_rows();
        let mut visited = 0usize;
        let open = &mut self.open;
        let outcome = partition.scan(
            scope.manager.blocks(),
            scope.organization_id.as_ref(),
            |row| {
                if visited >= allowance {
                    return ControlFlow::Break(());
                }
                visited += 1;
                let obs = &row.observation;
                if obs.metric_id == scope.metric_id
                    && scope.from <= obs.timestamp
                    && obs.timestamp < scope.to
                    && scope.filters.matches(obs)
                {
                    open.entry(scope.granularity.bucket_start(obs.timestamp))
                        .or_insert_with(Aggregate::empty)
                        .fold(obs.value);
                }
                ControlFlow::Continue(())
            },
        )?;
        budget.rows_scanned += visited;
        Ok(outcome.stopped)
    }

    /// Move buckets that end at or before `boundary` (all if `None`) to the output
    fn release(&mut self, scope: &Scope, boundary: Option<DateTime<Utc>>) {
        while let Some(entry) = self.open.first_entry() {
            let start = *entry.key();
            let end = scope.granularity.bucket_end(start);
            if boundary.map_or(false, |b| end > b) {
                break;
            }
            let aggregate = entry.remove();
            self.ready
                .push_back(output(start, end, aggregate, BucketSource::Raw, false));
        }
    }
}

/// Lazy, forward-only stream of buckets in ascending order.
///
/// Not restartable. Once it returns `None`, [`QueryStream::completion`]
/// tells whether every bucket was produced.
pub struct QueryStream {
    scope: Scope,
    stats: Arc<StoreStats>,
    budget: Budget,
    cursor: Cursor,
    completion: Option<Completion>,
}

impl QueryStream {
    /// `None` until the stream is exhausted
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// Plan answering this query
    pub fn plan(&self) -> PlanKind {
        self.cursor.kind()
    }

    /// Raw rows visited so far
    pub fn rows_scanned(&self) -> usize {
        self.budget.rows_scanned
    }

    /// Drain the stream
    pub fn into_result(mut self) -> QueryResult {
        let buckets: Vec<BucketAggregate> = self.by_ref().collect();
        QueryResult {
            buckets,
            completion: self.completion.unwrap_or(Completion::Complete),
            plan: self.plan(),
            rows_scanned: self.budget.rows_scanned,
        }
    }

    fn finish(&mut self, completion: Completion) {
        self.completion = Some(completion);
        self.stats.record_rows_scanned(self.budget.rows_scanned as u64);
        if let Completion::Truncated { reason } = completion {
            self.stats.record_truncated_query(1);
            tracing::debug!(
                "Query {} truncated ({:?}) after {} rows",
                self.scope.metric_id,
                reason,
                self.budget.rows_scanned
            );
        }
    }
}

impl Iterator for QueryStream {
    type Item = BucketAggregate;

    fn next(&mut self) -> Option<BucketAggregate> {
        if self.completion.is_some() {
            return None;
        }
        let step = match &mut self.cursor {
            Cursor::Rollup(cursor) => cursor.step(&self.scope, &mut self.budget),
            Cursor::Raw(cursor) => cursor.step(&self.scope, &mut self.budget),
        };
        match step {
            Step::Item(item) => Some(item),
            Step::Done(completion) => {
                self.finish(completion);
                None
            },
        }
    }
}
