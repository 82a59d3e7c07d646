//! Bucketed aggregate queries over observations.
//!
//! A query names a metric, a tenant (or none, for cross-tenant reads), a
//! half-open time range and a granularity. Unfiltered queries at a
//! materialized granularity are answered from rollups; anything else scans
//! raw partitions.

pub mod executor;

use crate::core::{MetricId, Observation, OrganizationId, Result, StoreError};
use crate::rollup::{Aggregate, Granularity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use executor::{QueryEngine, QueryStream};

/// Optional dimension filters; all present filters must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
    /// Exact process id
    pub process_id: Option<String>,
    /// Exact KPI code
    pub kpi_code: Option<String>,
    /// Context key/value pairs; numbers match their decimal rendering
    pub context: BTreeMap<String, String>,
}

impl QueryFilters {
    /// True when no filter is set
    pub fn is_empty(&self) -> bool {
        self.process_id.is_none() && self.kpi_code.is_none() && self.context.is_empty()
    }

    /// True if the observation passes every filter
    pub fn matches(&self, observation: &Observation) -> bool {
        if let Some(process_id) = &self.process_id {
            if observation.process_id.as_deref() != Some(process_id.as_str()) {
                return false;
            }
        }
        if let Some(kpi_code) = &self.kpi_code {
            if observation.kpi_code.as_deref() != Some(kpi_code.as_str()) {
                return false;
            }
        }
        self.context.iter().all(|(key, expected)| {
            observation
                .context_value(key)
                .map_or(false, |value| value.matches_str(expected))
        })
    }
}

/// Per-query budgets; unset fields fall back to the store configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Raw rows the query may visit
    pub max_scanned_rows: Option<usize>,
    /// Wall-clock budget
    pub timeout: Option<Duration>,
}

/// A bucketed aggregate query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Metric to aggregate
    pub metric_id: MetricId,
    /// Tenant scope; `None` reads across all tenants
    pub organization_id: Option<OrganizationId>,
    /// Inclusive start
    pub from: DateTime<Utc>,
    /// Exclusive end
    pub to: DateTime<Utc>,
    /// Bucket width
    pub granularity: Granularity,
    /// Dimension filters
    pub filters: QueryFilters,
    /// Budgets
    pub options: QueryOptions,
}

impl QueryRequest {
    /// Tenant-scoped query with no filters
    pub fn new(
        metric_id: MetricId,
        organization_id: OrganizationId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularity: Granularity,
    ) -> Self {
        Self {
            metric_id,
            organization_id: Some(organization_id),
            from,
            to,
            granularity,
            filters: QueryFilters::default(),
            options: QueryOptions::default(),
        }
    }

    /// Query spanning every tenant
    pub fn cross_tenant(
        metric_id: MetricId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularity: Granularity,
    ) -> Self {
        Self {
            metric_id,
            organization_id: None,
            from,
            to,
            granularity,
            filters: QueryFilters::default(),
            options: QueryOptions::default(),
        }
    }

    /// Restrict to a process
    pub fn process_id<S: Into<String>>(mut self, process_id: S) -> Self {
        self.filters.process_id = Some(process_id.into());
        self
    }

    /// Restrict to a KPI code
    pub fn kpi_code<S: Into<String>>(mut self, kpi_code: S) -> Self {
        self.filters.kpi_code = Some(kpi_code.into());
        self
    }

    /// Require a context value
    pub fn context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.filters.context.insert(key.into(), value.into());
        self
    }

    /// Override the row budget
    pub fn max_scanned_rows(mut self, rows: usize) -> Self {
        self.options.max_scanned_rows = Some(rows);
        self
    }

    /// Override the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Reject empty or inverted ranges and blank identifiers
    pub fn validate(&self) -> Result<()> {
        if self.metric_id.is_blank() {
            return Err(StoreError::validation("metric_id", "must not be empty"));
        }
        if self.organization_id.as_ref().map_or(false, |o| o.is_blank()) {
            return Err(StoreError::validation("organization_id", "must not be empty"));
        }
        if self.from >= self.to {
            return Err(StoreError::validation(
                "from",
                format!("range start {} must be before end {}", self.from, self.to),
            ));
        }
        Ok(())
    }
}

/// Where a bucket's value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketSource {
    /// Read from rollups
    Rollup,
    /// Computed from raw rows during the query
    Raw,
}

/// One output bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketAggregate {
    /// Inclusive bucket start
    pub bucket_start: DateTime<Utc>,
    /// Exclusive bucket end
    pub bucket_end: DateTime<Utc>,
    /// Aggregate over the bucket
    #[serde(flatten)]
    pub aggregate: Aggregate,
    /// Rollup or raw
    pub source: BucketSource,
    /// True if the value came from a rollup that could not be refreshed
    pub stale: bool,
}

/// Why a query stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    /// `max_scanned_rows` reached
    RowBudget,
    /// Wall-clock budget exceeded
    Timeout,
    /// Cancellation token fired
    Cancelled,
    /// A partition was dropped while the query ran
    PartitionUnavailable,
}

/// How a finished query ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Completion {
    /// Every bucket in range was produced
    Complete,
    /// Buckets were produced up to a budget
    Truncated {
        /// What ran out
        reason: TruncationReason,
    },
}

impl Completion {
    /// True for [`Completion::Truncated`]
    pub fn is_truncated(&self) -> bool {
        matches!(self, Completion::Truncated { .. })
    }
}

/// Which path answered a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    /// Rollups, refreshed from raw where needed
    Rollup,
    /// Partition scan
    Raw,
}

/// A fully drained query
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Buckets in ascending order
    pub buckets: Vec<BucketAggregate>,
    /// Complete or truncated
    pub completion: Completion,
    /// Plan used
    pub plan: PlanKind,
    /// Raw rows visited
    pub rows_scanned: usize,
}
