//! Calendar bucketing for rollups.
//!
//! Hours and days are UTC-aligned, weeks start on ISO Monday and months follow
//! the calendar, so a bucket never depends on when the store was started.

use crate::core::{Result, StoreError};
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rollup bucket width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One hour
    Hour,
    /// One UTC day
    Day,
    /// ISO week, Monday to Monday
    Week,
    /// Calendar month
    Month,
}

impl Granularity {
    /// Every granularity, finest first
    pub const ALL: [Granularity; 4] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ];

    /// Granularities derived by merging hour rollups
    pub const COARSE: [Granularity; 3] = [Granularity::Day, Granularity::Week, Granularity::Month];

    /// Start of the bucket containing `ts`
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Hour => ts
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts),
            Granularity::Day => midnight(ts.date_naive()),
            Granularity::Week => {
                let date = ts.date_naive();
                let offset = i64::from(date.weekday().num_days_from_monday());
                midnight(date - chrono::Duration::days(offset))
            },
            Granularity::Month => {
                let date = ts.date_naive();
                midnight(date.with_day(1).unwrap_or(date))
            },
        }
    }

    /// Exclusive end of the bucket starting at `start`
    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Hour => start + chrono::Duration::hours(1),
            Granularity::Day => start + chrono::Duration::days(1),
            Granularity::Week => start + chrono::Duration::weeks(1),
            Granularity::Month => start
                .checked_add_months(Months::new(1))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Bucket starts overlapping `[from, to)`, in ascending order
    pub fn buckets_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> {
        let granularity = *self;
        let mut next = (from < to).then(|| granularity.bucket_start(from));
        std::iter::from_fn(move || {
            let current = next?;
            if current >= to {
                return None;
            }
            next = Some(granularity.bucket_end(current));
            Some(current)
        })
    }

    /// Lowercase name used in config files and query strings
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hour" | "hourly" | "1h" => Ok(Granularity::Hour),
            "day" | "daily" | "1d" => Ok(Granularity::Day),
            "week" | "weekly" | "1w" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(StoreError::validation(
                "granularity",
                format!("unknown granularity '{}', expected hour, day, week or month", other),
            )),
        }
    }
}
