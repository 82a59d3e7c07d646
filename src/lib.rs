//! kpistore - time-partitioned storage for KPI observations.
//!
//! kpistore ingests timestamped KPI measurements from many producers and
//! tenants, keeps them in time-window partitions that age through hot, warm
//! and cold tiers, and maintains continuous rollups so dashboards can read
//! hourly, daily, weekly and monthly aggregates without scanning raw rows.
//!
//! # Architecture
//!
//! - `core`: domain types, errors, clock and configuration
//! - `storage`: partitions, write path, rollover and retention
//! - `rollup`: continuous aggregator and rollup types
//! - `query`: bucketed query engine with row and time budgets
//! - `registry`: KPI definitions for display names
//! - `api`: HTTP surface
//! - `cli`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use kpistore_lib::core::{Config, Observation};
//! use kpistore_lib::storage::ObservationStore;
//!
//! fn main() -> kpistore_lib::Result<()> {
//!     let store = ObservationStore::new(Config::default())?;
//!     let observation = Observation::builder()
//!         .timestamp(chrono::Utc::now())
//!         .metric_id("RL.1.1")
//!         .organization_id("42")
//!         .value(97.5)
//!         .build()?;
//!     let id = store.append(observation)?;
//!     println!("stored {}", id);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod api;
pub mod application;
pub mod cli;
pub mod core;
pub mod query;
pub mod registry;
pub mod rollup;
pub mod storage;

pub use crate::application::Application;
pub use crate::core::{Config, Result};
