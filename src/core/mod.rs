//! Core domain models for kpistore.
//!
//! This module contains the observation record, identifiers, errors,
//! configuration and the time source shared by every other module.

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder, ConfigWatcher, RetentionPolicy};
pub use error::{Result, StoreError};
pub use types::{
    ContextMap, ContextValue, MetricId, Observation, ObservationBuilder, ObservationId,
    OrganizationId, SeriesKey,
};
