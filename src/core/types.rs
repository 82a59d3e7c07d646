use crate::core::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier handed back for every accepted observation.
///
/// Ids are assigned under the owning partition's write lock, so within one
/// partition they increase in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationId(pub u64);

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the metric being observed (e.g. a SCOR code such as `RL.1.1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricId(String);

/// Tenant that owns an observation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OrganizationId(String);

macro_rules! string_id {
    ($name:ident, $field:literal) => {
        impl $name {
            /// Creates a new identifier after validation
            pub fn new<S: Into<String>>(id: S) -> Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(StoreError::validation($field, "must not be empty"));
                }
                if id.len() > 255 {
                    return Err(StoreError::validation(
                        $field,
                        format!("cannot exceed 255 characters, got {}", id.len()),
                    ));
                }
                Ok(Self(id))
            }

            /// Returns the string representation of the identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true when the identifier carries no usable value
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        // JSON producers send tenant and metric ids as either strings or
        // integers (`"organization_id": 42`); binary encodings always carry a string.
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    #[derive(Deserialize)]
                    #[serde(untagged)]
                    enum Raw {
                        Text(String),
                        Signed(i64),
                        Unsigned(u64),
                    }
                    let id = match Raw::deserialize(deserializer)? {
                        Raw::Text(s) => s,
                        Raw::Signed(n) => n.to_string(),
                        Raw::Unsigned(n) => n.to_string(),
                    };
                    Self::new(id).map_err(serde::de::Error::custom)
                } else {
                    Self::new(String::deserialize(deserializer)?).map_err(serde::de::Error::custom)
                }
            }
        }
    };
}

string_id!(MetricId, "metric_id");
string_id!(OrganizationId, "organization_id");

/// A scalar dimension value in an observation's context bag.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    /// Free-form text (region, facility, product line)
    Text(String),
    /// Numeric dimension
    Number(f64),
}

impl ContextValue {
    /// Compares against a filter value supplied as text (query strings are untyped).
    pub fn matches_str(&self, expected: &str) -> bool {
        match self {
            ContextValue::Text(s) => s == expected,
            ContextValue::Number(n) => expected.parse::<f64>().map_or(false, |e| e == *n),
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Text(s) => write!(f, "{}", s),
            ContextValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Number(value)
    }
}

#[derive(Serialize, Deserialize)]
enum TaggedContextValue {
    Text(String),
    Number(f64),
}

impl Serialize for ContextValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match self {
                ContextValue::Text(s) => serializer.serialize_str(s),
                ContextValue::Number(n) => serializer.serialize_f64(*n),
            }
        } else {
            match self {
                ContextValue::Text(s) => TaggedContextValue::Text(s.clone()),
                ContextValue::Number(n) => TaggedContextValue::Number(*n),
            }
            .serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ContextValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Plain {
                Number(f64),
                Text(String),
                Flag(bool),
            }
            match Plain::deserialize(deserializer)? {
                Plain::Number(n) => Ok(ContextValue::Number(n)),
                Plain::Text(s) => Ok(ContextValue::Text(s)),
                Plain::Flag(_) => Err(de::Error::custom(
                    "context values must be strings or numbers",
                )),
            }
        } else {
            Ok(match TaggedContextValue::deserialize(deserializer)? {
                TaggedContextValue::Text(s) => ContextValue::Text(s),
                TaggedContextValue::Number(n) => ContextValue::Number(n),
            })
        }
    }
}

/// Open set of additional dimensions (region, product_line, facility, ...)
pub type ContextMap = BTreeMap<String, ContextValue>;

/// A single timestamped KPI measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Instant the value was recorded; decides partition placement
    pub timestamp: DateTime<Utc>,
    /// Metric being observed
    pub metric_id: MetricId,
    /// KPI definition that produced the value, if known
    #[serde(default)]
    pub kpi_code: Option<String>,
    /// Measured value; rates, durations and costs are never negative
    pub value: f64,
    /// Semantic unit (percentage, days, dollars, count)
    #[serde(default)]
    pub unit: Option<String>,
    /// Start of the window the value summarizes
    #[serde(default)]
    pub observation_period_start: Option<DateTime<Utc>>,
    /// End of the window the value summarizes
    #[serde(default)]
    pub observation_period_end: Option<DateTime<Utc>>,
    /// Owning tenant
    pub organization_id: OrganizationId,
    /// Business process dimension
    #[serde(default)]
    pub process_id: Option<String>,
    /// Unconstrained extra dimensions
    #[serde(default)]
    pub context: ContextMap,
    /// Producer's confidence in the value, within [0, 1]
    #[serde(default)]
    pub confidence_level: Option<f64>,
    /// Where the value came from
    #[serde(default)]
    pub data_source: Option<String>,
    /// Free-form notes
    #[serde(default)]
    pub notes: Option<String>,
}

impl Observation {
    /// Creates a new observation builder
    pub fn builder() -> ObservationBuilder {
        ObservationBuilder::default()
    }

    /// Checks every write-time invariant. Nothing is mutated on failure.
    pub fn validate(&self) -> Result<()> {
        if self.metric_id.is_blank() {
            return Err(StoreError::validation("metric_id", "must not be empty"));
        }
        if self.organization_id.is_blank() {
            return Err(StoreError::validation("organization_id", "must not be empty"));
        }
        if !self.value.is_finite() {
            return Err(StoreError::validation(
                "value",
                format!("must be a finite number, got {}", self.value),
            ));
        }
        if self.value < 0.0 {
            return Err(StoreError::validation(
                "value",
                format!("must be non-negative, got {}", self.value),
            ));
        }
        if let Some(confidence) = self.confidence_level {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(StoreError::validation(
                    "confidence_level",
                    format!("must be between 0.0 and 1.0, got {}", confidence),
                ));
            }
        }
        if let (Some(start), Some(end)) = (self.observation_period_start, self.observation_period_end)
        {
            if start > end {
                return Err(StoreError::validation(
                    "observation_period_start",
                    format!("period start {} is after period end {}", start, end),
                ));
            }
        }
        Ok(())
    }

    /// Returns the series this observation belongs to
    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.metric_id.clone(), self.organization_id.clone())
    }

    /// Timestamp in epoch milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Gets a context value by key
    pub fn context_value(&self, key: &str) -> Option<&ContextValue> {
        self.context.get(key)
    }
}

/// Builder for observations; `build` runs the same validation as the write path.
#[derive(Debug, Default)]
pub struct ObservationBuilder {
    timestamp: Option<DateTime<Utc>>,
    metric_id: Option<String>,
    kpi_code: Option<String>,
    value: Option<f64>,
    unit: Option<String>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    organization_id: Option<String>,
    process_id: Option<String>,
    context: ContextMap,
    confidence_level: Option<f64>,
    data_source: Option<String>,
    notes: Option<String>,
}

impl ObservationBuilder {
    /// Sets the recording instant
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the metric id
    pub fn metric_id<S: Into<String>>(mut self, metric_id: S) -> Self {
        self.metric_id = Some(metric_id.into());
        self
    }

    /// Sets the KPI code
    pub fn kpi_code<S: Into<String>>(mut self, code: S) -> Self {
        self.kpi_code = Some(code.into());
        self
    }

    /// Sets the measured value
    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Sets the unit
    pub fn unit<S: Into<String>>(mut self, unit: S) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Sets the summarized period
    pub fn period(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.period_start = Some(start);
        self.period_end = Some(end);
        self
    }

    /// Sets the owning organization
    pub fn organization_id<S: Into<String>>(mut self, organization_id: S) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Sets the process dimension
    pub fn process_id<S: Into<String>>(mut self, process_id: S) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    /// Adds a context dimension
    pub fn context<K: Into<String>, V: Into<ContextValue>>(mut self, key: K, value: V) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the confidence level
    pub fn confidence_level(mut self, confidence: f64) -> Self {
        self.confidence_level = Some(confidence);
        self
    }

    /// Sets the data source
    pub fn data_source<S: Into<String>>(mut self, source: S) -> Self {
        self.data_source = Some(source.into());
        self
    }

    /// Sets free-form notes
    pub fn notes<S: Into<String>>(mut self, notes: S) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Builds the observation, validating it
    pub fn build(self) -> Result<Observation> {
        let observation = Observation {
            timestamp: self
                .timestamp
                .ok_or_else(|| StoreError::validation("timestamp", "is required"))?,
            metric_id: MetricId::new(
                self.metric_id
                    .ok_or_else(|| StoreError::validation("metric_id", "is required"))?,
            )?,
            kpi_code: self.kpi_code,
            value: self
                .value
                .ok_or_else(|| StoreError::validation("value", "is required"))?,
            unit: self.unit,
            observation_period_start: self.period_start,
            observation_period_end: self.period_end,
            organization_id: OrganizationId::new(
                self.organization_id
                    .ok_or_else(|| StoreError::validation("organization_id", "is required"))?,
            )?,
            process_id: self.process_id,
            context: self.context,
            confidence_level: self.confidence_level,
            data_source: self.data_source,
            notes: self.notes,
        };
        observation.validate()?;
        Ok(observation)
    }

    /// Builds without validation; lets tests hand invalid records to the write path
    pub fn build_unchecked(self) -> Observation {
        Observation {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            metric_id: MetricId(self.metric_id.unwrap_or_default()),
            kpi_code: self.kpi_code,
            value: self.value.unwrap_or_default(),
            unit: self.unit,
            observation_period_start: self.period_start,
            observation_period_end: self.period_end,
            organization_id: OrganizationId(self.organization_id.unwrap_or_default()),
            process_id: self.process_id,
            context: self.context,
            confidence_level: self.confidence_level,
            data_source: self.data_source,
            notes: self.notes,
        }
    }
}

/// The two always-present dimensions rollups are built over
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Metric id
    pub metric_id: MetricId,
    /// Organization id
    pub organization_id: OrganizationId,
}

impl SeriesKey {
    /// Creates a series key
    pub fn new(metric_id: MetricId, organization_id: OrganizationId) -> Self {
        Self {
            metric_id,
            organization_id,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.metric_id, self.organization_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> ObservationBuilder {
        Observation::builder()
            .timestamp(Utc.with_ymd_and_hms(2024, 3, 15, 10, 5, 0).unwrap())
            .metric_id("RL.1.1")
            .organization_id("42")
            .value(98.5)
    }

    #[test]
    fn test_builder_valid() {
        let obs = base()
            .kpi_code("POF")
            .unit("percentage")
            .context("region", "EU")
            .context("facility_no", 7.0)
            .confidence_level(0.9)
            .build()
            .unwrap();
        assert_eq!(obs.metric_id.as_str(), "RL.1.1");
        assert_eq!(obs.context_value("region"), Some(&ContextValue::from("EU")));
        assert!(obs.context_value("facility_no").unwrap().matches_str("7"));
    }

    #[test]
    fn test_negative_value_rejected() {
        let err = base().value(-5.0).build().unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_confidence_out_of_range() {
        assert!(base().confidence_level(1.5).build().is_err());
        assert!(base().confidence_level(-0.1).build().is_err());
        assert!(base().confidence_level(1.0).build().is_ok());
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(base().metric_id("").build().is_err());
        assert!(base().organization_id("  ").build().is_err());
    }

    #[test]
    fn test_inverted_period_rejected() {
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert!(base().period(start, end).build().is_err());
    }

    #[test]
    fn test_json_accepts_numeric_organization() {
        let json = r#"{
            "timestamp": "2024-03-15T10:05:00Z",
            "metric_id": "RL.1.1",
            "value": 98.5,
            "organization_id": 42,
            "context": {"region": "EU", "line": 3}
        }"#;
        let obs: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.organization_id.as_str(), "42");
        assert_eq!(obs.context.get("line"), Some(&ContextValue::Number(3.0)));
    }

    #[test]
    fn test_json_rejects_invalid_ids() {
        let record = |metric: &str, organization: serde_json::Value| {
            serde_json::json!({
                "timestamp": "2024-03-15T10:05:00Z",
                "metric_id": metric,
                "organization_id": organization,
                "value": 98.5
            })
        };

        let long = "M".repeat(256);
        let err = serde_json::from_value::<Observation>(record(&long, "42".into())).unwrap_err();
        assert!(err.to_string().contains("255"), "{}", err);

        assert!(serde_json::from_value::<Observation>(record("   ", "42".into())).is_err());
        assert!(serde_json::from_value::<Observation>(record("RL.1.1", "".into())).is_err());
        assert!(serde_json::from_value::<Observation>(record(&"M".repeat(255), 42.into())).is_ok());
        assert!(serde_json::from_str::<OrganizationId>(&format!("\"{}\"", "7".repeat(300))).is_err());
    }

    #[test]
    fn test_binary_encoding_keeps_context() {
        let obs = base().context("region", "EU").context("line", 3.0).build().unwrap();
        let bytes = bincode::serialize(&obs).unwrap();
        let decoded: Observation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, obs);
    }
}
