//! Read-only lookup of KPI definitions, used only to decorate responses.
//!
//! The store never depends on the registry being reachable: every caller
//! falls back to the raw `kpi_code` when a lookup fails.

use crate::core::{Result, StoreError};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One KPI definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiDefinition {
    /// Registry code referenced by observations
    pub code: String,
    /// Human readable name
    pub name: String,
    /// Longer explanation
    #[serde(default)]
    pub description: Option<String>,
    /// Expected unit of observed values
    #[serde(default)]
    pub unit: Option<String>,
}

/// Upstream source of KPI definitions.
#[async_trait::async_trait]
pub trait KpiRegistry: Send + Sync {
    /// Definition for a code, `None` if the code is unknown
    async fn lookup(&self, kpi_code: &str) -> Result<Option<KpiDefinition>>;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Display name for a code, or the code itself when the registry cannot help
pub async fn display_name(registry: &dyn KpiRegistry, kpi_code: &str) -> String {
    match registry.lookup(kpi_code).await {
        Ok(Some(definition)) => definition.name,
        Ok(None) => kpi_code.to_string(),
        Err(e) => {
            tracing::debug!("KPI registry {} lookup failed for {}: {}", registry.name(), kpi_code, e);
            kpi_code.to_string()
        },
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    kpis: Vec<KpiDefinition>,
}

/// Registry loaded once from a YAML file:
///
/// ```yaml
/// kpis:
///   - code: RL.1.1
///     name: Perfect Order Fulfillment
///     unit: percentage
/// ```
#[derive(Debug, Default, Clone)]
pub struct StaticKpiRegistry {
    definitions: AHashMap<String, KpiDefinition>,
}

impl StaticKpiRegistry {
    /// Registry over the given definitions
    pub fn new<I: IntoIterator<Item = KpiDefinition>>(definitions: I) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.code.clone(), d))
                .collect(),
        }
    }

    /// Parse the YAML registry format
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(yaml)
            .map_err(|e| StoreError::config(format!("Invalid KPI registry: {}", e)))?;
        Ok(Self::new(file.kpis))
    }

    /// Load the YAML registry from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::config(format!("Failed to read KPI registry {:?}: {}", path, e))
        })?;
        let registry = Self::from_yaml(&content)?;
        tracing::info!("Loaded {} KPI definitions from {:?}", registry.len(), path);
        Ok(registry)
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// True if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[async_trait::async_trait]
impl KpiRegistry for StaticKpiRegistry {
    async fn lookup(&self, kpi_code: &str) -> Result<Option<KpiDefinition>> {
        Ok(self.definitions.get(kpi_code).cloned())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Registry that is never reachable
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRegistry;

#[async_trait::async_trait]
impl KpiRegistry for UnavailableRegistry {
    async fn lookup(&self, _kpi_code: &str) -> Result<Option<KpiDefinition>> {
        Err(StoreError::NotFound("KPI registry is not configured".to_string()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
kpis:
  - code: RL.1.1
    name: Perfect Order Fulfillment
    unit: percentage
  - code: AM.1.1
    name: Cost to Serve
"#;

    #[tokio::test]
    async fn test_static_registry_lookup() {
        let registry = StaticKpiRegistry::from_yaml(YAML).unwrap();
        assert_eq!(registry.len(), 2);

        let definition = registry.lookup("RL.1.1").await.unwrap().unwrap();
        assert_eq!(definition.unit.as_deref(), Some("percentage"));
        assert!(registry.lookup("XX.9").await.unwrap().is_none());

        assert_eq!(display_name(&registry, "AM.1.1").await, "Cost to Serve");
        assert_eq!(display_name(&registry, "XX.9").await, "XX.9");
    }

    #[tokio::test]
    async fn test_unavailable_registry_falls_back_to_code() {
        assert_eq!(display_name(&UnavailableRegistry, "RL.1.1").await, "RL.1.1");
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(StaticKpiRegistry::from_yaml("kpis: [ {code: 1").is_err());
    }
}
