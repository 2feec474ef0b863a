use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use trellis_common::{TrellisError, TrellisResult};

/// One resource the connector syncs, with optional timestamp column hints
/// used for incremental fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceBinding {
    pub name: String,
    #[serde(default)]
    pub created_at_column: Option<String>,
    #[serde(default)]
    pub updated_at_column: Option<String>,
}

impl ResourceBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at_column: None,
            updated_at_column: None,
        }
    }
}

/// Immutable definition of one connector: identity, resources, and the
/// loader wiring. The `loader` value is free-form JSON interpreted only by
/// the matching loader constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub resources: Vec<ResourceBinding>,
    pub loader_type: String,
    #[serde(default)]
    pub loader: JsonValue,
}

impl ConnectorConfig {
    pub fn resource_names(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.name.clone()).collect()
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceBinding> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// Load connector definitions from a JSON file.
pub fn load_connector_configs(path: &str) -> TrellisResult<Vec<ConnectorConfig>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| TrellisError::Config(format!("cannot read {path}: {e}")))?;
    serde_json::from_str(&raw)
        .map_err(|e| TrellisError::Config(format!("invalid connector config in {path}: {e}")))
}
