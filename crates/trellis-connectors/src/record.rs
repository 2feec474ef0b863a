use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// The unit yielded by a loader and consumed by the writer: a resource tag
/// plus an open map of field name to value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRecord {
    pub resource: String,
    pub fields: Map<String, JsonValue>,
}

impl DataRecord {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            fields: Map::new(),
        }
    }

    /// Build a record from a JSON object. Non-object values yield an empty
    /// field map.
    pub fn from_value(resource: impl Into<String>, value: JsonValue) -> Self {
        let fields = match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            resource: resource.into(),
            fields,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// True when the field exists and is not JSON null.
    pub fn has_value(&self, field: &str) -> bool {
        matches!(self.fields.get(field), Some(v) if !v.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn has_value_rejects_null_and_missing() {
        let record = DataRecord::new("contacts")
            .with_field("id", json!("1"))
            .with_field("deleted_at", json!(null));

        assert!(record.has_value("id"));
        assert!(!record.has_value("deleted_at"));
        assert!(!record.has_value("missing"));
    }

    #[test]
    fn from_value_ignores_non_objects() {
        let record = DataRecord::from_value("contacts", json!([1, 2, 3]));
        assert!(record.fields.is_empty());
    }
}
