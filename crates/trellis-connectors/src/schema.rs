use serde::{Deserialize, Serialize};
use trellis_common::{TrellisError, TrellisResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    Json,
    Uuid,
}

impl ColumnType {
    /// The Postgres type this column is stored as.
    pub fn pg_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "bigint",
            ColumnType::Float => "double precision",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamptz",
            ColumnType::Date => "date",
            ColumnType::Json => "jsonb",
            ColumnType::Uuid => "uuid",
        }
    }

    /// The type name `information_schema.columns.data_type` reports for
    /// `pg_type`, used when diffing a live table.
    pub fn introspected_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "bigint",
            ColumnType::Float => "double precision",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp with time zone",
            ColumnType::Date => "date",
            ColumnType::Json => "jsonb",
            ColumnType::Uuid => "uuid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            required: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Abstract schema of one resource, independent of any physical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Explicit primary-key property. When absent the key is inferred; see
    /// `primary_key_column`.
    #[serde(default)]
    pub primary_key: Option<String>,
    pub columns: Vec<ColumnSchema>,
}

impl ResourceSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Resolve the primary-key property.
    ///
    /// An explicitly configured key always wins. Otherwise a property named
    /// `id` is used, then a required `*_id` property, but only when there is
    /// exactly one such candidate. Several candidates are a configuration
    /// error, never a silent guess.
    pub fn primary_key_column(&self) -> TrellisResult<&ColumnSchema> {
        if let Some(explicit) = &self.primary_key {
            return self.column(explicit).ok_or_else(|| {
                TrellisError::Config(format!(
                    "resource {}: primary key column {explicit} is not declared",
                    self.name
                ))
            });
        }

        if let Some(id) = self.column("id") {
            return Ok(id);
        }

        let candidates: Vec<&ColumnSchema> = self
            .columns
            .iter()
            .filter(|c| c.required && c.name.ends_with("_id"))
            .collect();

        match candidates.as_slice() {
            [single] => Ok(single),
            [] => Err(TrellisError::Config(format!(
                "resource {}: no primary key; declare one or add an id column",
                self.name
            ))),
            many => Err(TrellisError::Config(format!(
                "resource {}: ambiguous primary key candidates ({}); set primary_key explicitly",
                self.name,
                many.iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Timestamp column hints used for incremental fetching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimestampColumns {
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Introspection result for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub schema: ResourceSchema,
    #[serde(default)]
    pub timestamp_columns: TimestampColumns,
    #[serde(default)]
    pub record_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(primary_key: Option<&str>, columns: Vec<ColumnSchema>) -> ResourceSchema {
        ResourceSchema {
            name: "events".to_string(),
            description: None,
            primary_key: primary_key.map(String::from),
            columns,
        }
    }

    #[test]
    fn explicit_primary_key_wins() {
        let s = schema(
            Some("event_key"),
            vec![
                ColumnSchema::new("id", ColumnType::Text),
                ColumnSchema::new("event_key", ColumnType::Text).required(),
            ],
        );
        assert_eq!(s.primary_key_column().unwrap().name, "event_key");
    }

    #[test]
    fn explicit_primary_key_must_be_declared() {
        let s = schema(Some("missing"), vec![ColumnSchema::new("id", ColumnType::Text)]);
        assert!(matches!(
            s.primary_key_column(),
            Err(TrellisError::Config(_))
        ));
    }

    #[test]
    fn id_property_is_preferred() {
        let s = schema(
            None,
            vec![
                ColumnSchema::new("account_id", ColumnType::Text).required(),
                ColumnSchema::new("id", ColumnType::Text),
            ],
        );
        assert_eq!(s.primary_key_column().unwrap().name, "id");
    }

    #[test]
    fn single_required_id_suffix_is_inferred() {
        let s = schema(
            None,
            vec![
                ColumnSchema::new("account_id", ColumnType::Text).required(),
                ColumnSchema::new("name", ColumnType::Text),
            ],
        );
        assert_eq!(s.primary_key_column().unwrap().name, "account_id");
    }

    #[test]
    fn multiple_candidates_are_a_config_error() {
        let s = schema(
            None,
            vec![
                ColumnSchema::new("account_id", ColumnType::Text).required(),
                ColumnSchema::new("user_id", ColumnType::Text).required(),
            ],
        );
        let err = s.primary_key_column().unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn no_candidate_is_a_config_error() {
        let s = schema(None, vec![ColumnSchema::new("name", ColumnType::Text)]);
        let err = s.primary_key_column().unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }
}
