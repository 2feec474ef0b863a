use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Persisted state of one connector. Tokens are non-null only while the
/// connector is connected; `is_loading` is true for exactly one in-flight
/// load pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorStatus {
    pub connector_id: String,
    pub is_connected: bool,
    pub is_loading: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Opaque checkpoint interpreted only by the matching loader.
    pub sync_context: Option<JsonValue>,
    /// Deadline for human-in-the-loop consent polling.
    pub asked_to_connect_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-physical-table sync bookkeeping, independent of the connector-level
/// status since one connector may own many tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatus {
    pub id: Uuid,
    pub connector_id: String,
    pub table_name: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
