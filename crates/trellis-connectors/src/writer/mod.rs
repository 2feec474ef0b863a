pub mod pg;

use async_trait::async_trait;

pub use pg::PgRecordWriter;

use crate::record::DataRecord;
use crate::schema::ResourceInfo;
use trellis_common::TrellisResult;

/// Keywords a record property must not collide with when it becomes a
/// column. Collisions are remapped with a `_col` suffix.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "all", "alter", "and", "any", "as", "asc", "between", "by", "case", "check", "column",
    "constraint", "create", "default", "delete", "desc", "distinct", "drop", "else", "end",
    "exists", "foreign", "from", "grant", "group", "having", "in", "index", "insert", "into",
    "is", "join", "like", "limit", "not", "null", "offset", "on", "or", "order", "primary",
    "references", "select", "set", "table", "then", "to", "union", "unique", "update", "user",
    "using", "when", "where", "with",
];

/// Schema identifier for a connector: structural separators folded to
/// underscores so the id is a valid qualifier.
pub fn schema_qualifier(connector_id: &str) -> String {
    connector_id.replace(['-', '.', '/', ':'], "_")
}

/// Destination table for a resource.
pub fn table_name(resource: &str) -> String {
    resource.to_lowercase()
}

/// Physical column for a record property. A name colliding
/// case-insensitively with a reserved keyword gets a `_col` suffix, with the
/// source casing preserved (`From` becomes `From_col`).
pub fn column_name(property: &str) -> String {
    let lowered = property.to_ascii_lowercase();
    if RESERVED_KEYWORDS.contains(&lowered.as_str()) {
        format!("{property}_col")
    } else {
        property.to_string()
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// DDL issued by one `sync_table_schema` call. Empty when the live table
/// already matches the target schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaSyncReport {
    pub statements: Vec<String>,
}

impl SchemaSyncReport {
    pub fn is_noop(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Translates an abstract resource schema into relational DDL and performs
/// batched upserts. Independent of any specific loader.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Bring the physical table in line with the resource schema. Idempotent:
    /// an unchanged schema issues no DDL.
    async fn sync_table_schema(
        &self,
        connector_id: &str,
        info: &ResourceInfo,
    ) -> TrellisResult<SchemaSyncReport>;

    /// Sync the schema, then upsert all records in one batched statement.
    /// Returns the number of rows written.
    async fn sync_table_records(
        &self,
        connector_id: &str,
        info: &ResourceInfo,
        records: &[DataRecord],
    ) -> TrellisResult<u64>;
}
