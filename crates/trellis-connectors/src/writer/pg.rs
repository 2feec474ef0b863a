use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::record::DataRecord;
use crate::schema::{ColumnSchema, ColumnType, ResourceInfo};
use crate::writer::{
    column_name, quote_ident, schema_qualifier, table_name, RecordWriter, SchemaSyncReport,
};
use trellis_db::connector::repositories::TableStatusRepository;
use trellis_common::{TrellisError, TrellisResult};

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Dates outside this range are provider noise (year-zero placeholders,
/// five-digit years) and are written as null instead of aborting the batch.
fn sane_year(year: i32) -> bool {
    (1000..=9999).contains(&year)
}

fn json_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn json_to_i64(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn json_to_f64(value: &JsonValue) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn json_to_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| naive.and_utc())
        })
        .ok()?;
    sane_year(parsed.year()).then_some(parsed)
}

fn json_to_date(value: &JsonValue) -> Option<NaiveDate> {
    let raw = value.as_str()?;
    let prefix = raw.get(..10).unwrap_or(raw);
    let parsed = NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()?;
    sane_year(parsed.year()).then_some(parsed)
}

fn json_to_uuid(value: &JsonValue) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::from_str(s).ok())
}

fn push_bind_value(
    b: &mut Separated<'_, '_, Postgres, &'static str>,
    value: Option<&JsonValue>,
    column: &ColumnSchema,
) {
    match column.column_type {
        ColumnType::Text => b.push_bind(value.and_then(json_to_text)),
        ColumnType::Integer => b.push_bind(value.and_then(json_to_i64)),
        ColumnType::Float => b.push_bind(value.and_then(json_to_f64)),
        ColumnType::Boolean => b.push_bind(value.and_then(|v| v.as_bool())),
        ColumnType::Timestamp => b.push_bind(value.and_then(json_to_timestamp)),
        ColumnType::Date => b.push_bind(value.and_then(json_to_date)),
        ColumnType::Json => b.push_bind(value.filter(|v| !v.is_null()).cloned()),
        ColumnType::Uuid => b.push_bind(value.and_then(json_to_uuid)),
    };
}

struct ExistingColumn {
    data_type: String,
    nullable: bool,
}

/// Writer backed by the destination Postgres: one schema per connector, one
/// table per resource, diffed DDL and single-statement batched upserts.
pub struct PgRecordWriter {
    pool: PgPool,
    table_status: Arc<dyn TableStatusRepository>,
}

impl PgRecordWriter {
    pub fn new(pool: PgPool, table_status: Arc<dyn TableStatusRepository>) -> Self {
        Self { pool, table_status }
    }

    async fn schema_exists(&self, qualifier: &str) -> TrellisResult<bool> {
        let row = sqlx::query(
            "select exists(select 1 from information_schema.schemata where schema_name = $1) as present",
        )
        .bind(qualifier)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Ok(row.get("present"))
    }

    async fn existing_columns(
        &self,
        qualifier: &str,
        table: &str,
    ) -> TrellisResult<HashMap<String, ExistingColumn>> {
        let rows = sqlx::query(
            "select column_name, data_type, is_nullable
             from information_schema.columns
             where table_schema = $1 and table_name = $2",
        )
        .bind(qualifier)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let nullable: String = row.get("is_nullable");
                (
                    row.get("column_name"),
                    ExistingColumn {
                        data_type: row.get("data_type"),
                        nullable: nullable == "YES",
                    },
                )
            })
            .collect())
    }

    async fn current_primary_key(
        &self,
        qualifier: &str,
        table: &str,
    ) -> TrellisResult<Option<(String, String)>> {
        let row = sqlx::query(
            "select tc.constraint_name, kcu.column_name
             from information_schema.table_constraints tc
             join information_schema.key_column_usage kcu
               on kcu.constraint_name = tc.constraint_name
              and kcu.table_schema = tc.table_schema
             where tc.table_schema = $1 and tc.table_name = $2
               and tc.constraint_type = 'PRIMARY KEY'
             order by kcu.ordinal_position
             limit 1",
        )
        .bind(qualifier)
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Ok(row.map(|r| (r.get("constraint_name"), r.get("column_name"))))
    }

    fn create_table_statements(
        qualified: &str,
        info: &ResourceInfo,
        targets: &[(String, &ColumnSchema)],
        pk_physical: &str,
    ) -> Vec<String> {
        let mut statements = Vec::new();

        let column_defs: Vec<String> = targets
            .iter()
            .map(|(physical, column)| {
                let mut def = format!("{} {}", quote_ident(physical), column.column_type.pg_type());
                if column.required || physical == pk_physical {
                    def.push_str(" not null");
                }
                def
            })
            .collect();

        statements.push(format!(
            "create table {qualified} ({}, primary key ({}))",
            column_defs.join(", "),
            quote_ident(pk_physical)
        ));

        if let Some(description) = &info.schema.description {
            statements.push(format!(
                "comment on table {qualified} is {}",
                quote_literal(description)
            ));
        }
        for (physical, column) in targets {
            if let Some(description) = &column.description {
                statements.push(format!(
                    "comment on column {qualified}.{} is {}",
                    quote_ident(physical),
                    quote_literal(description)
                ));
            }
        }

        statements
    }

    fn diff_table_statements(
        qualified: &str,
        targets: &[(String, &ColumnSchema)],
        existing: &HashMap<String, ExistingColumn>,
        current_pk: Option<&(String, String)>,
        pk_physical: &str,
    ) -> Vec<String> {
        let mut statements = Vec::new();

        for (physical, column) in targets {
            let target_required = column.required || physical == pk_physical;
            match existing.get(physical) {
                None => {
                    let mut def = format!(
                        "alter table {qualified} add column {} {}",
                        quote_ident(physical),
                        column.column_type.pg_type()
                    );
                    if target_required {
                        def.push_str(" not null");
                    }
                    statements.push(def);
                    if let Some(description) = &column.description {
                        statements.push(format!(
                            "comment on column {qualified}.{} is {}",
                            quote_ident(physical),
                            quote_literal(description)
                        ));
                    }
                }
                Some(live) => {
                    if live.data_type != column.column_type.introspected_type() {
                        statements.push(format!(
                            "alter table {qualified} alter column {} type {} using {}::{}",
                            quote_ident(physical),
                            column.column_type.pg_type(),
                            quote_ident(physical),
                            column.column_type.pg_type()
                        ));
                    }
                    if live.nullable && target_required {
                        statements.push(format!(
                            "alter table {qualified} alter column {} set not null",
                            quote_ident(physical)
                        ));
                    }
                    if !live.nullable && !target_required {
                        statements.push(format!(
                            "alter table {qualified} alter column {} drop not null",
                            quote_ident(physical)
                        ));
                    }
                }
            }
        }

        // Relocate the primary key if it moved.
        match current_pk {
            Some((constraint, column)) if column != pk_physical => {
                statements.push(format!(
                    "alter table {qualified} drop constraint {}",
                    quote_ident(constraint)
                ));
                statements.push(format!(
                    "alter table {qualified} add primary key ({})",
                    quote_ident(pk_physical)
                ));
            }
            None => statements.push(format!(
                "alter table {qualified} add primary key ({})",
                quote_ident(pk_physical)
            )),
            _ => {}
        }

        // Drop columns no longer in the target schema.
        for name in existing.keys() {
            if !targets.iter().any(|(physical, _)| physical == name) {
                statements.push(format!(
                    "alter table {qualified} drop column {}",
                    quote_ident(name)
                ));
            }
        }

        statements
    }
}

#[async_trait]
impl RecordWriter for PgRecordWriter {
    async fn sync_table_schema(
        &self,
        connector_id: &str,
        info: &ResourceInfo,
    ) -> TrellisResult<SchemaSyncReport> {
        let qualifier = schema_qualifier(connector_id);
        let table = table_name(&info.schema.name);
        let qualified = format!("{}.{}", quote_ident(&qualifier), quote_ident(&table));

        let pk = info.schema.primary_key_column()?;
        let pk_physical = column_name(&pk.name);

        let targets: Vec<(String, &ColumnSchema)> = info
            .schema
            .columns
            .iter()
            .map(|column| (column_name(&column.name), column))
            .collect();

        let mut statements = Vec::new();

        if !self.schema_exists(&qualifier).await? {
            statements.push(format!("create schema if not exists {}", quote_ident(&qualifier)));
        }

        let existing = self.existing_columns(&qualifier, &table).await?;
        if existing.is_empty() {
            statements.extend(Self::create_table_statements(
                &qualified,
                info,
                &targets,
                &pk_physical,
            ));
        } else {
            let current_pk = self.current_primary_key(&qualifier, &table).await?;
            statements.extend(Self::diff_table_statements(
                &qualified,
                &targets,
                &existing,
                current_pk.as_ref(),
                &pk_physical,
            ));
        }

        for statement in &statements {
            tracing::debug!(statement, "applying schema change");
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| TrellisError::Database(format!("{statement}: {e}")))?;
        }

        self.table_status.touch(connector_id, &table).await?;

        Ok(SchemaSyncReport { statements })
    }

    async fn sync_table_records(
        &self,
        connector_id: &str,
        info: &ResourceInfo,
        records: &[DataRecord],
    ) -> TrellisResult<u64> {
        self.sync_table_schema(connector_id, info).await?;

        let table = table_name(&info.schema.name);
        if records.is_empty() {
            self.table_status.touch(connector_id, &table).await?;
            return Ok(0);
        }

        let qualifier = schema_qualifier(connector_id);
        let qualified = format!("{}.{}", quote_ident(&qualifier), quote_ident(&table));
        let pk = info.schema.primary_key_column()?;
        let pk_physical = column_name(&pk.name);

        let targets: Vec<(String, &ColumnSchema)> = info
            .schema
            .columns
            .iter()
            .map(|column| (column_name(&column.name), column))
            .collect();

        let column_list: Vec<String> = targets
            .iter()
            .map(|(physical, _)| quote_ident(physical))
            .collect();

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("insert into {qualified} ({}) ", column_list.join(", ")));

        qb.push_values(records, |mut b, record| {
            for (_, column) in &targets {
                push_bind_value(&mut b, record.fields.get(&column.name), column);
            }
        });

        qb.push(format!(" on conflict ({}) do ", quote_ident(&pk_physical)));

        let update_columns: Vec<String> = targets
            .iter()
            .filter(|(physical, _)| physical != &pk_physical)
            .map(|(physical, _)| {
                format!("{} = excluded.{}", quote_ident(physical), quote_ident(physical))
            })
            .collect();

        if update_columns.is_empty() {
            qb.push("nothing");
        } else {
            qb.push("update set ");
            qb.push(update_columns.join(", "));
        }

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        self.table_status.touch(connector_id, &table).await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ResourceSchema, TimestampColumns};
    use serde_json::json;
    use trellis_db::connector::pg_repository::PgTableStatusRepository;
    use trellis_db::{create_pool, ensure_tables};

    async fn test_writer() -> Option<(PgRecordWriter, PgPool)> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");
        ensure_tables(&pool).await.ok()?;
        let table_status = Arc::new(PgTableStatusRepository::new(pool.clone()));
        Some((PgRecordWriter::new(pool.clone(), table_status), pool))
    }

    fn unique_connector(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    fn event_info() -> ResourceInfo {
        ResourceInfo {
            schema: ResourceSchema {
                name: "TestEvent".to_string(),
                description: Some("Calendar events".to_string()),
                primary_key: None,
                columns: vec![
                    ColumnSchema::new("id", ColumnType::Text).required(),
                    ColumnSchema::new("title", ColumnType::Text),
                ],
            },
            timestamp_columns: TimestampColumns::default(),
            record_count: None,
        }
    }

    fn record(resource: &str, fields: JsonValue) -> DataRecord {
        DataRecord::from_value(resource, fields)
    }

    #[tokio::test]
    async fn schema_sync_is_idempotent() {
        let (writer, _pool) = match test_writer().await {
            Some(w) => w,
            None => return,
        };
        let connector = unique_connector("idem");

        let first = writer
            .sync_table_schema(&connector, &event_info())
            .await
            .expect("first sync");
        assert!(!first.is_noop());

        let second = writer
            .sync_table_schema(&connector, &event_info())
            .await
            .expect("second sync");
        assert!(
            second.is_noop(),
            "unchanged schema issued DDL: {:?}",
            second.statements
        );
    }

    #[tokio::test]
    async fn upsert_same_key_keeps_latest_values() {
        let (writer, pool) = match test_writer().await {
            Some(w) => w,
            None => return,
        };
        let connector = unique_connector("upsert");
        let info = event_info();

        writer
            .sync_table_records(
                &connector,
                &info,
                &[record("TestEvent", json!({"id": "1", "title": "first"}))],
            )
            .await
            .expect("insert");
        writer
            .sync_table_records(
                &connector,
                &info,
                &[record("TestEvent", json!({"id": "1", "title": "second"}))],
            )
            .await
            .expect("update");

        let qualified = format!(
            "{}.{}",
            quote_ident(&schema_qualifier(&connector)),
            quote_ident("testevent")
        );
        let rows = sqlx::query(&format!("select id, title from {qualified}"))
            .fetch_all(&pool)
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String, _>("title"), "second");
    }

    #[tokio::test]
    async fn keyword_properties_map_to_suffixed_columns() {
        let (writer, pool) = match test_writer().await {
            Some(w) => w,
            None => return,
        };
        let connector = unique_connector("kw");

        let info = ResourceInfo {
            schema: ResourceSchema {
                name: "queries".to_string(),
                description: None,
                primary_key: None,
                columns: vec![
                    ColumnSchema::new("id", ColumnType::Text).required(),
                    ColumnSchema::new("select", ColumnType::Text),
                    ColumnSchema::new("From", ColumnType::Text),
                    ColumnSchema::new("where", ColumnType::Text),
                ],
            },
            timestamp_columns: TimestampColumns::default(),
            record_count: None,
        };

        writer
            .sync_table_schema(&connector, &info)
            .await
            .expect("sync");

        let rows = sqlx::query(
            "select column_name from information_schema.columns
             where table_schema = $1 and table_name = 'queries'
             order by ordinal_position",
        )
        .bind(schema_qualifier(&connector))
        .fetch_all(&pool)
        .await
        .expect("introspect");

        let names: Vec<String> = rows.iter().map(|r| r.get("column_name")).collect();
        assert_eq!(names, vec!["id", "select_col", "From_col", "where_col"]);
    }

    #[tokio::test]
    async fn out_of_range_dates_become_null_without_dropping_rows() {
        let (writer, pool) = match test_writer().await {
            Some(w) => w,
            None => return,
        };
        let connector = unique_connector("dates");

        let info = ResourceInfo {
            schema: ResourceSchema {
                name: "entries".to_string(),
                description: None,
                primary_key: None,
                columns: vec![
                    ColumnSchema::new("id", ColumnType::Text).required(),
                    ColumnSchema::new("created_at", ColumnType::Timestamp),
                    ColumnSchema::new("updated_at", ColumnType::Timestamp),
                ],
            },
            timestamp_columns: TimestampColumns::default(),
            record_count: None,
        };

        let valid = "2024-05-01T12:00:00Z";
        let records = vec![
            record("entries", json!({"id": "a", "created_at": "0000-12-31T00:00:00Z", "updated_at": valid})),
            record("entries", json!({"id": "b", "created_at": "0999-12-31T00:00:00Z", "updated_at": valid})),
            record("entries", json!({"id": "c", "created_at": "10000-01-01T00:00:00Z", "updated_at": valid})),
        ];

        let written = writer
            .sync_table_records(&connector, &info, &records)
            .await
            .expect("write");
        assert_eq!(written, 3);

        let qualified = format!(
            "{}.{}",
            quote_ident(&schema_qualifier(&connector)),
            quote_ident("entries")
        );
        let rows = sqlx::query(&format!(
            "select id, created_at, updated_at from {qualified} order by id"
        ))
        .fetch_all(&pool)
        .await
        .expect("select");

        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert!(row.get::<Option<DateTime<Utc>>, _>("created_at").is_none());
            assert!(row.get::<Option<DateTime<Utc>>, _>("updated_at").is_some());
        }
    }

    #[tokio::test]
    async fn schema_diff_adds_and_drops_columns() {
        let (writer, pool) = match test_writer().await {
            Some(w) => w,
            None => return,
        };
        let connector = unique_connector("evolve");

        writer
            .sync_table_schema(&connector, &event_info())
            .await
            .expect("initial");

        let mut evolved = event_info();
        evolved.schema.columns.retain(|c| c.name != "title");
        evolved
            .schema
            .columns
            .push(ColumnSchema::new("starts_at", ColumnType::Timestamp));

        let report = writer
            .sync_table_schema(&connector, &evolved)
            .await
            .expect("evolve");
        assert!(report
            .statements
            .iter()
            .any(|s| s.contains("add column") && s.contains("starts_at")));
        assert!(report
            .statements
            .iter()
            .any(|s| s.contains("drop column") && s.contains("title")));

        let rows = sqlx::query(
            "select column_name from information_schema.columns
             where table_schema = $1 and table_name = 'testevent'
             order by ordinal_position",
        )
        .bind(schema_qualifier(&connector))
        .fetch_all(&pool)
        .await
        .expect("introspect");

        let names: Vec<String> = rows.iter().map(|r| r.get("column_name")).collect();
        assert_eq!(names, vec!["id", "starts_at"]);
    }

    #[tokio::test]
    async fn json_values_serialize_arrays_and_objects() {
        let (writer, pool) = match test_writer().await {
            Some(w) => w,
            None => return,
        };
        let connector = unique_connector("json");

        let info = ResourceInfo {
            schema: ResourceSchema {
                name: "docs".to_string(),
                description: None,
                primary_key: None,
                columns: vec![
                    ColumnSchema::new("id", ColumnType::Text).required(),
                    ColumnSchema::new("tags", ColumnType::Json),
                ],
            },
            timestamp_columns: TimestampColumns::default(),
            record_count: None,
        };

        writer
            .sync_table_records(
                &connector,
                &info,
                &[record("docs", json!({"id": "1", "tags": ["a", "b"]}))],
            )
            .await
            .expect("write");

        let qualified = format!(
            "{}.{}",
            quote_ident(&schema_qualifier(&connector)),
            quote_ident("docs")
        );
        let row = sqlx::query(&format!("select tags from {qualified}"))
            .fetch_one(&pool)
            .await
            .expect("select");
        assert_eq!(row.get::<JsonValue, _>("tags"), json!(["a", "b"]));
    }

    #[test]
    fn timestamp_coercion_rules() {
        assert!(json_to_timestamp(&json!("2024-05-01T12:00:00Z")).is_some());
        assert!(json_to_timestamp(&json!("0000-12-31T00:00:00Z")).is_none());
        assert!(json_to_timestamp(&json!("0999-12-31T00:00:00Z")).is_none());
        assert!(json_to_timestamp(&json!("10000-01-01T00:00:00Z")).is_none());
        assert!(json_to_timestamp(&json!(null)).is_none());
        assert!(json_to_timestamp(&json!("not a date")).is_none());
    }
}
