use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::time::Instant;

use crate::config::{ConnectorConfig, ResourceBinding};
use crate::loader::{AuthStart, FetchBatch, FetchRequest, Loader, TokenPair};
use crate::record::DataRecord;
use crate::schema::{ColumnSchema, ColumnType, ResourceInfo, ResourceSchema, TimestampColumns};
use trellis_common::{TrellisError, TrellisResult};

fn default_source_schema() -> String {
    "public".to_string()
}

fn default_batch_size() -> i64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresLoaderConfig {
    pub url: String,
    #[serde(default = "default_source_schema")]
    pub schema: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

/// Checkpoint shape: which resource we are on and how far into it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableCheckpoint {
    #[serde(default)]
    resource_index: usize,
    #[serde(default)]
    row_offset: i64,
}

impl TableCheckpoint {
    fn parse(value: Option<&JsonValue>) -> Self {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Loader for a relational source: one full table per resource, fetched in
/// fixed-size LIMIT/OFFSET batches, with an incremental timestamp filter
/// when a prior sync timestamp exists. Credentials are direct; there is no
/// auth flow.
pub struct PostgresLoader {
    config: PostgresLoaderConfig,
    resources: Vec<ResourceBinding>,
    pool: PgPool,
}

impl PostgresLoader {
    pub fn from_config(config: &ConnectorConfig) -> TrellisResult<Self> {
        let loader_config: PostgresLoaderConfig = serde_json::from_value(config.loader.clone())
            .map_err(|e| {
                TrellisError::Config(format!("connector {}: invalid postgres loader config: {e}", config.id))
            })?;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(&loader_config.url)
            .map_err(|e| TrellisError::Config(format!("invalid source database url: {e}")))?;

        Ok(Self {
            config: loader_config,
            resources: config.resources.clone(),
            pool,
        })
    }

    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn qualified(&self, table: &str) -> String {
        format!(
            "{}.{}",
            Self::quote_ident(&self.config.schema),
            Self::quote_ident(table)
        )
    }

    fn map_data_type(data_type: &str) -> ColumnType {
        match data_type {
            "smallint" | "integer" | "bigint" => ColumnType::Integer,
            "real" | "double precision" | "numeric" => ColumnType::Float,
            "boolean" => ColumnType::Boolean,
            "timestamp with time zone" | "timestamp without time zone" => ColumnType::Timestamp,
            "date" => ColumnType::Date,
            "json" | "jsonb" => ColumnType::Json,
            "uuid" => ColumnType::Uuid,
            _ => ColumnType::Text,
        }
    }

    async fn primary_key_of(&self, table: &str) -> TrellisResult<Option<String>> {
        let row = sqlx::query(
            "select kcu.column_name
             from information_schema.table_constraints tc
             join information_schema.key_column_usage kcu
               on kcu.constraint_name = tc.constraint_name
              and kcu.table_schema = tc.table_schema
             where tc.table_schema = $1 and tc.table_name = $2
               and tc.constraint_type = 'PRIMARY KEY'
             order by kcu.ordinal_position
             limit 1",
        )
        .bind(&self.config.schema)
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrellisError::Provider(e.to_string()))?;

        Ok(row.map(|r| r.get("column_name")))
    }

    /// The column used for incremental filtering: the declared hint when
    /// present, otherwise a detected `updated_at`/`created_at` column.
    async fn timestamp_column_for(&self, resource: &str) -> TrellisResult<Option<String>> {
        if let Some(binding) = self.resources.iter().find(|r| r.name == resource) {
            if let Some(col) = binding
                .updated_at_column
                .clone()
                .or_else(|| binding.created_at_column.clone())
            {
                return Ok(Some(col));
            }
        }

        let row = sqlx::query(
            "select column_name from information_schema.columns
             where table_schema = $1 and table_name = $2
               and column_name in ('updated_at', 'created_at')
             order by case column_name when 'updated_at' then 0 else 1 end
             limit 1",
        )
        .bind(&self.config.schema)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrellisError::Provider(e.to_string()))?;

        Ok(row.map(|r| r.get("column_name")))
    }

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        resource: &str,
        offset: i64,
    ) -> TrellisResult<Vec<DataRecord>> {
        let ts_column = self.timestamp_column_for(resource).await?;
        let order_by = match self.primary_key_of(resource).await? {
            Some(pk) => format!("order by {}", Self::quote_ident(&pk)),
            None => String::new(),
        };

        let mut sql = format!(
            "select row_to_json(t)::jsonb as data from {} t",
            self.qualified(resource)
        );
        let incremental = request.last_synced_at.filter(|_| ts_column.is_some());
        if let Some(col) = ts_column.as_deref().filter(|_| incremental.is_some()) {
            sql.push_str(&format!(" where t.{} > $1", Self::quote_ident(col)));
        }
        sql.push_str(&format!(" {order_by} limit {} offset {offset}", self.config.batch_size));

        let query = sqlx::query(&sql);
        let query = match incremental {
            Some(since) => query.bind(since),
            None => query,
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TrellisError::Provider(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| DataRecord::from_value(resource, row.get::<JsonValue, _>("data")))
            .collect())
    }
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn authenticate(
        &self,
        _redirect_to: &str,
        _user_id: Option<&str>,
    ) -> TrellisResult<AuthStart> {
        // Direct database credentials: no auth flow to run.
        Ok(AuthStart::immediate())
    }

    async fn continue_to_authenticate(
        &mut self,
        _code: &str,
        _redirect_to: &str,
    ) -> TrellisResult<TokenPair> {
        Err(TrellisError::Auth(
            "postgres loader does not use a token exchange".to_string(),
        ))
    }

    fn token_pair(&self) -> Option<TokenPair> {
        None
    }

    fn set_token_pair(&mut self, _tokens: TokenPair) {}

    async fn available_resource_names(&self) -> TrellisResult<Vec<String>> {
        let rows = sqlx::query(
            "select table_name from information_schema.tables
             where table_schema = $1 and table_type = 'BASE TABLE'
             order by table_name",
        )
        .bind(&self.config.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrellisError::Provider(e.to_string()))?;

        Ok(rows.into_iter().map(|r| r.get("table_name")).collect())
    }

    async fn resource_info(&self, name: &str) -> TrellisResult<ResourceInfo> {
        let rows = sqlx::query(
            "select column_name, data_type, is_nullable
             from information_schema.columns
             where table_schema = $1 and table_name = $2
             order by ordinal_position",
        )
        .bind(&self.config.schema)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrellisError::Provider(e.to_string()))?;

        if rows.is_empty() {
            return Err(TrellisError::NotFound(format!(
                "resource not found: {name}"
            )));
        }

        let primary_key = self.primary_key_of(name).await?;
        let columns: Vec<ColumnSchema> = rows
            .iter()
            .map(|row| {
                let column_name: String = row.get("column_name");
                let data_type: String = row.get("data_type");
                let is_nullable: String = row.get("is_nullable");
                ColumnSchema {
                    name: column_name,
                    column_type: Self::map_data_type(&data_type),
                    required: is_nullable == "NO",
                    description: None,
                }
            })
            .collect();

        let has = |name: &str| columns.iter().any(|c| c.name == name);
        let timestamp_columns = TimestampColumns {
            created_at: has("created_at").then(|| "created_at".to_string()),
            updated_at: has("updated_at").then(|| "updated_at".to_string()),
        };

        let count_row = sqlx::query(&format!(
            "select count(*) as n from {}",
            self.qualified(name)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Provider(e.to_string()))?;

        Ok(ResourceInfo {
            schema: ResourceSchema {
                name: name.to_string(),
                description: None,
                primary_key,
                columns,
            },
            timestamp_columns,
            record_count: Some(count_row.get("n")),
        })
    }

    async fn fetch_batch(&self, request: FetchRequest) -> TrellisResult<FetchBatch> {
        let started = Instant::now();
        let mut checkpoint = TableCheckpoint::parse(request.checkpoint.as_ref());
        let mut did_work = false;

        loop {
            if checkpoint.resource_index >= request.resources.len() {
                // All resources exhausted: reset progress markers.
                let done = TableCheckpoint::default();
                return Ok(FetchBatch {
                    records: Vec::new(),
                    checkpoint: done.to_value(),
                    has_more: false,
                });
            }

            // Over budget mid-pass: hand back a checkpoint pointing at the
            // exact resource/offset to resume from.
            if did_work {
                if let Some(max) = request.max_duration {
                    if started.elapsed() >= max {
                        return Ok(FetchBatch {
                            records: Vec::new(),
                            checkpoint: checkpoint.to_value(),
                            has_more: true,
                        });
                    }
                }
            }

            let resource = &request.resources[checkpoint.resource_index];
            let records = self
                .fetch_page(&request, resource, checkpoint.row_offset)
                .await?;
            did_work = true;
            let page_full = records.len() as i64 >= self.config.batch_size;

            if page_full {
                checkpoint.row_offset += records.len() as i64;
                return Ok(FetchBatch {
                    records,
                    checkpoint: checkpoint.to_value(),
                    has_more: true,
                });
            }

            // Short page: this resource is done, move to the next one.
            checkpoint.resource_index += 1;
            checkpoint.row_offset = 0;
            let has_more = checkpoint.resource_index < request.resources.len();
            let next = if has_more {
                checkpoint.clone()
            } else {
                TableCheckpoint::default()
            };

            if records.is_empty() && has_more {
                // Nothing on this page; fall through to the next resource
                // within the same call.
                continue;
            }

            return Ok(FetchBatch {
                records,
                checkpoint: next.to_value(),
                has_more,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn loader_config(table_schema: &str, url: &str, batch_size: i64) -> ConnectorConfig {
        ConnectorConfig {
            id: "src-test".to_string(),
            name: "Source test".to_string(),
            description: None,
            resources: vec![ResourceBinding::new("events")],
            loader_type: "postgres".to_string(),
            loader: serde_json::json!({
                "url": url,
                "schema": table_schema,
                "batch_size": batch_size,
            }),
        }
    }

    async fn seed_source(url: &str, schema: &str, rows: i64) -> PgPool {
        let pool = PgPoolOptions::new().connect(url).await.expect("connect");
        sqlx::query(&format!("create schema if not exists \"{schema}\""))
            .execute(&pool)
            .await
            .expect("schema");
        sqlx::query(&format!(
            "create table \"{schema}\".events (
               id text primary key,
               title text,
               updated_at timestamptz not null default now()
             )"
        ))
        .execute(&pool)
        .await
        .expect("table");
        for i in 0..rows {
            sqlx::query(&format!(
                "insert into \"{schema}\".events (id, title) values ($1, $2)"
            ))
            .bind(format!("{i}"))
            .bind(format!("Event {i}"))
            .execute(&pool)
            .await
            .expect("insert");
        }
        pool
    }

    fn test_schema() -> String {
        format!("src_{}", Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn paginates_and_resets_checkpoint() {
        let url = match std::env::var("TEST_DATABASE_URL").ok() {
            Some(u) => u,
            None => return,
        };
        let schema = test_schema();
        let _pool = seed_source(&url, &schema, 3).await;

        let loader =
            PostgresLoader::from_config(&loader_config(&schema, &url, 2)).expect("loader");

        let first = loader
            .fetch_batch(FetchRequest {
                resources: vec!["events".to_string()],
                last_synced_at: None,
                checkpoint: None,
                max_duration: None,
            })
            .await
            .expect("first batch");

        assert_eq!(first.records.len(), 2);
        assert!(first.has_more);
        let cp: TableCheckpoint =
            serde_json::from_value(first.checkpoint.clone()).expect("checkpoint");
        assert_eq!(cp.row_offset, 2);
        assert_eq!(cp.resource_index, 0);

        let second = loader
            .fetch_batch(FetchRequest {
                resources: vec!["events".to_string()],
                last_synced_at: None,
                checkpoint: Some(first.checkpoint),
                max_duration: None,
            })
            .await
            .expect("second batch");

        assert_eq!(second.records.len(), 1);
        assert!(!second.has_more);
        let cp: TableCheckpoint =
            serde_json::from_value(second.checkpoint).expect("checkpoint");
        assert_eq!(cp.resource_index, 0);
        assert_eq!(cp.row_offset, 0);
    }

    #[tokio::test]
    async fn resource_info_detects_key_and_timestamps() {
        let url = match std::env::var("TEST_DATABASE_URL").ok() {
            Some(u) => u,
            None => return,
        };
        let schema = test_schema();
        let _pool = seed_source(&url, &schema, 1).await;

        let loader =
            PostgresLoader::from_config(&loader_config(&schema, &url, 100)).expect("loader");

        let info = loader.resource_info("events").await.expect("info");
        assert_eq!(info.schema.primary_key.as_deref(), Some("id"));
        assert_eq!(info.record_count, Some(1));
        assert_eq!(
            info.timestamp_columns.updated_at.as_deref(),
            Some("updated_at")
        );
        assert!(info.schema.column("title").is_some());

        let err = loader.resource_info("missing").await.unwrap_err();
        assert!(matches!(err, TrellisError::NotFound(_)));
    }

    #[tokio::test]
    async fn incremental_filter_skips_old_rows() {
        let url = match std::env::var("TEST_DATABASE_URL").ok() {
            Some(u) => u,
            None => return,
        };
        let schema = test_schema();
        let _pool = seed_source(&url, &schema, 2).await;

        let loader =
            PostgresLoader::from_config(&loader_config(&schema, &url, 100)).expect("loader");

        let batch = loader
            .fetch_batch(FetchRequest {
                resources: vec!["events".to_string()],
                last_synced_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                checkpoint: None,
                max_duration: None,
            })
            .await
            .expect("batch");

        assert!(batch.records.is_empty());
        assert!(!batch.has_more);
    }
}
