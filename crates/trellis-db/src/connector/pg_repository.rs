use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::connector::models::{ConnectorStatus, TableStatus};
use crate::connector::repositories::{ConnectorStatusRepository, TableStatusRepository};
use trellis_common::{TrellisError, TrellisResult};

const STATUS_COLUMNS: &str = "connector_id, is_connected, is_loading, access_token, refresh_token, \
     token_expires_at, last_connected_at, last_synced_at, last_error, sync_context, \
     asked_to_connect_until, created_at, updated_at";

#[derive(Clone)]
pub struct PgConnectorStatusRepository {
    pool: PgPool,
}

impl PgConnectorStatusRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> TrellisResult<ConnectorStatus> {
        Ok(ConnectorStatus {
            connector_id: row.get("connector_id"),
            is_connected: row.get("is_connected"),
            is_loading: row.get("is_loading"),
            access_token: row.get("access_token"),
            refresh_token: row.get("refresh_token"),
            token_expires_at: row.get("token_expires_at"),
            last_connected_at: row.get("last_connected_at"),
            last_synced_at: row.get("last_synced_at"),
            last_error: row.get("last_error"),
            sync_context: row.get("sync_context"),
            asked_to_connect_until: row.get("asked_to_connect_until"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl ConnectorStatusRepository for PgConnectorStatusRepository {
    async fn get_or_create(&self, connector_id: &str) -> TrellisResult<ConnectorStatus> {
        let row = sqlx::query(&format!(
            "insert into connector_status (connector_id)
             values ($1)
             on conflict (connector_id) do update set updated_at = now()
             returning {STATUS_COLUMNS}"
        ))
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn get(&self, connector_id: &str) -> TrellisResult<Option<ConnectorStatus>> {
        let row = sqlx::query(&format!(
            "select {STATUS_COLUMNS} from connector_status where connector_id = $1"
        ))
        .bind(connector_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::map_row(r)?)),
            None => Ok(None),
        }
    }

    async fn set_connected(
        &self,
        connector_id: &str,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> TrellisResult<ConnectorStatus> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "update connector_status
             set is_connected = true, access_token = $1, refresh_token = $2,
                 token_expires_at = $3, last_connected_at = $4, last_error = null, updated_at = $4
             where connector_id = $5
             returning {STATUS_COLUMNS}"
        ))
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expires_at)
        .bind(now)
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn set_disconnected(&self, connector_id: &str) -> TrellisResult<ConnectorStatus> {
        let row = sqlx::query(&format!(
            "update connector_status
             set is_connected = false, access_token = null, refresh_token = null,
                 token_expires_at = null, updated_at = now()
             where connector_id = $1
             returning {STATUS_COLUMNS}"
        ))
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn try_begin_load(&self, connector_id: &str) -> TrellisResult<Option<ConnectorStatus>> {
        let row = sqlx::query(&format!(
            "update connector_status
             set is_loading = true, last_error = null, updated_at = $1
             where connector_id = $2 and is_loading = false
             returning {STATUS_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(connector_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::map_row(r)?)),
            None => Ok(None),
        }
    }

    async fn save_sync_context(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus> {
        let row = sqlx::query(&format!(
            "update connector_status
             set sync_context = $1, updated_at = now()
             where connector_id = $2
             returning {STATUS_COLUMNS}"
        ))
        .bind(sync_context)
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn finish_load_success(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "update connector_status
             set is_loading = false, last_synced_at = $1, sync_context = $2,
                 last_error = null, updated_at = $1
             where connector_id = $3
             returning {STATUS_COLUMNS}"
        ))
        .bind(now)
        .bind(sync_context)
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn finish_load_partial(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus> {
        let row = sqlx::query(&format!(
            "update connector_status
             set is_loading = false, sync_context = $1, updated_at = now()
             where connector_id = $2
             returning {STATUS_COLUMNS}"
        ))
        .bind(sync_context)
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn finish_load_error(
        &self,
        connector_id: &str,
        error: &str,
    ) -> TrellisResult<ConnectorStatus> {
        let row = sqlx::query(&format!(
            "update connector_status
             set is_loading = false, last_error = $1, updated_at = $2
             where connector_id = $3
             returning {STATUS_COLUMNS}"
        ))
        .bind(error)
        .bind(Utc::now())
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn set_asked_to_connect_until(
        &self,
        connector_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> TrellisResult<ConnectorStatus> {
        let row = sqlx::query(&format!(
            "update connector_status
             set asked_to_connect_until = $1, updated_at = now()
             where connector_id = $2
             returning {STATUS_COLUMNS}"
        ))
        .bind(until)
        .bind(connector_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }
}

#[derive(Clone)]
pub struct PgTableStatusRepository {
    pool: PgPool,
}

impl PgTableStatusRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> TrellisResult<TableStatus> {
        Ok(TableStatus {
            id: row.get("id"),
            connector_id: row.get("connector_id"),
            table_name: row.get("table_name"),
            last_synced_at: row.get("last_synced_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl TableStatusRepository for PgTableStatusRepository {
    async fn touch(&self, connector_id: &str, table_name: &str) -> TrellisResult<TableStatus> {
        let now = Utc::now();
        let row = sqlx::query(
            "insert into table_status (id, connector_id, table_name, last_synced_at)
             values ($1, $2, $3, $4)
             on conflict (connector_id, table_name)
             do update set last_synced_at = $4, updated_at = $4
             returning id, connector_id, table_name, last_synced_at, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(connector_id)
        .bind(table_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn get(
        &self,
        connector_id: &str,
        table_name: &str,
    ) -> TrellisResult<Option<TableStatus>> {
        let row = sqlx::query(
            "select id, connector_id, table_name, last_synced_at, created_at, updated_at
             from table_status where connector_id = $1 and table_name = $2",
        )
        .bind(connector_id)
        .bind(table_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::map_row(r)?)),
            None => Ok(None),
        }
    }
}
