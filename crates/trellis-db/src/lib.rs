pub mod connector;
pub mod job;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use trellis_common::{TrellisError, TrellisResult};

/// Create a Postgres connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> TrellisResult<PgPool> {
    tracing::info!("connecting to database");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))
}

/// Create the engine's bookkeeping tables if they do not exist yet.
/// Safe to run on every startup.
pub async fn ensure_tables(pool: &PgPool) -> TrellisResult<()> {
    sqlx::query(
        "create table if not exists connector_status (
           connector_id text primary key,
           is_connected boolean not null default false,
           is_loading boolean not null default false,
           access_token text,
           refresh_token text,
           token_expires_at timestamptz,
           last_connected_at timestamptz,
           last_synced_at timestamptz,
           last_error text,
           sync_context jsonb,
           asked_to_connect_until timestamptz,
           created_at timestamptz not null default now(),
           updated_at timestamptz not null default now()
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| TrellisError::Database(e.to_string()))?;

    sqlx::query(
        "create table if not exists table_status (
           id uuid primary key,
           connector_id text not null,
           table_name text not null,
           last_synced_at timestamptz,
           created_at timestamptz not null default now(),
           updated_at timestamptz not null default now()
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| TrellisError::Database(e.to_string()))?;

    sqlx::query(
        "create unique index if not exists table_status_connector_table_uidx
         on table_status(connector_id, table_name)",
    )
    .execute(pool)
    .await
    .map_err(|e| TrellisError::Database(e.to_string()))?;

    sqlx::query(
        "create table if not exists jobs (
           id uuid primary key,
           connector_id text not null,
           job_type text not null,
           state text not null default 'created',
           result text,
           sync_context jsonb,
           progress bigint not null default 0,
           error text,
           started_at timestamptz,
           finished_at timestamptz,
           created_at timestamptz not null default now(),
           updated_at timestamptz not null default now()
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| TrellisError::Database(e.to_string()))?;

    sqlx::query("create index if not exists jobs_connector_idx on jobs(connector_id, created_at desc)")
        .execute(pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_pool_fails_with_invalid_url() {
        let result = create_pool("postgres://invalid:5432/nonexistent").await;
        assert!(result.is_err());
    }
}
