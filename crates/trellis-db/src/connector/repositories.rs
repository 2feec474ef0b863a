use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::connector::models::{ConnectorStatus, TableStatus};
use trellis_common::TrellisResult;

#[async_trait]
pub trait ConnectorStatusRepository: Send + Sync {
    /// Get or create the status row for a connector id.
    async fn get_or_create(&self, connector_id: &str) -> TrellisResult<ConnectorStatus>;

    async fn get(&self, connector_id: &str) -> TrellisResult<Option<ConnectorStatus>>;

    /// Mark the connector connected, persisting the token pair.
    async fn set_connected(
        &self,
        connector_id: &str,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> TrellisResult<ConnectorStatus>;

    /// Mark the connector disconnected and clear tokens.
    async fn set_disconnected(&self, connector_id: &str) -> TrellisResult<ConnectorStatus>;

    /// Atomically set `is_loading` only if it is currently false.
    /// Returns `None` if a load is already in flight (flag not acquired).
    async fn try_begin_load(&self, connector_id: &str) -> TrellisResult<Option<ConnectorStatus>>;

    /// Persist a mid-load checkpoint without touching the loading flag.
    async fn save_sync_context(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus>;

    /// Release the loading flag after a completed pass, updating
    /// `last_synced_at` and the checkpoint.
    async fn finish_load_success(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus>;

    /// Release the loading flag after a duration-bounded partial pass.
    /// The checkpoint is saved but `last_synced_at` is not stamped, so the
    /// resumed pass still sees the pre-pass incremental watermark.
    async fn finish_load_partial(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus>;

    /// Release the loading flag after a failed pass, recording the error.
    async fn finish_load_error(
        &self,
        connector_id: &str,
        error: &str,
    ) -> TrellisResult<ConnectorStatus>;

    /// Set or clear the consent-polling deadline.
    async fn set_asked_to_connect_until(
        &self,
        connector_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> TrellisResult<ConnectorStatus>;
}

#[async_trait]
pub trait TableStatusRepository: Send + Sync {
    /// Upsert the row for a connector+table pair, stamping `last_synced_at`.
    async fn touch(&self, connector_id: &str, table_name: &str) -> TrellisResult<TableStatus>;

    async fn get(&self, connector_id: &str, table_name: &str)
        -> TrellisResult<Option<TableStatus>>;
}
