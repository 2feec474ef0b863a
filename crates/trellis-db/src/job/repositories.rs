use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::job::models::{Job, JobResult};
use trellis_common::TrellisResult;

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new `created` job, atomically superseding any job for the
    /// same connector still in `created`/`running` by finishing it as
    /// canceled. Enforces at-most-one-active-job per connector.
    async fn create(&self, connector_id: &str, job_type: &str) -> TrellisResult<Job>;

    async fn get(&self, id: Uuid) -> TrellisResult<Option<Job>>;

    /// Jobs for one connector, newest first.
    async fn get_by_connector(&self, connector_id: &str) -> TrellisResult<Vec<Job>>;

    /// Transition to `running`, setting `started_at` only if unset.
    async fn mark_running(&self, id: Uuid) -> TrellisResult<Job>;

    /// Persist the running total of upserted records plus the checkpoint.
    async fn update_progress(
        &self,
        id: Uuid,
        progress: i64,
        sync_context: &JsonValue,
    ) -> TrellisResult<Job>;

    /// Transition to `finished` with the given result.
    async fn finish(
        &self,
        id: Uuid,
        result: JobResult,
        error: Option<&str>,
    ) -> TrellisResult<Job>;

    /// All jobs not yet finished, across connectors.
    async fn list_unfinished(&self) -> TrellisResult<Vec<Job>>;
}
