use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::job::models::{Job, JobResult, JobState};
use crate::job::repositories::JobRepository;
use trellis_common::{TrellisError, TrellisResult};

const JOB_COLUMNS: &str = "id, connector_id, job_type, state, result, sync_context, progress, \
     error, started_at, finished_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> TrellisResult<Job> {
        let state_raw: String = row.get("state");
        let state = JobState::from_str(&state_raw).map_err(TrellisError::Internal)?;
        let result = row
            .get::<Option<String>, _>("result")
            .map(|r| JobResult::from_str(&r).map_err(TrellisError::Internal))
            .transpose()?;

        Ok(Job {
            id: row.get("id"),
            connector_id: row.get("connector_id"),
            job_type: row.get("job_type"),
            state,
            result,
            sync_context: row.get("sync_context"),
            progress: row.get("progress"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, connector_id: &str, job_type: &str) -> TrellisResult<Job> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let now = Utc::now();
        let superseded = sqlx::query(
            "update jobs
             set state = 'finished', result = 'canceled', finished_at = $1, updated_at = $1
             where connector_id = $2 and state != 'finished'",
        )
        .bind(now)
        .bind(connector_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        if superseded.rows_affected() > 0 {
            tracing::info!(
                connector_id,
                canceled = superseded.rows_affected(),
                "superseded unfinished jobs"
            );
        }

        let row = sqlx::query(&format!(
            "insert into jobs (id, connector_id, job_type)
             values ($1, $2, $3)
             returning {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(connector_id)
        .bind(job_type)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn get(&self, id: Uuid) -> TrellisResult<Option<Job>> {
        let row = sqlx::query(&format!("select {JOB_COLUMNS} from jobs where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::map_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_by_connector(&self, connector_id: &str) -> TrellisResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "select {JOB_COLUMNS} from jobs where connector_id = $1 order by created_at desc"
        ))
        .bind(connector_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn mark_running(&self, id: Uuid) -> TrellisResult<Job> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "update jobs
             set state = 'running', started_at = coalesce(started_at, $1), updated_at = $1
             where id = $2
             returning {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: i64,
        sync_context: &JsonValue,
    ) -> TrellisResult<Job> {
        let row = sqlx::query(&format!(
            "update jobs
             set progress = $1, sync_context = $2, updated_at = $3
             where id = $4
             returning {JOB_COLUMNS}"
        ))
        .bind(progress)
        .bind(sync_context)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn finish(
        &self,
        id: Uuid,
        result: JobResult,
        error: Option<&str>,
    ) -> TrellisResult<Job> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "update jobs
             set state = 'finished', result = $1, error = $2, finished_at = $3, updated_at = $3
             where id = $4
             returning {JOB_COLUMNS}"
        ))
        .bind(result.as_str())
        .bind(error)
        .bind(now)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn list_unfinished(&self) -> TrellisResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "select {JOB_COLUMNS} from jobs where state != 'finished' order by created_at desc"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }
}
