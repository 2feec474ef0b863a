use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::connector::{LoadObserver, LoadRequest};
use trellis_db::job::models::{Job, JobResult};
use trellis_db::job::repositories::JobRepository;
use trellis_common::{TrellisError, TrellisResult};

const JOB_TYPE_LOAD: &str = "load";

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CleanupReport {
    pub checked: usize,
    pub canceled: usize,
}

/// Persists progress and checkpoint onto the job row after every batch.
struct JobProgressObserver {
    jobs: Arc<dyn JobRepository>,
    job_id: Uuid,
    /// Progress carried over from earlier runs of the same job.
    base: i64,
}

#[async_trait]
impl LoadObserver for JobProgressObserver {
    async fn on_progress(&self, upserted: u64, checkpoint: &JsonValue) -> TrellisResult<()> {
        self.jobs
            .update_progress(self.job_id, self.base + upserted as i64, checkpoint)
            .await?;
        Ok(())
    }
}

/// Wraps connector loads in persisted jobs with an explicit lifecycle:
/// `created -> running -> finished{success|error|canceled}`, terminal once
/// finished, at most one non-finished job per connector.
pub struct JobScheduler {
    jobs: Arc<dyn JobRepository>,
    catalog: Arc<Catalog>,
    max_job_duration: Duration,
}

impl JobScheduler {
    pub fn new(jobs: Arc<dyn JobRepository>, catalog: Arc<Catalog>, max_job_duration: Duration) -> Self {
        Self {
            jobs,
            catalog,
            max_job_duration,
        }
    }

    /// Create a `created` job for the connector, superseding any unfinished
    /// one so the at-most-one-active-job invariant holds.
    pub async fn create(&self, connector_id: &str) -> TrellisResult<Job> {
        self.catalog.get_config(connector_id)?;
        let job = self.jobs.create(connector_id, JOB_TYPE_LOAD).await?;
        tracing::info!(connector_id, job_id = %job.id, "job created");
        Ok(job)
    }

    /// Run one duration-bounded pass of the job. A pass that exhausts its
    /// budget leaves the job `running` with its checkpoint persisted, and a
    /// later `run` resumes it; a load error finishes the job as
    /// `finished/error` instead of propagating.
    pub async fn run(&self, id: Uuid) -> TrellisResult<Job> {
        let job = self
            .jobs
            .get(id)
            .await?
            .ok_or_else(|| TrellisError::NotFound(format!("job {id}")))?;

        if job.is_finished() {
            return Err(TrellisError::Validation(format!(
                "job {id} is already finished"
            )));
        }

        let job = self.jobs.mark_running(id).await?;

        let outcome = async {
            let connector = self.catalog.get_connector(&job.connector_id).await?;
            let observer = JobProgressObserver {
                jobs: self.jobs.clone(),
                job_id: id,
                base: job.progress,
            };
            connector
                .load(
                    LoadRequest {
                        checkpoint: job.sync_context.clone(),
                        max_duration: Some(self.max_job_duration),
                    },
                    &observer,
                )
                .await
        }
        .await;

        match outcome {
            Ok(outcome) if outcome.has_more => {
                tracing::info!(
                    job_id = %id,
                    upserted = outcome.upserted,
                    "duration budget exhausted, job stays running"
                );
                self.get(id).await
            }
            Ok(outcome) => {
                tracing::info!(job_id = %id, upserted = outcome.upserted, "job finished");
                self.jobs.finish(id, JobResult::Success, None).await
            }
            Err(e) => {
                // Swallow the error so a background run never becomes an
                // unhandled task failure; the job row carries the message.
                tracing::error!(job_id = %id, error = %e, "job failed");
                self.jobs.finish(id, JobResult::Error, Some(&e.to_string())).await
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> TrellisResult<Job> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| TrellisError::NotFound(format!("job {id}")))
    }

    /// Jobs for one connector, newest first.
    pub async fn get_by_config(&self, connector_id: &str) -> TrellisResult<Vec<Job>> {
        self.jobs.get_by_connector(connector_id).await
    }

    /// Cancel unfinished jobs whose last update is older than twice the
    /// configured max job duration. A safety net against crashed or
    /// orphaned executions; intended to run periodically.
    pub async fn cleanup(&self) -> TrellisResult<CleanupReport> {
        let unfinished = self.jobs.list_unfinished().await?;
        let stale_after = chrono::Duration::from_std(self.max_job_duration * 2)
            .map_err(|e| TrellisError::Internal(e.to_string()))?;
        let cutoff = Utc::now() - stale_after;

        let mut report = CleanupReport {
            checked: unfinished.len(),
            canceled: 0,
        };

        for job in unfinished {
            if job.updated_at < cutoff {
                tracing::warn!(
                    job_id = %job.id,
                    connector_id = %job.connector_id,
                    updated_at = %job.updated_at,
                    "canceling stale job"
                );
                self.jobs.finish(job.id, JobResult::Canceled, None).await?;
                report.canceled += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorConfig, ResourceBinding};
    use crate::connector::Connector;
    use crate::loader::FetchBatch;
    use crate::record::DataRecord;
    use crate::testutil::{event_info, MemoryJobRepo, MemoryStatusRepo, MemoryWriter, ScriptedLoader};
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use trellis_db::job::models::JobState;

    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unreachable")
            .expect("lazy pool")
    }

    fn test_config(id: &str) -> ConnectorConfig {
        ConnectorConfig {
            id: id.to_string(),
            name: format!("Connector {id}"),
            description: None,
            resources: vec![ResourceBinding::new("TestEvent")],
            loader_type: "scripted".to_string(),
            loader: serde_json::Value::Null,
        }
    }

    fn event_batch(ids: &[&str], has_more: bool) -> FetchBatch {
        FetchBatch {
            records: ids
                .iter()
                .map(|id| {
                    DataRecord::new("TestEvent")
                        .with_field("id", json!(id))
                        .with_field("title", json!(format!("Event {id}")))
                })
                .collect(),
            checkpoint: json!({"resource_index": 0, "row_offset": ids.len()}),
            has_more,
        }
    }

    struct Harness {
        scheduler: JobScheduler,
        jobs: Arc<MemoryJobRepo>,
        status_repo: Arc<MemoryStatusRepo>,
        writer: Arc<MemoryWriter>,
    }

    async fn harness(connector_id: &str, batches: Vec<FetchBatch>, connected: bool) -> Harness {
        let status_repo = Arc::new(MemoryStatusRepo::new());
        if connected {
            status_repo.force_connected(connector_id);
        }

        let catalog = Arc::new(Catalog::with_status_repo(
            vec![test_config(connector_id)],
            lazy_pool(),
            status_repo.clone(),
        ));

        let writer = Arc::new(MemoryWriter::new());
        let loader = Box::new(ScriptedLoader::new(vec![event_info()], batches));
        let connector = Connector::create(
            test_config(connector_id),
            loader,
            writer.clone(),
            status_repo.clone(),
        )
        .await
        .expect("connector");
        catalog.register_connector(Arc::new(connector)).await;

        let jobs = Arc::new(MemoryJobRepo::new());
        let scheduler =
            JobScheduler::new(jobs.clone(), catalog, Duration::from_secs(60));

        Harness {
            scheduler,
            jobs,
            status_repo,
            writer,
        }
    }

    #[tokio::test]
    async fn create_supersedes_active_job() {
        let h = harness("crm", Vec::new(), true).await;

        let first = h.scheduler.create("crm").await.expect("first");
        let second = h.scheduler.create("crm").await.expect("second");

        let first = h.scheduler.get(first.id).await.expect("get first");
        assert_eq!(first.state, JobState::Finished);
        assert_eq!(first.result, Some(JobResult::Canceled));

        let unfinished: Vec<_> = h
            .scheduler
            .get_by_config("crm")
            .await
            .expect("list")
            .into_iter()
            .filter(|j| !j.is_finished())
            .collect();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, second.id);
    }

    #[tokio::test]
    async fn create_for_unknown_connector_fails() {
        let h = harness("crm", Vec::new(), true).await;
        assert!(matches!(
            h.scheduler.create("ghost").await,
            Err(TrellisError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_finishes_successfully_and_tracks_progress() {
        let h = harness(
            "crm",
            vec![
                event_batch(&["1", "2"], true),
                event_batch(&["3"], false),
            ],
            true,
        )
        .await;

        let job = h.scheduler.create("crm").await.expect("create");
        let job = h.scheduler.run(job.id).await.expect("run");

        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.result, Some(JobResult::Success));
        assert_eq!(job.progress, 3);
        assert!(job.started_at.is_some());
        assert_eq!(h.writer.written_ids("id"), vec!["1", "2", "3"]);

        let status = h.status_repo.snapshot("crm").expect("status");
        assert!(!status.is_loading);
        assert!(status.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn run_records_error_instead_of_propagating() {
        // Connector is disconnected, so the load itself fails.
        let h = harness("crm", Vec::new(), false).await;

        let job = h.scheduler.create("crm").await.expect("create");
        let job = h.scheduler.run(job.id).await.expect("run returns the job");

        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.result, Some(JobResult::Error));
        assert!(job.error.as_deref().unwrap_or_default().contains("not connected"));
    }

    #[tokio::test]
    async fn run_on_finished_job_is_rejected() {
        let h = harness("crm", Vec::new(), true).await;

        let job = h.scheduler.create("crm").await.expect("create");
        h.jobs
            .finish(job.id, JobResult::Success, None)
            .await
            .expect("finish");

        let err = h.scheduler.run(job.id).await.unwrap_err();
        assert!(matches!(err, TrellisError::Validation(_)));
    }

    #[tokio::test]
    async fn run_on_unknown_job_is_not_found() {
        let h = harness("crm", Vec::new(), true).await;
        let err = h.scheduler.run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TrellisError::NotFound(_)));
    }

    #[tokio::test]
    async fn cleanup_cancels_only_stale_jobs() {
        let h = harness("crm", Vec::new(), true).await;

        let stale = h.jobs.create("crm-old", "load").await.expect("stale");
        let fresh = h.jobs.create("crm", "load").await.expect("fresh");

        // Stale: last touched three times the max duration ago.
        h.jobs
            .backdate(stale.id, Utc::now() - chrono::Duration::seconds(180));

        let report = h.scheduler.cleanup().await.expect("cleanup");
        assert_eq!(report.checked, 2);
        assert_eq!(report.canceled, 1);

        let stale = h.scheduler.get(stale.id).await.expect("stale");
        assert_eq!(stale.result, Some(JobResult::Canceled));

        let fresh = h.scheduler.get(fresh.id).await.expect("fresh");
        assert!(!fresh.is_finished());
    }
}
