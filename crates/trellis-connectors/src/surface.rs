use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::catalog::{Catalog, ConnectorInfo};
use crate::scheduler::JobScheduler;
use trellis_db::job::models::JobResult;
use trellis_common::TrellisResult;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const CONSENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const LOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The narrow surface the agent layer consumes: connector listings,
/// human-in-the-loop connect, and load-and-wait. Deliberately exposes no
/// tokens and no raw checkpoints; results are plain-language summaries.
pub struct DataToolSurface {
    catalog: Arc<Catalog>,
    scheduler: Arc<JobScheduler>,
    poll_interval: Duration,
    consent_timeout: Duration,
    load_timeout: Duration,
}

impl DataToolSurface {
    pub fn new(catalog: Arc<Catalog>, scheduler: Arc<JobScheduler>) -> Self {
        Self {
            catalog,
            scheduler,
            poll_interval: POLL_INTERVAL,
            consent_timeout: CONSENT_TIMEOUT,
            load_timeout: LOAD_TIMEOUT,
        }
    }

    /// Override the polling cadence and timeouts. Tests shrink these.
    pub fn with_timeouts(
        mut self,
        poll_interval: Duration,
        consent_timeout: Duration,
        load_timeout: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.consent_timeout = consent_timeout;
        self.load_timeout = load_timeout;
        self
    }

    pub async fn list_connectors(&self) -> TrellisResult<Vec<ConnectorInfo>> {
        self.catalog.get_all().await
    }

    /// Ask the user to connect a connector, then poll the status row until
    /// they respond or the consent timeout elapses. The waiting deadline is
    /// cleared either way, and the current status is reported best-effort.
    pub async fn ask_to_connect(&self, connector_id: &str) -> TrellisResult<String> {
        self.catalog.get_config(connector_id)?;
        let status_repo = self.catalog.status_repo();

        let status = status_repo.get_or_create(connector_id).await?;
        if status.is_connected {
            return Ok(format!("Connector {connector_id} is already connected."));
        }

        let until = chrono::Utc::now()
            + chrono::Duration::from_std(self.consent_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        status_repo
            .set_asked_to_connect_until(connector_id, Some(until))
            .await?;
        tracing::info!(connector_id, %until, "waiting for user consent");

        let deadline = Instant::now() + self.consent_timeout;
        let summary = loop {
            tokio::time::sleep(self.poll_interval).await;
            let status = status_repo.get_or_create(connector_id).await?;

            if status.is_connected {
                break format!("Connector {connector_id} is now connected.");
            }
            if status.asked_to_connect_until.is_none() {
                break format!("The user declined to connect {connector_id}.");
            }
            if Instant::now() >= deadline {
                break format!(
                    "No response before the deadline; connector {connector_id} is still disconnected."
                );
            }
        };

        status_repo
            .set_asked_to_connect_until(connector_id, None)
            .await?;

        Ok(summary)
    }

    /// Create and run a load job, re-running budget-bounded passes until the
    /// job finishes or the wait deadline elapses, then summarize the result.
    pub async fn load_data(&self, connector_id: &str) -> TrellisResult<String> {
        let job = self.scheduler.create(connector_id).await?;
        let deadline = Instant::now() + self.load_timeout;

        let mut job = self.scheduler.run(job.id).await?;
        while !job.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            job = self.scheduler.run(job.id).await?;
        }

        Ok(match job.result {
            Some(JobResult::Success) => format!(
                "Loaded {} records for connector {connector_id}.",
                job.progress
            ),
            Some(JobResult::Error) => format!(
                "Loading {connector_id} failed after {} records: {}.",
                job.progress,
                job.error.as_deref().unwrap_or("unknown error")
            ),
            Some(JobResult::Canceled) => {
                format!("The load job for {connector_id} was canceled.")
            }
            None => format!(
                "Loading {connector_id} is still running after the wait deadline ({} records so far).",
                job.progress
            ),
        })
    }
}
