use std::sync::Arc;
use std::time::Duration;

use trellis_config::{init_tracing, AppConfig};
use trellis_connectors::config::load_connector_configs;
use trellis_connectors::{Catalog, JobScheduler};
use trellis_db::job::pg_repository::PgJobRepository;

#[tokio::main]
async fn main() {
    init_tracing("info");
    let _ = dotenvy::dotenv();

    tracing::info!(service = "trellis-syncd", "starting");

    let config = AppConfig::from_env().expect("failed to load config");
    let pool = trellis_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");
    trellis_db::ensure_tables(&pool)
        .await
        .expect("failed to ensure bookkeeping tables");

    let connector_configs = load_connector_configs(&config.connectors_path)
        .expect("failed to load connector definitions");
    tracing::info!(count = connector_configs.len(), "loaded connector definitions");

    let connector_ids: Vec<String> =
        connector_configs.iter().map(|c| c.id.clone()).collect();
    let catalog = Arc::new(Catalog::new(connector_configs, pool.clone()));
    let scheduler = Arc::new(JobScheduler::new(
        Arc::new(PgJobRepository::new(pool.clone())),
        catalog.clone(),
        Duration::from_millis(config.max_job_duration_ms),
    ));

    // Self-healing first: cancel jobs orphaned by a previous crash.
    match scheduler.cleanup().await {
        Ok(report) => {
            tracing::info!(
                checked = report.checked,
                canceled = report.canceled,
                "stale-job cleanup completed"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "stale-job cleanup failed");
        }
    }

    // One load pass per connector; one connector's failure never stops the
    // rest.
    for connector_id in connector_ids {
        let connector = match catalog.get_connector(&connector_id).await {
            Ok(connector) => connector,
            Err(e) => {
                tracing::error!(connector_id, error = %e, "failed to build connector");
                continue;
            }
        };

        match connector.connect("", None).await {
            Ok(outcome) if outcome.success => {}
            Ok(_) => {
                tracing::info!(
                    connector_id,
                    "connector requires interactive authorization, skipping"
                );
                continue;
            }
            Err(e) => {
                tracing::error!(connector_id, error = %e, "connect failed");
                continue;
            }
        }

        let mut job = match scheduler.create(&connector_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(connector_id, error = %e, "failed to create job");
                continue;
            }
        };

        loop {
            job = match scheduler.run(job.id).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(connector_id, job_id = %job.id, error = %e, "job run failed");
                    break;
                }
            };
            if job.is_finished() {
                tracing::info!(
                    connector_id,
                    job_id = %job.id,
                    result = ?job.result,
                    progress = job.progress,
                    error = job.error.as_deref().unwrap_or(""),
                    "job finished"
                );
                break;
            }
            tracing::info!(
                connector_id,
                job_id = %job.id,
                progress = job.progress,
                "job pass finished with more to do, resuming"
            );
        }
    }

    tracing::info!("sync run finished");
}
