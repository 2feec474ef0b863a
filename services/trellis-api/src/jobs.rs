use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;
use trellis_connectors::CleanupReport;
use trellis_db::job::models::Job;

/// Create a job and run it in the background. The response returns as soon
/// as the job row exists; completion does not depend on the client staying
/// connected.
pub async fn create(
    State(state): State<AppState>,
    Path(connector_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.scheduler.create(&connector_id).await?;

    let scheduler = state.scheduler.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        loop {
            match scheduler.run(job_id).await {
                Ok(job) if job.is_finished() => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "background job run failed");
                    break;
                }
            }
        }
    });

    Ok(Json(job))
}

/// Run one duration-bounded pass of an existing job.
pub async fn run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.scheduler.run(id).await?;
    Ok(Json(job))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.scheduler.get(id).await?;
    Ok(Json(job))
}

pub async fn list_for_connector(
    State(state): State<AppState>,
    Path(connector_id): Path<String>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state.scheduler.get_by_config(&connector_id).await?;
    Ok(Json(jobs))
}

pub async fn cleanup(State(state): State<AppState>) -> Result<Json<CleanupReport>, ApiError> {
    let report = state.scheduler.cleanup().await?;
    Ok(Json(report))
}
