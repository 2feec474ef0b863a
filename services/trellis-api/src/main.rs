mod connectors;
mod error;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use trellis_config::{init_tracing, AppConfig};
use trellis_connectors::config::load_connector_configs;
use trellis_connectors::{Catalog, JobScheduler};
use trellis_db::job::pg_repository::PgJobRepository;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub scheduler: Arc<JobScheduler>,
}

#[tokio::main]
async fn main() {
    init_tracing("info");
    let _ = dotenvy::dotenv();

    tracing::info!(service = "trellis-api", "starting");

    let config = AppConfig::from_env().expect("failed to load config");
    let pool = trellis_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");
    trellis_db::ensure_tables(&pool)
        .await
        .expect("failed to ensure bookkeeping tables");

    let connector_configs = load_connector_configs(&config.connectors_path)
        .expect("failed to load connector definitions");

    let catalog = Arc::new(Catalog::new(connector_configs, pool.clone()));
    let scheduler = Arc::new(JobScheduler::new(
        Arc::new(PgJobRepository::new(pool.clone())),
        catalog.clone(),
        Duration::from_millis(config.max_job_duration_ms),
    ));

    let state = AppState { catalog, scheduler };

    let app = Router::new()
        .route("/connectors", get(connectors::list))
        .route("/connectors/:id", get(connectors::get_one))
        .route("/connectors/:id/connect", post(connectors::connect))
        .route("/connectors/:id/callback", get(connectors::callback))
        .route(
            "/connectors/:id/jobs",
            post(jobs::create).get(jobs::list_for_connector),
        )
        .route("/jobs/cleanup", post(jobs::cleanup))
        .route("/jobs/:id", get(jobs::get_one))
        .route("/jobs/:id/run", post(jobs::run))
        .with_state(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await.expect("server error");
}
