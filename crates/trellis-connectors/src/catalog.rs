use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::config::ConnectorConfig;
use crate::connector::Connector;
use crate::loader::build_loader;
use crate::writer::PgRecordWriter;
use trellis_db::connector::pg_repository::{
    PgConnectorStatusRepository, PgTableStatusRepository,
};
use trellis_db::connector::repositories::ConnectorStatusRepository;
use trellis_common::{TrellisError, TrellisResult};

/// UI- and agent-safe projection of a connector: no tokens, no raw
/// checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_connected: bool,
    pub is_loading: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Read-through registry of connector configurations. Live connectors are
/// built on first use and cached; info projections read the status rows
/// directly so listing never touches a provider.
pub struct Catalog {
    configs: HashMap<String, ConnectorConfig>,
    order: Vec<String>,
    pool: PgPool,
    status_repo: Arc<dyn ConnectorStatusRepository>,
    instances: Mutex<HashMap<String, Arc<Connector>>>,
}

impl Catalog {
    pub fn new(configs: Vec<ConnectorConfig>, pool: PgPool) -> Self {
        let status_repo = Arc::new(PgConnectorStatusRepository::new(pool.clone()));
        Self::with_status_repo(configs, pool, status_repo)
    }

    /// Wire a catalog over a custom status repository. Tests use this with
    /// an in-memory repository.
    pub fn with_status_repo(
        configs: Vec<ConnectorConfig>,
        pool: PgPool,
        status_repo: Arc<dyn ConnectorStatusRepository>,
    ) -> Self {
        let order: Vec<String> = configs.iter().map(|c| c.id.clone()).collect();
        Self {
            configs: configs.into_iter().map(|c| (c.id.clone(), c)).collect(),
            order,
            pool,
            status_repo,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_config(&self, id: &str) -> TrellisResult<&ConnectorConfig> {
        self.configs
            .get(id)
            .ok_or_else(|| TrellisError::NotFound(format!("connector {id}")))
    }

    pub fn status_repo(&self) -> Arc<dyn ConnectorStatusRepository> {
        self.status_repo.clone()
    }

    /// Register a pre-built connector instance. Used for loaders that cannot
    /// be constructed from configuration alone (e.g. a ledger loader with a
    /// bespoke fetch function).
    pub async fn register_connector(&self, connector: Arc<Connector>) {
        let mut instances = self.instances.lock().await;
        instances.insert(connector.id().to_string(), connector);
    }

    /// Resolve a connector id to a live instance, building and caching it
    /// on first use.
    pub async fn get_connector(&self, id: &str) -> TrellisResult<Arc<Connector>> {
        {
            let instances = self.instances.lock().await;
            if let Some(connector) = instances.get(id) {
                return Ok(connector.clone());
            }
        }

        let config = self.get_config(id)?.clone();
        let loader = build_loader(&config)?;
        let table_status = Arc::new(PgTableStatusRepository::new(self.pool.clone()));
        let writer = Arc::new(PgRecordWriter::new(self.pool.clone(), table_status));

        let connector = Arc::new(
            Connector::create(config, loader, writer, self.status_repo.clone()).await?,
        );

        let mut instances = self.instances.lock().await;
        let entry = instances
            .entry(id.to_string())
            .or_insert_with(|| connector.clone());
        Ok(entry.clone())
    }

    pub async fn get_connector_info(&self, id: &str) -> TrellisResult<ConnectorInfo> {
        let config = self.get_config(id)?;
        let status = self.status_repo.get(id).await?;

        Ok(ConnectorInfo {
            id: config.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            is_connected: status.as_ref().is_some_and(|s| s.is_connected),
            is_loading: status.as_ref().is_some_and(|s| s.is_loading),
            last_synced_at: status.and_then(|s| s.last_synced_at),
        })
    }

    pub async fn get_all(&self) -> TrellisResult<Vec<ConnectorInfo>> {
        let mut infos = Vec::with_capacity(self.order.len());
        for id in &self.order {
            infos.push(self.get_connector_info(id).await?);
        }
        Ok(infos)
    }
}
