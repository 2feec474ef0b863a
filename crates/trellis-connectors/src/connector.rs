use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ConnectorConfig;
use crate::loader::{FetchRequest, Loader, TokenPair};
use crate::record::DataRecord;
use crate::schema::ResourceInfo;
use crate::writer::RecordWriter;
use trellis_db::connector::models::ConnectorStatus;
use trellis_db::connector::repositories::ConnectorStatusRepository;
use trellis_common::{TrellisError, TrellisResult};

/// Result of `connect`: either already/immediately connected, or a URL the
/// user must visit to authorize the provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectOutcome {
    pub success: bool,
    pub auth_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    /// Checkpoint to resume from. Defaults to the persisted `sync_context`.
    pub checkpoint: Option<JsonValue>,
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub upserted: u64,
    /// True when the duration budget ran out before all resources were
    /// exhausted; the checkpoint resumes the pass.
    pub has_more: bool,
    pub checkpoint: JsonValue,
}

/// Callback invoked after every written batch, so callers can persist
/// incremental progress (the job scheduler stores it on the job row).
#[async_trait]
pub trait LoadObserver: Send + Sync {
    async fn on_progress(&self, upserted: u64, checkpoint: &JsonValue) -> TrellisResult<()>;
}

pub struct NoopObserver;

#[async_trait]
impl LoadObserver for NoopObserver {
    async fn on_progress(&self, _upserted: u64, _checkpoint: &JsonValue) -> TrellisResult<()> {
        Ok(())
    }
}

/// Binds one loader and one writer to a persisted status record for a
/// single named source, and drives the connect and load cycles.
pub struct Connector {
    config: ConnectorConfig,
    loader: Mutex<Box<dyn Loader>>,
    writer: Arc<dyn RecordWriter>,
    status_repo: Arc<dyn ConnectorStatusRepository>,
    resource_infos: HashMap<String, ResourceInfo>,
}

impl Connector {
    /// Validate the configured resources against the loader and wire the
    /// pieces together. Persisted tokens are restored into the loader so a
    /// restart keeps an existing authorization.
    pub async fn create(
        config: ConnectorConfig,
        mut loader: Box<dyn Loader>,
        writer: Arc<dyn RecordWriter>,
        status_repo: Arc<dyn ConnectorStatusRepository>,
    ) -> TrellisResult<Self> {
        let status = status_repo.get_or_create(&config.id).await?;
        if let Some(access_token) = status.access_token {
            loader.set_token_pair(TokenPair {
                access_token,
                refresh_token: status.refresh_token,
                expires_at: status.token_expires_at,
            });
        }

        let mut resource_infos = HashMap::new();
        for binding in &config.resources {
            let info = loader.resource_info(&binding.name).await.map_err(|e| {
                match e {
                    TrellisError::NotFound(_) => TrellisError::NotFound(format!(
                        "resource not found: {} (connector {})",
                        binding.name, config.id
                    )),
                    other => other,
                }
            })?;
            resource_infos.insert(binding.name.clone(), info);
        }

        Ok(Self {
            config,
            loader: Mutex::new(loader),
            writer,
            status_repo,
            resource_infos,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn resource_info(&self, name: &str) -> Option<&ResourceInfo> {
        self.resource_infos.get(name)
    }

    /// Begin connecting. Already-connected connectors return success without
    /// re-authenticating.
    pub async fn connect(
        &self,
        redirect_to: &str,
        user_id: Option<&str>,
    ) -> TrellisResult<ConnectOutcome> {
        let status = self.status_repo.get_or_create(&self.config.id).await?;
        if status.is_connected {
            return Ok(ConnectOutcome {
                success: true,
                auth_url: None,
            });
        }

        let loader = self.loader.lock().await;
        let auth = loader.authenticate(redirect_to, user_id).await?;
        drop(loader);

        if auth.success {
            self.status_repo
                .set_connected(&self.config.id, None, None, None)
                .await?;
            tracing::info!(connector_id = %self.config.id, "connected without auth flow");
            return Ok(ConnectOutcome {
                success: true,
                auth_url: None,
            });
        }

        Ok(ConnectOutcome {
            success: false,
            auth_url: auth.auth_url,
        })
    }

    /// Complete the auth exchange and persist the resulting tokens. A failed
    /// exchange propagates and leaves the connector disconnected.
    pub async fn continue_to_connect(&self, code: &str, redirect_to: &str) -> TrellisResult<()> {
        let mut loader = self.loader.lock().await;
        let pair = loader.continue_to_authenticate(code, redirect_to).await?;
        drop(loader);

        self.status_repo
            .set_connected(
                &self.config.id,
                Some(&pair.access_token),
                pair.refresh_token.as_deref(),
                pair.expires_at,
            )
            .await?;

        tracing::info!(connector_id = %self.config.id, "connected");
        Ok(())
    }

    /// Run one duration-bounded load pass. Requires a connected connector
    /// and exactly one in-flight load: the loading flag is acquired with a
    /// single conditional update, and released on success and failure alike.
    pub async fn load(
        &self,
        request: LoadRequest,
        observer: &dyn LoadObserver,
    ) -> TrellisResult<LoadOutcome> {
        let status = self.status_repo.get_or_create(&self.config.id).await?;
        if !status.is_connected {
            return Err(TrellisError::Validation(format!(
                "connector {} is not connected",
                self.config.id
            )));
        }

        let acquired = match self.status_repo.try_begin_load(&self.config.id).await? {
            Some(status) => status,
            None => {
                return Err(TrellisError::Conflict(format!(
                    "connector {} is already loading",
                    self.config.id
                )))
            }
        };

        let result = self.run_load(&acquired, request, observer).await;
        match result {
            Ok(outcome) => {
                if outcome.has_more {
                    self.status_repo
                        .finish_load_partial(&self.config.id, &outcome.checkpoint)
                        .await?;
                } else {
                    self.status_repo
                        .finish_load_success(&self.config.id, &outcome.checkpoint)
                        .await?;
                }
                tracing::info!(
                    connector_id = %self.config.id,
                    upserted = outcome.upserted,
                    has_more = outcome.has_more,
                    "load pass finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(connector_id = %self.config.id, error = %e, "load pass failed");
                if let Err(persist_err) = self
                    .status_repo
                    .finish_load_error(&self.config.id, &e.to_string())
                    .await
                {
                    tracing::error!(
                        connector_id = %self.config.id,
                        error = %persist_err,
                        "failed to record load error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_load(
        &self,
        acquired: &ConnectorStatus,
        request: LoadRequest,
        observer: &dyn LoadObserver,
    ) -> TrellisResult<LoadOutcome> {
        let started = Instant::now();
        let resources = self.config.resource_names();
        let last_synced_at = acquired.last_synced_at;
        let mut checkpoint = request
            .checkpoint
            .clone()
            .or_else(|| acquired.sync_context.clone());
        let mut upserted_total: u64 = 0;

        loop {
            let remaining = request
                .max_duration
                .map(|max| max.saturating_sub(started.elapsed()));
            if matches!(remaining, Some(rem) if rem.is_zero()) {
                return Ok(LoadOutcome {
                    upserted: upserted_total,
                    has_more: true,
                    checkpoint: checkpoint.unwrap_or(JsonValue::Null),
                });
            }

            let loader = self.loader.lock().await;
            let batch = loader
                .fetch_batch(FetchRequest {
                    resources: resources.clone(),
                    last_synced_at,
                    checkpoint: checkpoint.clone(),
                    max_duration: remaining,
                })
                .await?;
            drop(loader);

            let current = batch.checkpoint;
            upserted_total += self.write_batch(batch.records).await?;

            self.status_repo
                .save_sync_context(&self.config.id, &current)
                .await?;
            observer.on_progress(upserted_total, &current).await?;

            let has_more = batch.has_more;
            checkpoint = Some(current);

            if !has_more {
                return Ok(LoadOutcome {
                    upserted: upserted_total,
                    has_more: false,
                    checkpoint: checkpoint.unwrap_or(JsonValue::Null),
                });
            }
        }
    }

    /// Buffer the batch per resource, dropping records without a primary
    /// key, and forward the remainder to the writer.
    async fn write_batch(&self, records: Vec<DataRecord>) -> TrellisResult<u64> {
        let mut grouped: HashMap<String, Vec<DataRecord>> = HashMap::new();

        for record in records {
            let info = match self.resource_infos.get(&record.resource) {
                Some(info) => info,
                None => {
                    tracing::warn!(
                        connector_id = %self.config.id,
                        resource = %record.resource,
                        "skipping record for undeclared resource"
                    );
                    continue;
                }
            };

            let pk = &info.schema.primary_key_column()?.name;
            if !record.has_value(pk) {
                tracing::warn!(
                    connector_id = %self.config.id,
                    resource = %record.resource,
                    "dropping record without primary key"
                );
                continue;
            }

            grouped.entry(record.resource.clone()).or_default().push(record);
        }

        let mut written = 0;
        for (resource, batch) in &grouped {
            if let Some(info) = self.resource_infos.get(resource) {
                written += self
                    .writer
                    .sync_table_records(&self.config.id, info, batch)
                    .await?;
            }
        }

        Ok(written)
    }
}
