//! In-memory doubles used across the engine's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::loader::{AuthStart, FetchBatch, FetchRequest, Loader, TokenPair};
use crate::record::DataRecord;
use crate::schema::{ColumnSchema, ColumnType, ResourceInfo, ResourceSchema, TimestampColumns};
use crate::writer::{RecordWriter, SchemaSyncReport};
use trellis_db::connector::models::ConnectorStatus;
use trellis_db::connector::repositories::ConnectorStatusRepository;
use trellis_db::job::models::{Job, JobResult, JobState};
use trellis_db::job::repositories::JobRepository;
use trellis_common::{TrellisError, TrellisResult};

pub fn event_info() -> ResourceInfo {
    ResourceInfo {
        schema: ResourceSchema {
            name: "TestEvent".to_string(),
            description: None,
            primary_key: None,
            columns: vec![
                ColumnSchema::new("id", ColumnType::Text).required(),
                ColumnSchema::new("title", ColumnType::Text),
            ],
        },
        timestamp_columns: TimestampColumns::default(),
        record_count: None,
    }
}

fn blank_status(connector_id: &str) -> ConnectorStatus {
    let now = Utc::now();
    ConnectorStatus {
        connector_id: connector_id.to_string(),
        is_connected: false,
        is_loading: false,
        access_token: None,
        refresh_token: None,
        token_expires_at: None,
        last_connected_at: None,
        last_synced_at: None,
        last_error: None,
        sync_context: None,
        asked_to_connect_until: None,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Default)]
pub struct MemoryStatusRepo {
    inner: Mutex<HashMap<String, ConnectorStatus>>,
}

impl MemoryStatusRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, connector_id: &str) -> Option<ConnectorStatus> {
        self.inner.lock().unwrap().get(connector_id).cloned()
    }

    pub fn force_connected(&self, connector_id: &str) {
        let mut map = self.inner.lock().unwrap();
        let status = map
            .entry(connector_id.to_string())
            .or_insert_with(|| blank_status(connector_id));
        status.is_connected = true;
    }

    pub fn force_loading(&self, connector_id: &str) {
        let mut map = self.inner.lock().unwrap();
        let status = map
            .entry(connector_id.to_string())
            .or_insert_with(|| blank_status(connector_id));
        status.is_loading = true;
    }

    fn update<F>(&self, connector_id: &str, apply: F) -> TrellisResult<ConnectorStatus>
    where
        F: FnOnce(&mut ConnectorStatus),
    {
        let mut map = self.inner.lock().unwrap();
        let status = map
            .entry(connector_id.to_string())
            .or_insert_with(|| blank_status(connector_id));
        apply(status);
        status.updated_at = Utc::now();
        Ok(status.clone())
    }
}

#[async_trait]
impl ConnectorStatusRepository for MemoryStatusRepo {
    async fn get_or_create(&self, connector_id: &str) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |_| {})
    }

    async fn get(&self, connector_id: &str) -> TrellisResult<Option<ConnectorStatus>> {
        Ok(self.snapshot(connector_id))
    }

    async fn set_connected(
        &self,
        connector_id: &str,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |status| {
            status.is_connected = true;
            status.access_token = access_token.map(String::from);
            status.refresh_token = refresh_token.map(String::from);
            status.token_expires_at = token_expires_at;
            status.last_connected_at = Some(Utc::now());
            status.last_error = None;
        })
    }

    async fn set_disconnected(&self, connector_id: &str) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |status| {
            status.is_connected = false;
            status.access_token = None;
            status.refresh_token = None;
            status.token_expires_at = None;
        })
    }

    async fn try_begin_load(&self, connector_id: &str) -> TrellisResult<Option<ConnectorStatus>> {
        let mut map = self.inner.lock().unwrap();
        let status = map
            .entry(connector_id.to_string())
            .or_insert_with(|| blank_status(connector_id));
        if status.is_loading {
            return Ok(None);
        }
        status.is_loading = true;
        status.last_error = None;
        status.updated_at = Utc::now();
        Ok(Some(status.clone()))
    }

    async fn save_sync_context(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |status| {
            status.sync_context = Some(sync_context.clone());
        })
    }

    async fn finish_load_success(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |status| {
            status.is_loading = false;
            status.last_synced_at = Some(Utc::now());
            status.sync_context = Some(sync_context.clone());
            status.last_error = None;
        })
    }

    async fn finish_load_partial(
        &self,
        connector_id: &str,
        sync_context: &JsonValue,
    ) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |status| {
            status.is_loading = false;
            status.sync_context = Some(sync_context.clone());
        })
    }

    async fn finish_load_error(
        &self,
        connector_id: &str,
        error: &str,
    ) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |status| {
            status.is_loading = false;
            status.last_error = Some(error.to_string());
        })
    }

    async fn set_asked_to_connect_until(
        &self,
        connector_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> TrellisResult<ConnectorStatus> {
        self.update(connector_id, |status| {
            status.asked_to_connect_until = until;
        })
    }
}

#[derive(Default)]
pub struct MemoryJobRepo {
    inner: Mutex<Vec<Job>>,
}

impl MemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backdate(&self, id: Uuid, updated_at: DateTime<Utc>) {
        let mut jobs = self.inner.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.updated_at = updated_at;
        }
    }

    fn edit<F>(&self, id: Uuid, apply: F) -> TrellisResult<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.inner.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| TrellisError::NotFound(format!("job {id}")))?;
        apply(job);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepo {
    async fn create(&self, connector_id: &str, job_type: &str) -> TrellisResult<Job> {
        let mut jobs = self.inner.lock().unwrap();
        let now = Utc::now();
        for job in jobs.iter_mut() {
            if job.connector_id == connector_id && job.state != JobState::Finished {
                job.state = JobState::Finished;
                job.result = Some(JobResult::Canceled);
                job.finished_at = Some(now);
                job.updated_at = now;
            }
        }
        let job = Job {
            id: Uuid::new_v4(),
            connector_id: connector_id.to_string(),
            job_type: job_type.to_string(),
            state: JobState::Created,
            result: None,
            sync_context: None,
            progress: 0,
            error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        jobs.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> TrellisResult<Option<Job>> {
        Ok(self.inner.lock().unwrap().iter().find(|j| j.id == id).cloned())
    }

    async fn get_by_connector(&self, connector_id: &str) -> TrellisResult<Vec<Job>> {
        let jobs = self.inner.lock().unwrap();
        Ok(jobs
            .iter()
            .rev()
            .filter(|j| j.connector_id == connector_id)
            .cloned()
            .collect())
    }

    async fn mark_running(&self, id: Uuid) -> TrellisResult<Job> {
        self.edit(id, |job| {
            job.state = JobState::Running;
            if job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
        })
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: i64,
        sync_context: &JsonValue,
    ) -> TrellisResult<Job> {
        self.edit(id, |job| {
            job.progress = progress;
            job.sync_context = Some(sync_context.clone());
        })
    }

    async fn finish(
        &self,
        id: Uuid,
        result: JobResult,
        error: Option<&str>,
    ) -> TrellisResult<Job> {
        self.edit(id, |job| {
            job.state = JobState::Finished;
            job.result = Some(result);
            job.error = error.map(String::from);
            job.finished_at = Some(Utc::now());
        })
    }

    async fn list_unfinished(&self) -> TrellisResult<Vec<Job>> {
        let jobs = self.inner.lock().unwrap();
        Ok(jobs
            .iter()
            .filter(|j| j.state != JobState::Finished)
            .cloned()
            .collect())
    }
}

/// Writer double that records what it is asked to persist.
#[derive(Default)]
pub struct MemoryWriter {
    pub written: Mutex<Vec<DataRecord>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written_ids(&self, pk: &str) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.fields.get(pk).and_then(|v| v.as_str()).map(String::from))
            .collect()
    }
}

#[async_trait]
impl RecordWriter for MemoryWriter {
    async fn sync_table_schema(
        &self,
        _connector_id: &str,
        _info: &ResourceInfo,
    ) -> TrellisResult<SchemaSyncReport> {
        Ok(SchemaSyncReport::default())
    }

    async fn sync_table_records(
        &self,
        _connector_id: &str,
        _info: &ResourceInfo,
        records: &[DataRecord],
    ) -> TrellisResult<u64> {
        let mut written = self.written.lock().unwrap();
        written.extend(records.iter().cloned());
        Ok(records.len() as u64)
    }
}

/// Loader double fed with a fixed sequence of batches.
pub struct ScriptedLoader {
    batches: Mutex<VecDeque<FetchBatch>>,
    infos: HashMap<String, ResourceInfo>,
    auth_immediate: bool,
    tokens: Mutex<Option<TokenPair>>,
}

impl ScriptedLoader {
    pub fn new(infos: Vec<ResourceInfo>, batches: Vec<FetchBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            infos: infos
                .into_iter()
                .map(|i| (i.schema.name.clone(), i))
                .collect(),
            auth_immediate: true,
            tokens: Mutex::new(None),
        }
    }

    pub fn with_auth_url(mut self) -> Self {
        self.auth_immediate = false;
        self
    }
}

#[async_trait]
impl Loader for ScriptedLoader {
    async fn authenticate(
        &self,
        redirect_to: &str,
        _user_id: Option<&str>,
    ) -> TrellisResult<AuthStart> {
        if self.auth_immediate {
            Ok(AuthStart::immediate())
        } else {
            Ok(AuthStart::redirect(format!(
                "https://provider.example/authorize?redirect_uri={redirect_to}"
            )))
        }
    }

    async fn continue_to_authenticate(
        &mut self,
        code: &str,
        _redirect_to: &str,
    ) -> TrellisResult<TokenPair> {
        let pair = TokenPair {
            access_token: format!("at-{code}"),
            refresh_token: None,
            expires_at: None,
        };
        *self.tokens.lock().unwrap() = Some(pair.clone());
        Ok(pair)
    }

    fn token_pair(&self) -> Option<TokenPair> {
        self.tokens.lock().unwrap().clone()
    }

    fn set_token_pair(&mut self, tokens: TokenPair) {
        *self.tokens.lock().unwrap() = Some(tokens);
    }

    async fn available_resource_names(&self) -> TrellisResult<Vec<String>> {
        Ok(self.infos.keys().cloned().collect())
    }

    async fn resource_info(&self, name: &str) -> TrellisResult<ResourceInfo> {
        self.infos
            .get(name)
            .cloned()
            .ok_or_else(|| TrellisError::NotFound(format!("resource not found: {name}")))
    }

    async fn fetch_batch(&self, _request: FetchRequest) -> TrellisResult<FetchBatch> {
        let mut batches = self.batches.lock().unwrap();
        Ok(batches.pop_front().unwrap_or(FetchBatch {
            records: Vec::new(),
            checkpoint: JsonValue::Null,
            has_more: false,
        }))
    }
}
