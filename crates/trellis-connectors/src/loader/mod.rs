pub mod ledger;
pub mod oauth;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::ConnectorConfig;
use crate::record::DataRecord;
use crate::schema::ResourceInfo;
use trellis_common::{TrellisError, TrellisResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    /// Providers without refresh tokens leave this unset.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of starting an auth flow. No-auth providers return
/// `success = true` immediately instead of a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStart {
    pub auth_url: Option<String>,
    pub success: bool,
}

impl AuthStart {
    pub fn immediate() -> Self {
        Self {
            auth_url: None,
            success: true,
        }
    }

    pub fn redirect(auth_url: String) -> Self {
        Self {
            auth_url: Some(auth_url),
            success: false,
        }
    }
}

/// One `fetch_batch` invocation. The checkpoint is the opaque value returned
/// by the previous call (or the persisted one); the loader never mutates it
/// in place; it returns a new value alongside the batch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub resources: Vec<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub checkpoint: Option<JsonValue>,
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub records: Vec<DataRecord>,
    /// Checkpoint to pass into the next call. Precise enough to resume
    /// without skipping or re-fetching records.
    pub checkpoint: JsonValue,
    pub has_more: bool,
}

/// A pluggable provider: authentication plus resumable record fetching.
///
/// New sources are added by implementing this trait and registering the
/// type name in `build_loader`; the connector and writer stay untouched.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Begin an auth flow. No-auth providers return immediate success.
    async fn authenticate(
        &self,
        redirect_to: &str,
        user_id: Option<&str>,
    ) -> TrellisResult<AuthStart>;

    /// Exchange a provider code for a token pair. On failure the connector
    /// stays disconnected and nothing is persisted.
    async fn continue_to_authenticate(
        &mut self,
        code: &str,
        redirect_to: &str,
    ) -> TrellisResult<TokenPair>;

    fn token_pair(&self) -> Option<TokenPair>;

    fn set_token_pair(&mut self, tokens: TokenPair);

    async fn available_resource_names(&self) -> TrellisResult<Vec<String>>;

    async fn resource_info(&self, name: &str) -> TrellisResult<ResourceInfo>;

    /// Fetch the next batch of records. Exceeding `max_duration` mid-resource
    /// returns `has_more = true` with a checkpoint pointing at the exact
    /// resume position; exhausting all resources resets per-resource progress
    /// markers and returns `has_more = false`.
    async fn fetch_batch(&self, request: FetchRequest) -> TrellisResult<FetchBatch>;
}

/// Loader type names accepted by `build_loader`.
pub const LOADER_TYPES: &[&str] = &["postgres", "oauth_api", "ledger"];

/// Static name-to-constructor registry. Each constructor parses its own
/// section of the connector config.
pub fn build_loader(config: &ConnectorConfig) -> TrellisResult<Box<dyn Loader>> {
    match config.loader_type.as_str() {
        "postgres" => Ok(Box::new(postgres::PostgresLoader::from_config(config)?)),
        "oauth_api" => Ok(Box::new(oauth::OauthApiLoader::from_config(config)?)),
        "ledger" => Ok(Box::new(ledger::LedgerLoader::from_config(config)?)),
        other => Err(TrellisError::Config(format!(
            "unknown loader type: {other} (expected one of {})",
            LOADER_TYPES.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceBinding;

    #[test]
    fn unknown_loader_type_is_a_config_error() {
        let config = ConnectorConfig {
            id: "x".to_string(),
            name: "X".to_string(),
            description: None,
            resources: vec![ResourceBinding::new("things")],
            loader_type: "carrier_pigeon".to_string(),
            loader: serde_json::Value::Null,
        };

        let err = match build_loader(&config) {
            Ok(_) => panic!("expected build_loader to fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("unknown loader type"));
    }
}
