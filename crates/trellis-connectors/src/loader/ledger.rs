use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::ConnectorConfig;
use crate::loader::{AuthStart, FetchBatch, FetchRequest, Loader, TokenPair};
use crate::record::DataRecord;
use crate::schema::{ColumnSchema, ColumnType, ResourceInfo, ResourceSchema, TimestampColumns};
use trellis_common::{TrellisError, TrellisResult};

/// Arguments handed to the fetch function for one resource pull.
#[derive(Debug, Clone)]
pub struct LedgerFetchArgs {
    pub resource: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// The aggregator exposes no pagination cursor, so fetching is delegated
/// entirely to a caller-supplied function: one call returns the full record
/// set for one resource.
pub type LedgerFetchFn =
    Arc<dyn Fn(LedgerFetchArgs) -> BoxFuture<'static, TrellisResult<Vec<DataRecord>>> + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "LedgerConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl LedgerConfig {
    fn default_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerCheckpoint {
    #[serde(default)]
    resource_index: usize,
}

impl LedgerCheckpoint {
    fn parse(value: Option<&JsonValue>) -> Self {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Loader for a financial-aggregator provider with a fixed resource list
/// (`accounts`, `transactions`) and credential-based access.
pub struct LedgerLoader {
    fetch_fn: LedgerFetchFn,
    resources: Vec<ResourceInfo>,
}

impl LedgerLoader {
    pub fn from_config(config: &ConnectorConfig) -> TrellisResult<Self> {
        let ledger_config: LedgerConfig =
            serde_json::from_value(config.loader.clone()).map_err(|e| {
                TrellisError::Config(format!(
                    "connector {}: invalid ledger loader config: {e}",
                    config.id
                ))
            })?;

        Ok(Self::with_fetch_fn(default_fetch_fn(ledger_config)?))
    }

    /// Build a loader around a custom fetch function. Tests and bespoke
    /// integrations use this directly.
    pub fn with_fetch_fn(fetch_fn: LedgerFetchFn) -> Self {
        Self {
            fetch_fn,
            resources: fixed_resources(),
        }
    }

    fn info(&self, name: &str) -> TrellisResult<&ResourceInfo> {
        self.resources
            .iter()
            .find(|r| r.schema.name == name)
            .ok_or_else(|| TrellisError::NotFound(format!("resource not found: {name}")))
    }
}

/// The provider-defined resource list. The aggregator's schema is fixed, so
/// introspection never reaches the network.
fn fixed_resources() -> Vec<ResourceInfo> {
    let accounts = ResourceSchema {
        name: "accounts".to_string(),
        description: Some("Linked financial accounts".to_string()),
        primary_key: None,
        columns: vec![
            ColumnSchema::new("account_id", ColumnType::Text).required(),
            ColumnSchema::new("name", ColumnType::Text),
            ColumnSchema::new("official_name", ColumnType::Text),
            ColumnSchema::new("account_type", ColumnType::Text),
            ColumnSchema::new("current_balance", ColumnType::Float),
            ColumnSchema::new("available_balance", ColumnType::Float),
            ColumnSchema::new("currency", ColumnType::Text),
        ],
    };

    // Two required *_id columns here, so the key must be explicit.
    let transactions = ResourceSchema {
        name: "transactions".to_string(),
        description: Some("Account transactions".to_string()),
        primary_key: Some("transaction_id".to_string()),
        columns: vec![
            ColumnSchema::new("transaction_id", ColumnType::Text).required(),
            ColumnSchema::new("account_id", ColumnType::Text).required(),
            ColumnSchema::new("amount", ColumnType::Float),
            ColumnSchema::new("currency", ColumnType::Text),
            ColumnSchema::new("description", ColumnType::Text),
            ColumnSchema::new("merchant_name", ColumnType::Text),
            ColumnSchema::new("posted_at", ColumnType::Timestamp),
            ColumnSchema::new("pending", ColumnType::Boolean),
        ],
    };

    vec![
        ResourceInfo {
            schema: accounts,
            timestamp_columns: TimestampColumns::default(),
            record_count: None,
        },
        ResourceInfo {
            schema: transactions,
            timestamp_columns: TimestampColumns {
                created_at: Some("posted_at".to_string()),
                updated_at: None,
            },
            record_count: None,
        },
    ]
}

/// Default fetch function: the aggregator's `POST /{resource}/get` exchange.
fn default_fetch_fn(config: LedgerConfig) -> TrellisResult<LedgerFetchFn> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| TrellisError::Config(format!("cannot build http client: {e}")))?;

    Ok(Arc::new(move |args: LedgerFetchArgs| {
        let client = client.clone();
        let config = config.clone();
        Box::pin(async move {
            let url = format!("{}/{}/get", config.base_url, args.resource);
            let mut body = serde_json::json!({
                "client_id": config.client_id,
                "secret": config.client_secret,
            });
            if let Some(since) = args.last_synced_at {
                body["start_date"] = JsonValue::String(since.format("%Y-%m-%d").to_string());
            }

            let response = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| TrellisError::Provider(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(TrellisError::Provider(format!("{status}: {text}")));
            }

            let parsed: JsonValue = response
                .json()
                .await
                .map_err(|e| TrellisError::Provider(e.to_string()))?;

            let items = parsed
                .get(&args.resource)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            Ok(items
                .into_iter()
                .map(|item| DataRecord::from_value(args.resource.clone(), item))
                .collect())
        })
    }))
}

#[async_trait]
impl Loader for LedgerLoader {
    async fn authenticate(
        &self,
        _redirect_to: &str,
        _user_id: Option<&str>,
    ) -> TrellisResult<AuthStart> {
        // Access is credential-based; nothing interactive to run.
        Ok(AuthStart::immediate())
    }

    async fn continue_to_authenticate(
        &mut self,
        _code: &str,
        _redirect_to: &str,
    ) -> TrellisResult<TokenPair> {
        Err(TrellisError::Auth(
            "ledger loader does not use a token exchange".to_string(),
        ))
    }

    fn token_pair(&self) -> Option<TokenPair> {
        None
    }

    fn set_token_pair(&mut self, _tokens: TokenPair) {}

    async fn available_resource_names(&self) -> TrellisResult<Vec<String>> {
        Ok(self
            .resources
            .iter()
            .map(|r| r.schema.name.clone())
            .collect())
    }

    async fn resource_info(&self, name: &str) -> TrellisResult<ResourceInfo> {
        self.info(name).cloned()
    }

    async fn fetch_batch(&self, request: FetchRequest) -> TrellisResult<FetchBatch> {
        let mut checkpoint = LedgerCheckpoint::parse(request.checkpoint.as_ref());

        if checkpoint.resource_index >= request.resources.len() {
            return Ok(FetchBatch {
                records: Vec::new(),
                checkpoint: LedgerCheckpoint::default().to_value(),
                has_more: false,
            });
        }

        let name = request.resources[checkpoint.resource_index].clone();
        self.info(&name)?;

        let records = (self.fetch_fn)(LedgerFetchArgs {
            resource: name,
            last_synced_at: request.last_synced_at,
        })
        .await?;

        checkpoint.resource_index += 1;
        let has_more = checkpoint.resource_index < request.resources.len();
        let next = if has_more {
            checkpoint
        } else {
            LedgerCheckpoint::default()
        };

        Ok(FetchBatch {
            records,
            checkpoint: next.to_value(),
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_loader(calls: Arc<Mutex<Vec<String>>>) -> LedgerLoader {
        LedgerLoader::with_fetch_fn(Arc::new(move |args: LedgerFetchArgs| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.lock().unwrap().push(args.resource.clone());
                Ok(vec![DataRecord::new(args.resource)
                    .with_field("id", serde_json::json!("r-1"))])
            })
        }))
    }

    fn fetch_request(resources: &[&str], checkpoint: Option<JsonValue>) -> FetchRequest {
        FetchRequest {
            resources: resources.iter().map(|s| s.to_string()).collect(),
            last_synced_at: None,
            checkpoint,
            max_duration: None,
        }
    }

    #[tokio::test]
    async fn walks_resources_one_call_each_then_resets() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        let first = loader
            .fetch_batch(fetch_request(&["accounts", "transactions"], None))
            .await
            .expect("first");
        assert_eq!(first.records.len(), 1);
        assert!(first.has_more);

        let second = loader
            .fetch_batch(fetch_request(
                &["accounts", "transactions"],
                Some(first.checkpoint),
            ))
            .await
            .expect("second");
        assert!(!second.has_more);

        let cp: LedgerCheckpoint = serde_json::from_value(second.checkpoint).expect("cp");
        assert_eq!(cp.resource_index, 0);
        assert_eq!(*calls.lock().unwrap(), vec!["accounts", "transactions"]);
    }

    #[tokio::test]
    async fn resource_discovery_is_fixed() {
        let loader = recording_loader(Arc::new(Mutex::new(Vec::new())));
        let names = loader.available_resource_names().await.expect("names");
        assert_eq!(names, vec!["accounts", "transactions"]);

        let err = loader.resource_info("holdings").await.unwrap_err();
        assert!(matches!(err, TrellisError::NotFound(_)));
    }

    #[tokio::test]
    async fn transactions_declare_an_explicit_key() {
        let loader = recording_loader(Arc::new(Mutex::new(Vec::new())));
        let info = loader.resource_info("transactions").await.expect("info");
        assert_eq!(
            info.schema.primary_key_column().expect("pk").name,
            "transaction_id"
        );

        let accounts = loader.resource_info("accounts").await.expect("info");
        assert_eq!(
            accounts.schema.primary_key_column().expect("pk").name,
            "account_id"
        );
    }
}
