use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use url::Url;

use crate::config::ConnectorConfig;
use crate::loader::{AuthStart, FetchBatch, FetchRequest, Loader, TokenPair};
use crate::record::DataRecord;
use crate::schema::{ResourceInfo, ResourceSchema, TimestampColumns};
use trellis_common::{TrellisError, TrellisResult};

fn default_page_size() -> u32 {
    100
}

fn default_detail_concurrency() -> usize {
    5
}

fn default_page_size_param() -> String {
    "page_size".to_string()
}

fn default_page_token_param() -> String {
    "page_token".to_string()
}

fn default_cursor_field() -> String {
    "next_page_token".to_string()
}

/// Provider-specific backoff behaviour for quota and transient failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryPolicy::default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "RetryPolicy::default_statuses")]
    pub retry_statuses: Vec<u16>,
    /// HTTP methods the policy applies to. Anything else fails fast.
    #[serde(default = "RetryPolicy::default_methods")]
    pub methods: Vec<String>,
}

impl RetryPolicy {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_base_delay_ms() -> u64 {
        1000
    }

    fn default_statuses() -> Vec<u16> {
        vec![429, 500, 502, 503, 504]
    }

    fn default_methods() -> Vec<String> {
        vec!["GET".to_string()]
    }

    fn applies_to(&self, method: &Method, status: StatusCode) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
            && self.retry_statuses.contains(&status.as_u16())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            base_delay_ms: Self::default_base_delay_ms(),
            retry_statuses: Self::default_statuses(),
            methods: Self::default_methods(),
        }
    }
}

/// One API resource: where to list it, optionally where to fetch item
/// detail, and the declared record schema.
#[derive(Debug, Clone, Deserialize)]
pub struct OauthResourceConfig {
    pub name: String,
    /// List endpoint path, joined onto `base_url`.
    pub path: String,
    /// Detail endpoint with an `{id}` placeholder. When set, records are
    /// fetched in list+detail phases and the detail fields win.
    #[serde(default)]
    pub detail_path: Option<String>,
    /// Response field holding the item array. Defaults to the body itself
    /// when it is an array, else `items`.
    #[serde(default)]
    pub items_field: Option<String>,
    #[serde(default = "default_cursor_field")]
    pub cursor_field: String,
    pub schema: ResourceSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OauthApiConfig {
    pub base_url: String,
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub resources: Vec<OauthResourceConfig>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    #[serde(default = "default_page_token_param")]
    pub page_token_param: String,
    /// Query parameter carrying `last_synced_at` for incremental pulls.
    #[serde(default)]
    pub updated_since_param: Option<String>,
    #[serde(default = "default_detail_concurrency")]
    pub detail_concurrency: usize,
    #[serde(default = "OauthApiConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl OauthApiConfig {
    fn default_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OauthClientError {
    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl From<OauthClientError> for TrellisError {
    fn from(err: OauthClientError) -> Self {
        TrellisError::Provider(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Checkpoint shape: which resource we are on and the provider-defined
/// cursor into it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ApiCheckpoint {
    #[serde(default)]
    resource_index: usize,
    #[serde(default)]
    page_token: Option<String>,
}

impl ApiCheckpoint {
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

/// Loader for a generic OAuth REST provider: authorization-code flow,
/// config-declared resources, list+detail fetching with cursor pagination
/// and provider-tuned retry.
pub struct OauthApiLoader {
    config: OauthApiConfig,
    client: Client,
    tokens: Option<TokenPair>,
}

impl OauthApiLoader {
    pub fn from_config(config: &ConnectorConfig) -> TrellisResult<Self> {
        let api_config: OauthApiConfig =
            serde_json::from_value(config.loader.clone()).map_err(|e| {
                TrellisError::Config(format!(
                    "connector {}: invalid oauth_api loader config: {e}",
                    config.id
                ))
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(api_config.timeout_secs))
            .build()
            .map_err(|e| TrellisError::Config(format!("cannot build http client: {e}")))?;

        Ok(Self {
            config: api_config,
            client,
            tokens: None,
        })
    }

    fn resource_config(&self, name: &str) -> TrellisResult<&OauthResourceConfig> {
        self.config
            .resources
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| TrellisError::NotFound(format!("resource not found: {name}")))
    }

    fn access_token(&self) -> TrellisResult<&str> {
        self.tokens
            .as_ref()
            .map(|t| t.access_token.as_str())
            .ok_or_else(|| TrellisError::Auth("not authenticated".to_string()))
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<JsonValue, OauthClientError> {
        let token = self
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
            .unwrap_or_default();
        let policy = &self.config.retry;
        let mut last_error = String::new();

        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                let backoff_ms = std::cmp::min(policy.base_delay_ms << attempt, 30_000);
                tracing::warn!(attempt, backoff_ms, url, "retrying after backoff");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }

            let response = match self
                .client
                .get(url)
                .query(query)
                .bearer_auth(&token)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_timeout() || e.is_connect() {
                        continue;
                    }
                    return Err(OauthClientError::RequestError(e));
                }
            };

            let status = response.status();

            if status.is_success() {
                return response.json().await.map_err(OauthClientError::RequestError);
            }

            // Honor Retry-After when the quota is exceeded
            if status == StatusCode::TOO_MANY_REQUESTS
                && policy.applies_to(&Method::GET, status)
            {
                if let Some(retry_after) = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    let wait = std::cmp::min(retry_after, 60);
                    tracing::warn!(wait, "rate-limited, waiting Retry-After");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                last_error = "429 Too Many Requests".to_string();
                continue;
            }

            if policy.applies_to(&Method::GET, status) {
                let body = response.text().await.unwrap_or_default();
                last_error = format!("{status}: {body}");
                continue;
            }

            // Fail fast on anything the policy does not cover
            let body = response.text().await.unwrap_or_default();
            return Err(OauthClientError::HttpError { status, body });
        }

        Err(OauthClientError::MaxRetriesExceeded {
            attempts: policy.max_retries + 1,
            last_error,
        })
    }

    fn extract_items(resource: &OauthResourceConfig, body: &JsonValue) -> Vec<JsonValue> {
        let items = match &resource.items_field {
            Some(field) => body.get(field),
            None if body.is_array() => Some(body),
            None => body.get("items"),
        };
        items
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }

    fn extract_cursor(resource: &OauthResourceConfig, body: &JsonValue) -> Option<String> {
        body.get(&resource.cursor_field)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    /// Fetch the detail object for each listed item and merge it over the
    /// list fields. Requests run with bounded concurrency.
    async fn fetch_details(
        &self,
        detail_path: &str,
        pk: &str,
        items: Vec<JsonValue>,
    ) -> TrellisResult<Vec<JsonValue>> {
        let detailed: Vec<TrellisResult<JsonValue>> = stream::iter(items.into_iter().map(|item| {
            let id = item
                .get(pk)
                .map(|v| match v {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            let url = format!(
                "{}{}",
                self.config.base_url,
                detail_path.replace("{id}", &id)
            );
            async move {
                if id.is_empty() {
                    return Ok(item);
                }
                let detail = self.get_json(&url, &[]).await.map_err(TrellisError::from)?;
                let mut merged = item;
                if let (Some(base), Some(extra)) = (merged.as_object_mut(), detail.as_object()) {
                    for (k, v) in extra {
                        base.insert(k.clone(), v.clone());
                    }
                }
                Ok(merged)
            }
        }))
        .buffered(self.config.detail_concurrency)
        .collect()
        .await;

        detailed.into_iter().collect()
    }
}

#[async_trait]
impl Loader for OauthApiLoader {
    async fn authenticate(
        &self,
        redirect_to: &str,
        user_id: Option<&str>,
    ) -> TrellisResult<AuthStart> {
        let mut params = vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            ("redirect_uri".to_string(), redirect_to.to_string()),
            ("response_type".to_string(), "code".to_string()),
        ];
        if !self.config.scopes.is_empty() {
            params.push(("scope".to_string(), self.config.scopes.join(" ")));
        }
        if let Some(user) = user_id {
            params.push(("state".to_string(), user.to_string()));
        }

        let url = Url::parse_with_params(&self.config.authorize_url, &params)
            .map_err(|e| TrellisError::Config(format!("invalid authorize_url: {e}")))?;

        Ok(AuthStart::redirect(url.to_string()))
    }

    async fn continue_to_authenticate(
        &mut self,
        code: &str,
        redirect_to: &str,
    ) -> TrellisResult<TokenPair> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_to),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .send()
            .await
            .map_err(|e| TrellisError::Auth(format!("token exchange failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrellisError::Auth(format!(
                "token exchange failed: {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TrellisError::Auth(format!("invalid token response: {e}")))?;

        let pair = TokenPair {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        };
        self.tokens = Some(pair.clone());
        Ok(pair)
    }

    fn token_pair(&self) -> Option<TokenPair> {
        self.tokens.clone()
    }

    fn set_token_pair(&mut self, tokens: TokenPair) {
        self.tokens = Some(tokens);
    }

    async fn available_resource_names(&self) -> TrellisResult<Vec<String>> {
        Ok(self
            .config
            .resources
            .iter()
            .map(|r| r.name.clone())
            .collect())
    }

    async fn resource_info(&self, name: &str) -> TrellisResult<ResourceInfo> {
        let resource = self.resource_config(name)?;
        let has = |col: &str| resource.schema.column(col).is_some();
        Ok(ResourceInfo {
            schema: resource.schema.clone(),
            timestamp_columns: TimestampColumns {
                created_at: has("created_at").then(|| "created_at".to_string()),
                updated_at: has("updated_at").then(|| "updated_at".to_string()),
            },
            record_count: None,
        })
    }

    async fn fetch_batch(&self, request: FetchRequest) -> TrellisResult<FetchBatch> {
        let started = Instant::now();
        let mut checkpoint = ApiCheckpoint::parse(request.checkpoint.as_ref());
        let mut did_work = false;

        loop {
            if checkpoint.resource_index >= request.resources.len() {
                return Ok(FetchBatch {
                    records: Vec::new(),
                    checkpoint: ApiCheckpoint::default().to_value(),
                    has_more: false,
                });
            }

            if did_work {
                if let Some(max) = request.max_duration {
                    if started.elapsed() >= max {
                        return Ok(FetchBatch {
                            records: Vec::new(),
                            checkpoint: checkpoint.to_value(),
                            has_more: true,
                        });
                    }
                }
            }

            // fail early when no token is set
            self.access_token()?;

            let name = &request.resources[checkpoint.resource_index];
            let resource = self.resource_config(name)?;

            let mut query = vec![(
                self.config.page_size_param.clone(),
                self.config.page_size.to_string(),
            )];
            if let Some(token) = &checkpoint.page_token {
                query.push((self.config.page_token_param.clone(), token.clone()));
            }
            if let (Some(param), Some(since)) =
                (&self.config.updated_since_param, request.last_synced_at)
            {
                query.push((param.clone(), since.to_rfc3339()));
            }

            let url = format!("{}{}", self.config.base_url, resource.path);
            let body = self.get_json(&url, &query).await?;

            let mut items = Self::extract_items(resource, &body);
            let cursor = Self::extract_cursor(resource, &body);
            did_work = true;

            if let Some(detail_path) = resource.detail_path.clone() {
                let pk = resource.schema.primary_key_column()?.name.clone();
                items = self.fetch_details(&detail_path, &pk, items).await?;
            }

            let records: Vec<DataRecord> = items
                .into_iter()
                .map(|item| DataRecord::from_value(name.clone(), item))
                .collect();

            if cursor.is_some() {
                checkpoint.page_token = cursor;
                return Ok(FetchBatch {
                    records,
                    checkpoint: checkpoint.to_value(),
                    has_more: true,
                });
            }

            // Cursor exhausted: this resource is done.
            checkpoint.resource_index += 1;
            checkpoint.page_token = None;
            let has_more = checkpoint.resource_index < request.resources.len();
            let next = if has_more {
                checkpoint.clone()
            } else {
                ApiCheckpoint::default()
            };

            if records.is_empty() && has_more {
                continue;
            }

            return Ok(FetchBatch {
                records,
                checkpoint: next.to_value(),
                has_more,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceBinding;
    use crate::schema::{ColumnSchema, ColumnType};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector_config(base_url: &str) -> ConnectorConfig {
        ConnectorConfig {
            id: "mail".to_string(),
            name: "Mail".to_string(),
            description: None,
            resources: vec![ResourceBinding::new("messages")],
            loader_type: "oauth_api".to_string(),
            loader: serde_json::json!({
                "base_url": base_url,
                "authorize_url": format!("{base_url}/oauth/authorize"),
                "token_url": format!("{base_url}/oauth/token"),
                "client_id": "client-1",
                "client_secret": "secret-1",
                "scopes": ["mail.read"],
                "page_size": 2,
                "retry": {"max_retries": 2, "base_delay_ms": 10},
                "resources": [{
                    "name": "messages",
                    "path": "/v1/messages",
                    "schema": {
                        "name": "messages",
                        "columns": [
                            {"name": "id", "column_type": "text", "required": true},
                            {"name": "subject", "column_type": "text"}
                        ]
                    }
                }]
            }),
        }
    }

    fn authed_loader(base_url: &str) -> OauthApiLoader {
        let mut loader =
            OauthApiLoader::from_config(&connector_config(base_url)).expect("loader");
        loader.set_token_pair(TokenPair {
            access_token: "at-test".to_string(),
            refresh_token: None,
            expires_at: None,
        });
        loader
    }

    fn fetch_request(checkpoint: Option<JsonValue>) -> FetchRequest {
        FetchRequest {
            resources: vec!["messages".to_string()],
            last_synced_at: None,
            checkpoint,
            max_duration: None,
        }
    }

    #[tokio::test]
    async fn authenticate_builds_redirect_url() {
        let loader = authed_loader("http://localhost");
        let start = loader
            .authenticate("http://app/callback", Some("user-9"))
            .await
            .expect("auth");

        assert!(!start.success);
        let url = start.auth_url.expect("auth url");
        assert!(url.contains("client_id=client-1"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("state=user-9"));
    }

    #[tokio::test]
    async fn token_exchange_round_trips() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-123",
                "refresh_token": "rt-456",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let mut loader =
            OauthApiLoader::from_config(&connector_config(&server.uri())).expect("loader");
        let pair = loader
            .continue_to_authenticate("code-1", "http://app/callback")
            .await
            .expect("exchange");

        assert_eq!(pair.access_token, "at-123");
        assert_eq!(pair.refresh_token.as_deref(), Some("rt-456"));
        assert!(pair.expires_at.is_some());
        assert!(loader.token_pair().is_some());
    }

    #[tokio::test]
    async fn token_exchange_failure_leaves_no_tokens() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad code"))
            .mount(&server)
            .await;

        let mut loader =
            OauthApiLoader::from_config(&connector_config(&server.uri())).expect("loader");
        let err = loader
            .continue_to_authenticate("code-bad", "http://app/callback")
            .await
            .unwrap_err();

        assert!(matches!(err, TrellisError::Auth(_)));
        assert!(loader.token_pair().is_none());
    }

    #[tokio::test]
    async fn fetch_follows_cursor_then_resets() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/messages"))
            .and(query_param("page_token", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": "3", "subject": "third"}],
                "next_page_token": ""
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": "1", "subject": "first"},
                    {"id": "2", "subject": "second"}
                ],
                "next_page_token": "p2"
            })))
            .mount(&server)
            .await;

        let loader = authed_loader(&server.uri());

        let first = loader.fetch_batch(fetch_request(None)).await.expect("first");
        assert_eq!(first.records.len(), 2);
        assert!(first.has_more);

        let second = loader
            .fetch_batch(fetch_request(Some(first.checkpoint)))
            .await
            .expect("second");
        assert_eq!(second.records.len(), 1);
        assert!(!second.has_more);

        let cp: ApiCheckpoint = serde_json::from_value(second.checkpoint).expect("cp");
        assert_eq!(cp.resource_index, 0);
        assert!(cp.page_token.is_none());
    }

    #[tokio::test]
    async fn retries_on_500_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(500).set_body_string("flaky"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": "1", "subject": "ok"}]
            })))
            .mount(&server)
            .await;

        let loader = authed_loader(&server.uri());
        let batch = loader.fetch_batch(fetch_request(None)).await.expect("batch");
        assert_eq!(batch.records.len(), 1);
    }

    #[tokio::test]
    async fn fails_fast_on_unretried_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let loader = authed_loader(&server.uri());
        let err = loader.fetch_batch(fetch_request(None)).await.unwrap_err();
        assert!(matches!(err, TrellisError::Provider(_)));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn fetch_without_tokens_is_an_auth_error() {
        let loader =
            OauthApiLoader::from_config(&connector_config("http://localhost")).expect("loader");
        let err = loader.fetch_batch(fetch_request(None)).await.unwrap_err();
        assert!(matches!(err, TrellisError::Auth(_)));
    }

    #[tokio::test]
    async fn detail_phase_merges_over_list_fields() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": "1", "subject": "stub"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/messages/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subject": "full subject",
                "body": "hello"
            })))
            .mount(&server)
            .await;

        let mut config = connector_config(&server.uri());
        config.loader["resources"][0]["detail_path"] =
            serde_json::json!("/v1/messages/{id}");
        let mut loader = OauthApiLoader::from_config(&config).expect("loader");
        loader.set_token_pair(TokenPair {
            access_token: "at-test".to_string(),
            refresh_token: None,
            expires_at: None,
        });

        let batch = loader.fetch_batch(fetch_request(None)).await.expect("batch");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.records[0].fields.get("subject"),
            Some(&serde_json::json!("full subject"))
        );
        assert_eq!(
            batch.records[0].fields.get("body"),
            Some(&serde_json::json!("hello"))
        );
    }
}
