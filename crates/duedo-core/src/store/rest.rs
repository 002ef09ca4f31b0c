use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::store::TaskStore;
use crate::task::{Task, TaskDraft, TaskId, TaskPatch, UserId};

const DEFAULT_TABLE: &str = "tasks";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const REST_PREFIX: &str = "rest/v1";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub anon_key: String,
    pub access_token: Option<String>,
    pub table: String,
    pub timeout: Duration,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            access_token: None,
            table: DEFAULT_TABLE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let mut rest = Self::new(cfg.require("store.url")?, cfg.require("store.anon_key")?);
        if let Some(token) = cfg.get("auth.access_token") {
            rest = rest.with_access_token(token);
        }
        if let Some(table) = cfg.get("store.table") {
            rest = rest.with_table(table);
        }
        if let Some(secs) = cfg.get_u64("store.timeout_secs")? {
            rest = rest.with_timeout(Duration::from_secs(secs));
        }
        Ok(rest)
    }

    fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }
}

/// PostgREST client for the task table. Row-level security on the server
/// keeps `update`/`delete` inside the session user's rows.
#[derive(Debug, Clone)]
pub struct RestTaskStore {
    client: reqwest::Client,
    config: RestConfig,
    endpoint: Url,
}

#[derive(Serialize)]
struct InsertRow<'a> {
    #[serde(flatten)]
    draft: &'a TaskDraft,
    user_id: UserId,
}

#[derive(Serialize)]
struct UpdateRow<'a> {
    #[serde(flatten)]
    patch: &'a TaskPatch,
    updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl RestTaskStore {
    pub fn new(config: RestConfig) -> Result<Self, StoreError> {
        let raw = format!(
            "{}/{REST_PREFIX}/{}",
            config.base_url.trim_end_matches('/'),
            config.table
        );
        let endpoint = Url::parse(&raw)
            .map_err(|e| StoreError::Validation(format!("invalid store url {raw}: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Network(format!("failed building HTTP client: {e}")))?;

        debug!(endpoint = %endpoint, table = %config.table, "initialized rest task store");
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    fn url_with(&self, pairs: &[(&str, String)]) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in pairs {
                query.append_pair(key, value);
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.config.anon_key)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.config.bearer()),
            )
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn read_rows(&self, response: reqwest::Response) -> Result<Vec<Task>, StoreError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl TaskStore for RestTaskStore {
    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list(&self, user_id: UserId) -> Result<Vec<Task>, StoreError> {
        let url = self.url_with(&[
            ("select", "*".to_string()),
            ("user_id", format!("eq.{user_id}")),
            ("order", "created_at.desc".to_string()),
        ]);
        let response = self.request(Method::GET, url).send().await?;
        let rows = self.read_rows(response).await?;
        debug!(count = rows.len(), "listed tasks");
        Ok(rows)
    }

    #[instrument(skip(self, draft), fields(user_id = %user_id))]
    async fn create(&self, draft: &TaskDraft, user_id: UserId) -> Result<Task, StoreError> {
        draft.validate()?;
        let response = self
            .request(Method::POST, self.endpoint.clone())
            .header("Prefer", "return=representation")
            .json(&InsertRow { draft, user_id })
            .send()
            .await?;
        let rows = self.read_rows(response).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no row".to_string()))
    }

    #[instrument(skip(self, patch), fields(id = %id))]
    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task, StoreError> {
        patch.validate()?;
        let url = self.url_with(&[("id", format!("eq.{id}"))]);
        let response = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=representation")
            .json(&UpdateRow {
                patch,
                updated_at: Utc::now(),
            })
            .send()
            .await?;
        let rows = self.read_rows(response).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let url = self.url_with(&[("id", format!("eq.{id}"))]);
        let response = self.request(Method::DELETE, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(())
    }
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.message)
        .unwrap_or_else(|| body.trim().to_string());
    warn!(status = %status, message = %message, "task store rejected request");

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            StoreError::Validation(message)
        }
        other => StoreError::Status {
            status: other.as_u16(),
            message,
        },
    }
}
