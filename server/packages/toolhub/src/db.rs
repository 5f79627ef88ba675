//! Database execution boundary. Handles are already restricted to a chat's
//! granted tables and commands; this crate never decides how.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use toolhub_error::HubError;

use crate::store::DbAccess;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database not configured")]
    NotConfigured,
    #[error("database request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("{0}")]
    Query(String),
}

impl DbError {
    pub fn into_hub_error(self, tool: &str) -> HubError {
        match self {
            DbError::NotConfigured => HubError::configuration("database not configured"),
            other => HubError::ToolFailed {
                tool: tool.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// The permission scope a handle is opened with.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbScope {
    pub chat_id: String,
    pub access: DbAccess,
    /// Short-lived session credential. Never logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl std::fmt::Debug for DbScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbScope")
            .field("chat_id", &self.chat_id)
            .field("access", &self.access)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    async fn find(&self, table: &str, filter: Value, limit: Option<u64>) -> Result<Value, DbError>;

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<u64, DbError>;

    async fn update(&self, table: &str, filter: Value, data: Value) -> Result<u64, DbError>;

    async fn delete(&self, table: &str, filter: Value) -> Result<u64, DbError>;

    /// Runs raw SQL in one transaction, committed only when `commit` is set.
    async fn sql(&self, query: &str, params: Option<Value>, commit: bool) -> Result<Value, DbError>;

    async fn run_function(&self, name: &str, arguments: Value) -> Result<Value, DbError>;
}

#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, scope: &DbScope) -> Result<Arc<dyn DatabaseHandle>, DbError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSettings {
    /// Base URL of the scoped database execution endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

/// Talks to the application's database execution endpoint over HTTP. The
/// scope travels with every request; the endpoint enforces it.
#[derive(Debug, Clone)]
pub struct HttpDatabaseConnector {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpDatabaseConnector {
    pub fn new(settings: &DatabaseSettings) -> Result<Self, DbError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = settings.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }
        Ok(Self {
            client: builder.build()?,
            base_url: settings
                .base_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
        })
    }
}

#[async_trait]
impl DatabaseConnector for HttpDatabaseConnector {
    async fn connect(&self, scope: &DbScope) -> Result<Arc<dyn DatabaseHandle>, DbError> {
        let base_url = self.base_url.clone().ok_or(DbError::NotConfigured)?;
        Ok(Arc::new(HttpDatabase {
            client: self.client.clone(),
            base_url,
            scope: scope.clone(),
        }))
    }
}

struct HttpDatabase {
    client: reqwest::Client,
    base_url: String,
    scope: DbScope,
}

impl HttpDatabase {
    async fn post(&self, action: &str, body: Value) -> Result<Value, DbError> {
        let mut request = self
            .client
            .post(format!("{}/{action}", self.base_url))
            .json(&json!({"scope": {"chatId": self.scope.chat_id, "access": self.scope.access}, "request": body}));
        if let Some(credential) = &self.scope.credential {
            request = request.bearer_auth(credential);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DbError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<Value>().await?)
    }

    async fn post_count(&self, action: &str, body: Value) -> Result<u64, DbError> {
        let value = self.post(action, body).await?;
        value
            .get("count")
            .and_then(Value::as_u64)
            .or_else(|| value.as_array().map(|rows| rows.len() as u64))
            .ok_or_else(|| DbError::Query(format!("{action}: response carries no row count")))
    }
}

#[async_trait]
impl DatabaseHandle for HttpDatabase {
    async fn find(&self, table: &str, filter: Value, limit: Option<u64>) -> Result<Value, DbError> {
        self.post("find", json!({"table": table, "filter": filter, "limit": limit}))
            .await
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<u64, DbError> {
        self.post_count("insert", json!({"table": table, "rows": rows}))
            .await
    }

    async fn update(&self, table: &str, filter: Value, data: Value) -> Result<u64, DbError> {
        self.post_count("update", json!({"table": table, "filter": filter, "data": data}))
            .await
    }

    async fn delete(&self, table: &str, filter: Value) -> Result<u64, DbError> {
        self.post_count("delete", json!({"table": table, "filter": filter}))
            .await
    }

    async fn sql(&self, query: &str, params: Option<Value>, commit: bool) -> Result<Value, DbError> {
        self.post("sql", json!({"query": query, "params": params, "commit": commit}))
            .await
    }

    async fn run_function(&self, name: &str, arguments: Value) -> Result<Value, DbError> {
        self.post("function", json!({"name": name, "arguments": arguments}))
            .await
    }
}
