//! Callback listener for sandbox containers. Callers are identified by their
//! source address alone; a request never carries credentials.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use toolhub_error::{ErrorType, HubError, ProblemDetails};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::OpenApi;

use crate::db::DatabaseConnector;
use crate::sandbox::ContainerRegistry;
use crate::tools::builtin::execute_db_tool;
use crate::tools::gate::validate_arguments;
use crate::tools::{split_tool_name, DbTool, DB_PROVIDER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Interface reachable from containers, usually the engine's bridge gateway.
    pub host: String,
    pub port: u16,
    pub root_path: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "172.17.0.1".to_string(),
            port: 3009,
            root_path: "db".to_string(),
        }
    }
}

impl ProxySettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn route(&self) -> String {
        format!("/{}/:tool_name", self.root_path.trim_matches('/'))
    }
}

#[derive(Clone)]
pub struct ProxyState {
    registry: ContainerRegistry,
    database: Arc<dyn DatabaseConnector>,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("registry", &self.registry)
            .finish()
    }
}

impl ProxyState {
    pub fn new(registry: ContainerRegistry, database: Arc<dyn DatabaseConnector>) -> Self {
        Self { registry, database }
    }
}

#[derive(Debug)]
pub struct ProxyError(HubError);

impl From<HubError> for ProxyError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = self.0.to_problem_details();
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": problem }))).into_response()
    }
}

pub fn build_router(state: ProxyState, settings: &ProxySettings) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!("proxy.request", method = %req.method(), uri = %req.uri())
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .route("/openapi.json", get(openapi_document))
        .route(&settings.route(), post(call_tool))
        .with_state(Arc::new(state))
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(call_tool),
    components(schemas(ProblemDetails, ErrorType)),
    tags((name = "sandbox", description = "Sandbox container callbacks"))
)]
pub struct ProxyApiDoc;

async fn openapi_document() -> Json<utoipa::openapi::OpenApi> {
    Json(ProxyApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/db/{tool_name}",
    request_body = Object,
    responses(
        (status = 200, description = "Tool result as JSON"),
        (status = 400, body = ProblemDetails),
        (status = 401, body = ProblemDetails),
        (status = 403, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    params(("tool_name" = String, Path, description = "Database tool name")),
    tag = "sandbox"
)]
async fn call_tool(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(tool_name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ProxyError> {
    let lookup = state.registry.get_by_address(peer.ip()).await;
    let (container, session) = match lookup {
        Ok(Some(found)) => found,
        Ok(None) => {
            // Expected while a container starts; the caller retries.
            tracing::info!(address = %peer.ip(), tool = %tool_name, "no sandbox registered for caller");
            return Err(HubError::ProxyUnauthorized {
                address: peer.ip().to_string(),
            }
            .into());
        }
        Err(err) => {
            tracing::warn!(address = %peer.ip(), error = %err, "failed to resolve sandbox addresses");
            return Err(HubError::ProxyUnauthorized {
                address: peer.ip().to_string(),
            }
            .into());
        }
    };

    let tool = resolve_db_tool(&tool_name).ok_or_else(|| HubError::NotFound {
        name: tool_name.clone(),
    })?;
    let arguments: Value = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body).map_err(|err| HubError::InvalidArguments {
            tool: tool.full_name(),
            message: err.to_string(),
        })?
    };
    validate_arguments(&tool.descriptor(), &arguments)?;

    let handle = state
        .database
        .connect(&session.db_scope())
        .await
        .map_err(|err| err.into_hub_error(&tool.full_name()))?;
    let result = execute_db_tool(handle.as_ref(), &session.access, tool, arguments).await;
    match &result {
        Ok(_) => tracing::debug!(container = %container, chat_id = %session.chat_id, tool = %tool.full_name(), "sandbox tool call finished"),
        Err(err) => tracing::info!(container = %container, chat_id = %session.chat_id, tool = %tool.full_name(), error = %err, "sandbox tool call failed"),
    }
    Ok(Json(result?))
}

/// Accepts both `select` and `db--select`.
fn resolve_db_tool(name: &str) -> Option<DbTool> {
    DbTool::from_name(name).or_else(|| match split_tool_name(name) {
        Some((DB_PROVIDER, tool)) => DbTool::from_name(tool),
        _ => None,
    })
}
