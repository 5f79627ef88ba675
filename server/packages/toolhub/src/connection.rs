use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use toolhub_error::HubError;
use toolhub_stdio_transport::{StdioTransport, TransportError, TransportEvent, TransportOptions};

use crate::config::ServerLaunchConfig;
use crate::tools::full_tool_name;

const PROTOCOL_VERSION: &str = "2024-11-05";
const MAX_DISCOVERY_PAGES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceTemplate {
    pub uri_template: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

fn empty_object_schema() -> Value {
    json!({"type": "object"})
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Deadline for discovery and tool calls. The handshake is not bounded.
    pub request_timeout: Option<Duration>,
    pub log_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            request_timeout: None,
            log_capacity: TransportOptions::default().log_capacity,
        }
    }
}

/// A live tool server: one transport plus the metadata discovered right after
/// the handshake. A connection never goes back to `connecting`; a restart is
/// always a new `Connection`.
pub struct Connection {
    name: String,
    config: ServerLaunchConfig,
    transport: StdioTransport,
    status: StdMutex<ConnectionStatus>,
    last_error: StdMutex<Option<String>>,
    events: StdMutex<Option<BoxStream<'static, TransportEvent>>>,
    tools: Vec<McpTool>,
    resources: Vec<McpResource>,
    resource_templates: Vec<McpResourceTemplate>,
    request_timeout: Option<Duration>,
    connected_at: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("command", &self.transport.command())
            .field("status", &self.status())
            .field("tools", &self.tools.len())
            .finish()
    }
}

impl Connection {
    /// Spawns the server, performs the protocol handshake and discovers its
    /// tools, resources and resource templates.
    pub async fn connect(
        name: &str,
        config: &ServerLaunchConfig,
        options: &ConnectOptions,
    ) -> Result<Self, HubError> {
        let started = Instant::now();
        let transport = StdioTransport::start(
            &config.launch,
            TransportOptions {
                request_timeout: None,
                log_capacity: options.log_capacity,
            },
        )
        .await
        .map_err(|err| HubError::Connection {
            server: name.to_string(),
            message: err.to_string(),
            log: None,
        })?;
        // Subscribed before the handshake so no stderr line or close is missed.
        let events = transport.event_stream().boxed();

        if let Err(err) = handshake(&transport).await {
            transport.close().await;
            let log = transport.log_snapshot();
            tracing::warn!(server = %name, error = %err, "tool server handshake failed");
            return Err(HubError::Connection {
                server: name.to_string(),
                message: err.to_string(),
                log: Some(log),
            });
        }

        let mut connection = Self {
            name: name.to_string(),
            config: config.clone(),
            transport,
            status: StdMutex::new(ConnectionStatus::Connecting),
            last_error: StdMutex::new(None),
            events: StdMutex::new(Some(events)),
            tools: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
            request_timeout: options.request_timeout,
            connected_at: Instant::now(),
        };

        connection.tools = connection.discover("tools/list", "tools").await;
        connection.resources = connection.discover("resources/list", "resources").await;
        connection.resource_templates = connection
            .discover("resources/templates/list", "resourceTemplates")
            .await;
        connection.set_status(ConnectionStatus::Connected);

        tracing::info!(
            server = %name,
            tools = connection.tools.len(),
            resources = connection.resources.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool server connected"
        );
        Ok(connection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerLaunchConfig {
        &self.config
    }

    pub fn is_disabled(&self) -> bool {
        self.config.disabled
    }

    pub fn command(&self) -> &str {
        self.transport.command()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|status| *status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|error| error.clone())
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    pub fn resources(&self) -> &[McpResource] {
        &self.resources
    }

    pub fn resource_templates(&self) -> &[McpResourceTemplate] {
        &self.resource_templates
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn log_snapshot(&self) -> String {
        self.transport.log_snapshot()
    }

    /// Hands out the transport event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<BoxStream<'static, TransportEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    pub fn mark_disconnected(&self, error: Option<String>) {
        self.set_status(ConnectionStatus::Disconnected);
        if let Some(error) = error {
            if let Ok(mut last) = self.last_error.lock() {
                *last = Some(error);
            }
        }
    }

    /// Calls `tools/call` and returns the raw call result (`content`, `isError`).
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, HubError> {
        let full_name = full_tool_name(&self.name, tool);
        self.request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await
            .map_err(|err| self.map_error(err, &full_name))
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, HubError> {
        self.request("resources/read", json!({"uri": uri}))
            .await
            .map_err(|err| self.map_error(err, uri))
    }

    /// Terminates the process and waits for it to be reaped.
    pub async fn destroy(&self) {
        self.set_status(ConnectionStatus::Disconnected);
        self.transport.close().await;
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.request(method, params))
                .await
                .map_err(|_| TransportError::Timeout {
                    method: method.to_string(),
                })?,
            None => self.transport.request(method, params).await,
        }
    }

    fn map_error(&self, err: TransportError, subject: &str) -> HubError {
        match err {
            TransportError::Closed | TransportError::Write(_) => HubError::TransportClosed {
                server: self.name.clone(),
            },
            TransportError::Timeout { method } => HubError::Timeout {
                message: Some(format!("{subject}: no response to {method}")),
            },
            other => HubError::ToolFailed {
                tool: subject.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Fetches one paginated list. Any failure yields an empty list so that a
    /// server without resources still exposes its tools.
    async fn discover<T>(&self, method: &str, field: &str) -> Vec<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_DISCOVERY_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor}),
                None => json!({}),
            };
            let result = match self.request(method, params).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::debug!(server = %self.name, method, error = %err, "discovery call failed");
                    return Vec::new();
                }
            };
            let page = match result.get(field).cloned().map(serde_json::from_value::<Vec<T>>) {
                Some(Ok(page)) => page,
                Some(Err(err)) => {
                    tracing::warn!(server = %self.name, method, error = %err, "discovery result malformed");
                    return Vec::new();
                }
                None => Vec::new(),
            };
            items.extend(page);
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        items
    }

    fn set_status(&self, next: ConnectionStatus) {
        if let Ok(mut status) = self.status.lock() {
            *status = next;
        }
    }
}

async fn handshake(transport: &StdioTransport) -> Result<(), TransportError> {
    transport
        .request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "toolhub", "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;
    transport.notify("notifications/initialized", json!({})).await
}
