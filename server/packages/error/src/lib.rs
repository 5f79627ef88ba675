use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Configuration,
    Connection,
    TransportClosed,
    ServerDisabled,
    NotFound,
    InvalidArguments,
    NotAuthorized,
    ToolFailed,
    EngineUnavailable,
    ProxyUnauthorized,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::Configuration => "urn:toolhub:error:configuration",
            Self::Connection => "urn:toolhub:error:connection",
            Self::TransportClosed => "urn:toolhub:error:transport_closed",
            Self::ServerDisabled => "urn:toolhub:error:server_disabled",
            Self::NotFound => "urn:toolhub:error:not_found",
            Self::InvalidArguments => "urn:toolhub:error:invalid_arguments",
            Self::NotAuthorized => "urn:toolhub:error:not_authorized",
            Self::ToolFailed => "urn:toolhub:error:tool_failed",
            Self::EngineUnavailable => "urn:toolhub:error:engine_unavailable",
            Self::ProxyUnauthorized => "urn:toolhub:error:proxy_unauthorized",
            Self::Timeout => "urn:toolhub:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Configuration => "Configuration Error",
            Self::Connection => "Connection Error",
            Self::TransportClosed => "Transport Closed",
            Self::ServerDisabled => "Server Disabled",
            Self::NotFound => "Not Found",
            Self::InvalidArguments => "Invalid Arguments",
            Self::NotAuthorized => "Not Authorized",
            Self::ToolFailed => "Tool Failed",
            Self::EngineUnavailable => "Container Engine Unavailable",
            Self::ProxyUnauthorized => "Unauthorized",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration => 500,
            Self::Connection => 502,
            Self::TransportClosed => 502,
            Self::ServerDisabled => 409,
            Self::NotFound => 404,
            Self::InvalidArguments => 400,
            Self::NotAuthorized => 403,
            Self::ToolFailed => 422,
            Self::EngineUnavailable => 503,
            Self::ProxyUnauthorized => 401,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Serialized form of a failed tool invocation, carried inside tool results
/// and audit records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema, ToSchema)]
pub struct ToolFailure {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("failed to connect to server {server}: {message}")]
    Connection {
        server: String,
        message: String,
        log: Option<String>,
    },
    #[error("transport closed: {server}")]
    TransportClosed { server: String },
    #[error("server \"{server}\" is disabled and cannot be used")]
    ServerDisabled { server: String },
    #[error("not found: {name}")]
    NotFound { name: String },
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("not authorized to use {tool}")]
    NotAuthorized {
        tool: String,
        message: Option<String>,
    },
    #[error("tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },
    #[error("container engine unavailable: {message}")]
    EngineUnavailable { message: String },
    #[error("no sandbox registered for address {address}")]
    ProxyUnauthorized { address: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl HubError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Configuration { .. } => ErrorType::Configuration,
            Self::Connection { .. } => ErrorType::Connection,
            Self::TransportClosed { .. } => ErrorType::TransportClosed,
            Self::ServerDisabled { .. } => ErrorType::ServerDisabled,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::InvalidArguments { .. } => ErrorType::InvalidArguments,
            Self::NotAuthorized { .. } => ErrorType::NotAuthorized,
            Self::ToolFailed { .. } => ErrorType::ToolFailed,
            Self::EngineUnavailable { .. } => ErrorType::EngineUnavailable,
            Self::ProxyUnauthorized { .. } => ErrorType::ProxyUnauthorized,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn to_tool_failure(&self) -> ToolFailure {
        let (server, tool, details) = match self {
            Self::Configuration { .. } => (None, None, None),
            Self::Connection { server, log, .. } => {
                let details = log.as_ref().filter(|log| !log.is_empty()).map(|log| {
                    let mut map = Map::new();
                    map.insert("log".to_string(), Value::String(log.clone()));
                    Value::Object(map)
                });
                (Some(server.clone()), None, details)
            }
            Self::TransportClosed { server } => (Some(server.clone()), None, None),
            Self::ServerDisabled { server } => (Some(server.clone()), None, None),
            Self::NotFound { name } => (None, Some(name.clone()), None),
            Self::InvalidArguments { tool, message } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                (None, Some(tool.clone()), Some(Value::Object(map)))
            }
            Self::NotAuthorized { tool, message } => {
                let details = message.as_ref().map(|msg| {
                    let mut map = Map::new();
                    map.insert("message".to_string(), Value::String(msg.clone()));
                    Value::Object(map)
                });
                (None, Some(tool.clone()), details)
            }
            Self::ToolFailed { tool, .. } => (None, Some(tool.clone()), None),
            Self::EngineUnavailable { .. } => (None, None, None),
            Self::ProxyUnauthorized { address } => {
                let mut map = Map::new();
                map.insert("address".to_string(), Value::String(address.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::Timeout { message } => {
                let details = message.as_ref().map(|msg| {
                    let mut map = Map::new();
                    map.insert("message".to_string(), Value::String(msg.clone()));
                    Value::Object(map)
                });
                (None, None, details)
            }
        };

        ToolFailure {
            type_: self.error_type(),
            message: self.to_string(),
            server,
            tool,
            details,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let failure = self.to_tool_failure();

        let mut extensions = Map::new();
        if let Some(server) = failure.server {
            extensions.insert("server".to_string(), Value::String(server));
        }
        if let Some(tool) = failure.tool {
            extensions.insert("tool".to_string(), Value::String(tool));
        }
        if let Some(details) = failure.details {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<HubError> for ProblemDetails {
    fn from(value: HubError) -> Self {
        value.to_problem_details()
    }
}

impl From<&HubError> for ProblemDetails {
    fn from(value: &HubError) -> Self {
        value.to_problem_details()
    }
}

impl From<HubError> for ToolFailure {
    fn from(value: HubError) -> Self {
        value.to_tool_failure()
    }
}

impl From<&HubError> for ToolFailure {
    fn from(value: &HubError) -> Self {
        value.to_tool_failure()
    }
}
