//! Namespaced tool catalog across subprocess servers and built-in providers.

pub mod builtin;
pub mod gate;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use toolhub_error::ToolFailure;

pub use builtin::{DbTool, UiTool};
pub use gate::{ApprovalState, PlannedToolUse, ToolGate, ToolUseRequest};

pub const TOOL_NAME_SEPARATOR: &str = "--";

pub const DB_PROVIDER: &str = "db";
pub const FUNCTIONS_PROVIDER: &str = "db-methods";
pub const UI_PROVIDER: &str = "ui";
pub const SANDBOX_PROVIDER: &str = "docker-sandbox";
pub const SANDBOX_TOOL: &str = "create_container";

pub fn full_tool_name(provider: &str, tool: &str) -> String {
    format!("{provider}{TOOL_NAME_SEPARATOR}{tool}")
}

/// Splits `provider--tool` at the first separator.
pub fn split_tool_name(full_name: &str) -> Option<(&str, &str)> {
    let (provider, tool) = full_name.split_once(TOOL_NAME_SEPARATOR)?;
    if provider.is_empty() || tool.is_empty() {
        return None;
    }
    Some((provider, tool))
}

/// Where an invocation is routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolProvider {
    Mcp { server: String, tool: String },
    Database { tool: DbTool },
    Function { name: String },
    Sandbox,
    Ui { tool: UiTool },
}

impl ToolProvider {
    /// Tools the chat may use without an explicit grant.
    pub fn is_implicitly_granted(&self) -> bool {
        matches!(self, ToolProvider::Database { .. } | ToolProvider::Ui { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    pub provider: ToolProvider,
}

/// Uniform envelope returned for every invocation, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({"type": "text", "text": text.into()})],
            is_error: false,
            structured_content: None,
            error: None,
        }
    }

    pub fn json(value: Value) -> Self {
        let text = match &value {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        Self {
            structured_content: Some(value),
            ..Self::text(text)
        }
    }

    pub fn failure(failure: ToolFailure) -> Self {
        Self {
            content: vec![json!({"type": "text", "text": failure.message})],
            is_error: true,
            structured_content: None,
            error: Some(failure),
        }
    }

    /// Adopts a `tools/call` result as returned by a tool server.
    pub fn from_call_result(result: Value) -> Self {
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = result
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Self {
            content,
            is_error,
            structured_content: result.get("structuredContent").cloned(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_split_at_first_separator() {
        assert_eq!(split_tool_name("fetch--get"), Some(("fetch", "get")));
        assert_eq!(split_tool_name("a--b--c"), Some(("a", "b--c")));
        assert_eq!(split_tool_name("plain"), None);
        assert_eq!(split_tool_name("--x"), None);
        assert_eq!(full_tool_name(DB_PROVIDER, "select"), "db--select");
    }

    #[test]
    fn call_result_keeps_error_flag() {
        let result = ToolResult::from_call_result(json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        }));
        assert!(result.is_error);
        assert_eq!(result.content.len(), 1);
        assert!(result.error.is_none());
    }
}
