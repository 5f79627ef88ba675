use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use toolhub_error::HubError;

use super::builtin::{
    db_tools_for, execute_db_tool, function_descriptor, sandbox_descriptor, ui_descriptors,
};
use super::{full_tool_name, ToolDescriptor, ToolProvider, ToolResult};
use crate::db::{DatabaseConnector, DbScope};
use crate::hub::ConnectionHub;
use crate::sandbox::{ContainerSession, CreateContainerParams, SandboxOrchestrator};
use crate::store::{format_timestamp, Chat, ChatStore, ChatToolGrant, ToolCallOutcome, ToolCallRecord};

const UI_TOOL_RESULT: &str = "Done";

/// One tool use requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalState {
    Approved,
    NeedsApproval,
    Denied,
    #[serde(rename = "tool-missing")]
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedToolUse {
    pub id: String,
    pub name: String,
    pub state: ApprovalState,
}

/// Builds per-chat tool catalogs and is the single path through which a chat
/// invokes a tool: resolve, validate, authorize, dispatch, audit.
pub struct ToolGate {
    hub: ConnectionHub,
    store: Arc<dyn ChatStore>,
    database: Arc<dyn DatabaseConnector>,
    sandbox: Option<SandboxOrchestrator>,
}

impl std::fmt::Debug for ToolGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGate")
            .field("hub", &self.hub)
            .field("sandbox", &self.sandbox.is_some())
            .finish()
    }
}

impl ToolGate {
    pub fn new(
        hub: ConnectionHub,
        store: Arc<dyn ChatStore>,
        database: Arc<dyn DatabaseConnector>,
    ) -> Self {
        Self {
            hub,
            store,
            database,
            sandbox: None,
        }
    }

    pub fn with_sandbox(mut self, orchestrator: SandboxOrchestrator) -> Self {
        self.sandbox = Some(orchestrator);
        self
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Every tool this chat could be granted, including tools of disabled
    /// servers. Fails on any namespaced name collision.
    pub async fn universe(&self, chat: &Chat) -> Result<Vec<ToolDescriptor>, HubError> {
        let mut tools: Vec<ToolDescriptor> = db_tools_for(&chat.db_access)
            .iter()
            .map(|tool| tool.descriptor())
            .collect();

        let mut suggestable = Vec::new();
        for connection in self.hub.connections() {
            for tool in connection.tools() {
                let name = full_tool_name(connection.name(), &tool.name);
                if !connection.is_disabled() {
                    suggestable.push(name.clone());
                }
                tools.push(ToolDescriptor {
                    name,
                    description: tool.description.clone().unwrap_or_default(),
                    input_schema: tool.input_schema.clone(),
                    output_schema: tool.output_schema.clone(),
                    provider: ToolProvider::Mcp {
                        server: connection.name().to_string(),
                        tool: tool.name.clone(),
                    },
                });
            }
        }

        for function in self.store.published_functions().await? {
            let descriptor = function_descriptor(&function);
            suggestable.push(descriptor.name.clone());
            tools.push(descriptor);
        }

        if self.sandbox.is_some() {
            let descriptor = sandbox_descriptor();
            suggestable.push(descriptor.name.clone());
            tools.push(descriptor);
        }

        tools.extend(ui_descriptors(chat, &suggestable));
        ensure_unique_names(&tools)?;
        Ok(tools)
    }

    /// The tools this chat may use right now: database tools allowed by its
    /// access mode, prompt-gated UI tools, and explicitly granted tools of
    /// enabled servers, functions and the sandbox.
    pub async fn get_catalog(&self, chat: &Chat) -> Result<Vec<ToolDescriptor>, HubError> {
        let universe = self.universe(chat).await?;
        let granted: HashSet<String> = self
            .store
            .tool_grants(&chat.id)
            .await?
            .into_iter()
            .map(|grant| grant.tool_name)
            .collect();

        Ok(universe
            .into_iter()
            .filter(|tool| !self.is_disabled_tool(tool))
            .filter(|tool| tool.provider.is_implicitly_granted() || granted.contains(&tool.name))
            .collect())
    }

    /// Invokes one tool for a chat. Never fails: every error is folded into a
    /// failed `ToolResult`, and exactly one audit record is written after the
    /// call settles.
    pub async fn invoke(&self, chat: &Chat, tool_name: &str, arguments: Value) -> ToolResult {
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();

        let outcome = self.try_invoke(chat, tool_name, &arguments).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        let record = ToolCallRecord {
            chat_id: chat.id.clone(),
            user_id: chat.user_id.clone(),
            tool_name: tool_name.to_string(),
            arguments,
            started_at: format_timestamp(started_at),
            duration_ms,
            outcome: match &outcome {
                Ok(result) => ToolCallOutcome::Output(
                    serde_json::to_value(result).unwrap_or(Value::Null),
                ),
                Err(err) => ToolCallOutcome::Error(err.to_tool_failure()),
            },
        };
        if let Err(err) = self.store.record_tool_call(record).await {
            tracing::error!(chat_id = %chat.id, tool = %tool_name, error = %err, "failed to record tool call");
        }

        match outcome {
            Ok(result) => {
                tracing::debug!(chat_id = %chat.id, tool = %tool_name, elapsed_ms = duration_ms, is_error = result.is_error, "tool call finished");
                result
            }
            Err(err) => {
                tracing::info!(chat_id = %chat.id, tool = %tool_name, elapsed_ms = duration_ms, error = %err, "tool call rejected or failed");
                ToolResult::failure(err.to_tool_failure())
            }
        }
    }

    /// Classifies requested tool uses the way the chat loop's approval step
    /// does. `approvals` holds the ids the user approved, or `None` when the
    /// user has not answered yet.
    pub async fn plan_tool_uses(
        &self,
        chat: &Chat,
        requests: &[ToolUseRequest],
        approvals: Option<&[String]>,
    ) -> Result<Vec<PlannedToolUse>, HubError> {
        let catalog = self.get_catalog(chat).await?;
        let grants = self.store.tool_grants(&chat.id).await?;

        Ok(requests
            .iter()
            .map(|request| {
                let state = match catalog.iter().find(|tool| tool.name == request.name) {
                    None => ApprovalState::Missing,
                    Some(tool) => {
                        let auto_approved = matches!(tool.provider, ToolProvider::Ui { .. })
                            || latest_grant(&grants, &tool.name)
                                .map(|grant| grant.auto_approve)
                                .unwrap_or(false);
                        let user_approved = approvals
                            .map(|ids| ids.iter().any(|id| id == &request.id))
                            .unwrap_or(false);
                        if auto_approved || user_approved {
                            ApprovalState::Approved
                        } else if approvals.is_some() {
                            ApprovalState::Denied
                        } else {
                            ApprovalState::NeedsApproval
                        }
                    }
                };
                PlannedToolUse {
                    id: request.id.clone(),
                    name: request.name.clone(),
                    state,
                }
            })
            .collect())
    }

    async fn try_invoke(
        &self,
        chat: &Chat,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<ToolResult, HubError> {
        let universe = self.universe(chat).await?;
        let tool = universe
            .into_iter()
            .find(|tool| tool.name == tool_name)
            .ok_or_else(|| HubError::NotFound {
                name: tool_name.to_string(),
            })?;

        if let ToolProvider::Mcp { server, .. } = &tool.provider {
            if self.is_disabled_tool(&tool) {
                return Err(HubError::ServerDisabled {
                    server: server.clone(),
                });
            }
        }

        validate_arguments(&tool, arguments)?;
        self.authorize(chat, &tool, arguments).await?;
        self.dispatch(chat, &tool, arguments.clone()).await
    }

    async fn authorize(
        &self,
        chat: &Chat,
        tool: &ToolDescriptor,
        arguments: &Value,
    ) -> Result<(), HubError> {
        if tool.provider.is_implicitly_granted() {
            return Ok(());
        }
        let grant = self
            .store
            .tool_grant(&chat.id, &tool.name)
            .await?
            .ok_or_else(|| HubError::NotAuthorized {
                tool: tool.name.clone(),
                message: None,
            })?;
        if !grant.permits(arguments) {
            return Err(HubError::NotAuthorized {
                tool: tool.name.clone(),
                message: Some("arguments do not match any approved input".to_string()),
            });
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        chat: &Chat,
        tool: &ToolDescriptor,
        arguments: Value,
    ) -> Result<ToolResult, HubError> {
        match &tool.provider {
            ToolProvider::Mcp { server, tool: name } => {
                let result = self.hub.call_tool(server, name, arguments).await?;
                Ok(ToolResult::from_call_result(result))
            }
            ToolProvider::Database { tool: db_tool } => {
                let handle = self.open_database(chat, &tool.name).await?;
                let output =
                    execute_db_tool(handle.as_ref(), &chat.db_access, *db_tool, arguments).await?;
                Ok(ToolResult::json(output))
            }
            ToolProvider::Function { name } => {
                let handle = self.open_database(chat, &tool.name).await?;
                let output = handle
                    .run_function(name, arguments)
                    .await
                    .map_err(|err| err.into_hub_error(&tool.name))?;
                Ok(ToolResult::json(output))
            }
            ToolProvider::Sandbox => {
                let orchestrator = self.sandbox.as_ref().ok_or_else(|| HubError::NotFound {
                    name: tool.name.clone(),
                })?;
                let params: CreateContainerParams =
                    serde_json::from_value(arguments).map_err(|err| HubError::InvalidArguments {
                        tool: tool.name.clone(),
                        message: err.to_string(),
                    })?;
                let session = ContainerSession::new(chat.id.clone(), chat.db_access.clone());
                let result = orchestrator
                    .create_container(params, session)
                    .await
                    .map_err(|err| err.into_hub_error(&tool.name))?;
                let value = serde_json::to_value(&result).map_err(|err| HubError::ToolFailed {
                    tool: tool.name.clone(),
                    message: err.to_string(),
                })?;
                Ok(ToolResult::json(value))
            }
            ToolProvider::Ui { .. } => Ok(ToolResult::text(UI_TOOL_RESULT)),
        }
    }

    async fn open_database(
        &self,
        chat: &Chat,
        tool: &str,
    ) -> Result<Arc<dyn crate::db::DatabaseHandle>, HubError> {
        let scope = DbScope {
            chat_id: chat.id.clone(),
            access: chat.db_access.clone(),
            credential: None,
        };
        self.database
            .connect(&scope)
            .await
            .map_err(|err| err.into_hub_error(tool))
    }

    fn is_disabled_tool(&self, tool: &ToolDescriptor) -> bool {
        match &tool.provider {
            ToolProvider::Mcp { server, .. } => self
                .hub
                .get(server)
                .map(|connection| connection.is_disabled())
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn latest_grant<'a>(grants: &'a [ChatToolGrant], tool_name: &str) -> Option<&'a ChatToolGrant> {
    grants.iter().rev().find(|grant| grant.tool_name == tool_name)
}

fn ensure_unique_names(tools: &[ToolDescriptor]) -> Result<(), HubError> {
    let mut seen = HashSet::new();
    for tool in tools {
        if !seen.insert(tool.name.as_str()) {
            return Err(HubError::configuration(format!(
                "duplicate tool name {} in catalog",
                tool.name
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_arguments(tool: &ToolDescriptor, arguments: &Value) -> Result<(), HubError> {
    let validator = jsonschema::validator_for(&tool.input_schema).map_err(|err| {
        HubError::configuration(format!("tool {} has an invalid input schema: {err}", tool.name))
    })?;
    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|err| err.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(HubError::InvalidArguments {
            tool: tool.name.clone(),
            message: errors.join("; "),
        })
    }
}
