//! Chat/session store boundary: chats, their tool grants, published server
//! functions, and the append-only tool call audit log.

use std::sync::RwLock;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use toolhub_error::{HubError, ToolFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    Chat,
    Dashboard,
    Task,
}

/// Table-level permissions for the `Custom` database access mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TablePermission {
    pub table_name: String,
    #[serde(default)]
    pub select: bool,
    #[serde(default)]
    pub insert: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub delete: bool,
}

impl TablePermission {
    pub fn allows(&self, action: TableAction) -> bool {
        match action {
            TableAction::Select => self.select,
            TableAction::Insert => self.insert,
            TableAction::Update => self.update,
            TableAction::Delete => self.delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TableAction {
    Select,
    Insert,
    Update,
    Delete,
}

impl TableAction {
    pub const ALL: [TableAction; 4] = [
        TableAction::Select,
        TableAction::Insert,
        TableAction::Update,
        TableAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableAction::Select => "select",
            TableAction::Insert => "insert",
            TableAction::Update => "update",
            TableAction::Delete => "delete",
        }
    }
}

/// What a chat may do against the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DbAccess {
    #[default]
    None,
    Custom {
        tables: Vec<TablePermission>,
    },
    ExecuteSqlRollback {
        #[serde(default, rename = "queryTimeoutSecs", skip_serializing_if = "Option::is_none")]
        query_timeout_secs: Option<u64>,
    },
    ExecuteSqlCommit {
        #[serde(default, rename = "queryTimeoutSecs", skip_serializing_if = "Option::is_none")]
        query_timeout_secs: Option<u64>,
    },
}

impl DbAccess {
    pub fn table(&self, table_name: &str) -> Option<&TablePermission> {
        match self {
            DbAccess::Custom { tables } => tables.iter().find(|t| t.table_name == table_name),
            _ => None,
        }
    }

    pub fn query_timeout_secs(&self) -> Option<u64> {
        match self {
            DbAccess::ExecuteSqlRollback { query_timeout_secs }
            | DbAccess::ExecuteSqlCommit { query_timeout_secs } => *query_timeout_secs,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub db_access: DbAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_type: Option<PromptType>,
    #[serde(default)]
    pub is_admin: bool,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            db_access: DbAccess::None,
            prompt_type: None,
            is_admin: false,
        }
    }
}

/// Permission for one chat to invoke one tool. Later grants supersede earlier
/// ones for the same pair; grants are never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatToolGrant {
    pub chat_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub auto_approve: bool,
    /// When present, only these exact argument objects are authorized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_inputs: Option<Vec<Value>>,
}

impl ChatToolGrant {
    pub fn new(chat_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            tool_name: tool_name.into(),
            auto_approve: false,
            allowed_inputs: None,
        }
    }

    pub fn auto_approved(mut self) -> Self {
        self.auto_approve = true;
        self
    }

    pub fn allowing(mut self, inputs: Vec<Value>) -> Self {
        self.allowed_inputs = Some(inputs);
        self
    }

    pub fn permits(&self, arguments: &Value) -> bool {
        match &self.allowed_inputs {
            Some(allowed) if !allowed.is_empty() => allowed.iter().any(|item| item == arguments),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: ArgumentType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A server-side function published to chats as a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedFunction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<FunctionArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolCallOutcome {
    Output(Value),
    Error(ToolFailure),
}

/// Append-only audit entry, written once per invocation attempt after it settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
    /// RFC 3339 timestamp.
    pub started_at: String,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: ToolCallOutcome,
}

impl ToolCallRecord {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolCallOutcome::Error(_))
    }
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn tool_grants(&self, chat_id: &str) -> Result<Vec<ChatToolGrant>, HubError>;

    async fn published_functions(&self) -> Result<Vec<PublishedFunction>, HubError>;

    async fn record_tool_call(&self, record: ToolCallRecord) -> Result<(), HubError>;

    /// The effective grant for one tool: the most recently inserted one.
    async fn tool_grant(
        &self,
        chat_id: &str,
        tool_name: &str,
    ) -> Result<Option<ChatToolGrant>, HubError> {
        Ok(self
            .tool_grants(chat_id)
            .await?
            .into_iter()
            .rev()
            .find(|grant| grant.tool_name == tool_name))
    }
}

/// Process-local store, used by the binary when no external store is wired
/// and by tests.
#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    grants: RwLock<Vec<ChatToolGrant>>,
    functions: RwLock<Vec<PublishedFunction>>,
    records: RwLock<Vec<ToolCallRecord>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_grant(&self, grant: ChatToolGrant) {
        if let Ok(mut grants) = self.grants.write() {
            grants.push(grant);
        }
    }

    pub fn publish_function(&self, function: PublishedFunction) {
        if let Ok(mut functions) = self.functions.write() {
            functions.retain(|existing| existing.name != function.name);
            functions.push(function);
        }
    }

    pub fn records(&self) -> Vec<ToolCallRecord> {
        self.records
            .read()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn tool_grants(&self, chat_id: &str) -> Result<Vec<ChatToolGrant>, HubError> {
        Ok(self
            .grants
            .read()
            .map(|grants| {
                grants
                    .iter()
                    .filter(|grant| grant.chat_id == chat_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn published_functions(&self) -> Result<Vec<PublishedFunction>, HubError> {
        Ok(self
            .functions
            .read()
            .map(|functions| functions.clone())
            .unwrap_or_default())
    }

    async fn record_tool_call(&self, record: ToolCallRecord) -> Result<(), HubError> {
        self.records
            .write()
            .map_err(|_| HubError::configuration("tool call log lock poisoned"))?
            .push(record);
        Ok(())
    }
}
