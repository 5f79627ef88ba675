//! In-process tool providers: database CRUD/SQL tools, published server
//! functions, the sandbox tool and the prompt-gated UI meta-tools.

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use toolhub_error::HubError;

use super::{
    full_tool_name, ToolDescriptor, ToolProvider, DB_PROVIDER, FUNCTIONS_PROVIDER,
    SANDBOX_PROVIDER, SANDBOX_TOOL, UI_PROVIDER,
};
use crate::db::DatabaseHandle;
use crate::sandbox::{ContainerRunResult, CreateContainerParams};
use crate::store::{ArgumentType, Chat, DbAccess, PromptType, PublishedFunction, TableAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbTool {
    ExecuteSqlWithRollback,
    ExecuteSqlWithCommit,
    Select,
    Insert,
    Update,
    Delete,
}

impl DbTool {
    pub const ALL: [DbTool; 6] = [
        DbTool::ExecuteSqlWithRollback,
        DbTool::ExecuteSqlWithCommit,
        DbTool::Select,
        DbTool::Insert,
        DbTool::Update,
        DbTool::Delete,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DbTool::ExecuteSqlWithRollback => "execute_sql_with_rollback",
            DbTool::ExecuteSqlWithCommit => "execute_sql_with_commit",
            DbTool::Select => "select",
            DbTool::Insert => "insert",
            DbTool::Update => "update",
            DbTool::Delete => "delete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn full_name(&self) -> String {
        full_tool_name(DB_PROVIDER, self.name())
    }

    fn description(&self) -> &'static str {
        match self {
            DbTool::ExecuteSqlWithRollback => "Executes a SQL query on the connected database in readonly mode (no data can be changed, the transaction is rolled back at the end).",
            DbTool::ExecuteSqlWithCommit => "Executes a SQL query on the connected database in commit mode (data can be changed, the transaction is committed at the end).",
            DbTool::Select => "Selects rows from a table.",
            DbTool::Insert => "Inserts rows into a table.",
            DbTool::Update => "Updates rows in a table.",
            DbTool::Delete => "Deletes rows from a table.",
        }
    }

    fn table_action(&self) -> Option<TableAction> {
        match self {
            DbTool::Select => Some(TableAction::Select),
            DbTool::Insert => Some(TableAction::Insert),
            DbTool::Update => Some(TableAction::Update),
            DbTool::Delete => Some(TableAction::Delete),
            DbTool::ExecuteSqlWithRollback | DbTool::ExecuteSqlWithCommit => None,
        }
    }

    fn input_schema(&self) -> Value {
        match self {
            DbTool::ExecuteSqlWithRollback | DbTool::ExecuteSqlWithCommit => schema_value::<SqlArgs>(),
            DbTool::Select => schema_value::<SelectArgs>(),
            DbTool::Insert => schema_value::<InsertArgs>(),
            DbTool::Update => schema_value::<UpdateArgs>(),
            DbTool::Delete => schema_value::<DeleteArgs>(),
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.full_name(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            output_schema: None,
            provider: ToolProvider::Database { tool: *self },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiTool {
    SuggestDashboards,
    SuggestToolsAndPrompt,
}

impl UiTool {
    pub fn name(&self) -> &'static str {
        match self {
            UiTool::SuggestDashboards => "suggest_dashboards",
            UiTool::SuggestToolsAndPrompt => "suggest_tools_and_prompt",
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct SqlArgs {
    /// SQL query to execute.
    sql: String,
    /// Maximum time in milliseconds the query may run.
    #[serde(default)]
    query_timeout: Option<u64>,
    /// Query parameters referenced by the SQL.
    #[serde(default)]
    query_params: Option<Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SelectArgs {
    /// Table to select from.
    table_name: String,
    /// Row filter, e.g. `{ "id": 1 }`.
    #[serde(default)]
    filter: Option<Map<String, Value>>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct InsertArgs {
    /// Table to insert into.
    table_name: String,
    /// Rows to insert. Must satisfy the table schema.
    data: Vec<Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpdateArgs {
    /// Table to update.
    table_name: String,
    /// Row filter, e.g. `{ "id": 1 }`.
    filter: Map<String, Value>,
    /// Column values to set.
    data: Map<String, Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DeleteArgs {
    /// Table to delete from.
    table_name: String,
    /// Row filter, e.g. `{ "id": 1 }`.
    filter: Map<String, Value>,
}

/// Draft-07 schema with subschemas inlined, as JSON.
pub fn schema_value<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|settings| settings.inline_subschemas = true)
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}))
}

/// The database tools a chat's access mode exposes.
pub fn db_tools_for(access: &DbAccess) -> Vec<DbTool> {
    match access {
        DbAccess::None => Vec::new(),
        DbAccess::ExecuteSqlRollback { .. } => vec![DbTool::ExecuteSqlWithRollback],
        DbAccess::ExecuteSqlCommit { .. } => vec![DbTool::ExecuteSqlWithCommit],
        DbAccess::Custom { tables } => DbTool::ALL
            .into_iter()
            .filter(|tool| {
                tool.table_action()
                    .map(|action| tables.iter().any(|table| table.allows(action)))
                    .unwrap_or(false)
            })
            .collect(),
    }
}

pub fn function_descriptor(function: &PublishedFunction) -> ToolDescriptor {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for argument in &function.arguments {
        let mut property = Map::new();
        property.insert(
            "type".to_string(),
            Value::String(argument_type_name(argument.type_).to_string()),
        );
        if let Some(description) = &argument.description {
            property.insert("description".to_string(), Value::String(description.clone()));
        }
        properties.insert(argument.name.clone(), Value::Object(property));
        if !argument.optional {
            required.push(Value::String(argument.name.clone()));
        }
    }
    ToolDescriptor {
        name: full_tool_name(FUNCTIONS_PROVIDER, &function.name),
        description: function.description.clone(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        }),
        output_schema: None,
        provider: ToolProvider::Function {
            name: function.name.clone(),
        },
    }
}

fn argument_type_name(kind: ArgumentType) -> &'static str {
    match kind {
        ArgumentType::String => "string",
        ArgumentType::Number => "number",
        ArgumentType::Integer => "integer",
        ArgumentType::Boolean => "boolean",
        ArgumentType::Object => "object",
        ArgumentType::Array => "array",
    }
}

pub fn sandbox_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: full_tool_name(SANDBOX_PROVIDER, SANDBOX_TOOL),
        description: "Creates a docker container from the given files, runs it once and returns its output. Useful for bulk data insert, analysis, processing and ETL.".to_string(),
        input_schema: schema_value::<CreateContainerParams>(),
        output_schema: Some(schema_value::<ContainerRunResult>()),
        provider: ToolProvider::Sandbox,
    }
}

/// UI meta-tools offered by the active prompt. The task tool is admin-only
/// and enumerates `known_tools` as its suggestion vocabulary.
pub fn ui_descriptors(chat: &Chat, known_tools: &[String]) -> Vec<ToolDescriptor> {
    match chat.prompt_type {
        Some(PromptType::Dashboard) => vec![ToolDescriptor {
            name: full_tool_name(UI_PROVIDER, UiTool::SuggestDashboards.name()),
            description: "Suggests dashboard workspaces to create for the user.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "workspaces": {
                        "type": "array",
                        "description": "Workspaces to create.",
                        "items": {"type": "object"},
                    },
                },
                "required": ["workspaces"],
                "additionalProperties": false,
            }),
            output_schema: None,
            provider: ToolProvider::Ui {
                tool: UiTool::SuggestDashboards,
            },
        }],
        Some(PromptType::Task) if chat.is_admin => {
            let tool_names = if known_tools.is_empty() {
                json!({"type": "string"})
            } else {
                json!({"type": "string", "enum": known_tools})
            };
            let db_tool_names: Vec<String> = DbTool::ALL.iter().map(DbTool::full_name).collect();
            let mut access_schema = schema_value::<DbAccess>();
            if let Value::Object(map) = &mut access_schema {
                map.remove("$schema");
                map.remove("title");
            }
            vec![ToolDescriptor {
                name: full_tool_name(UI_PROVIDER, UiTool::SuggestToolsAndPrompt.name()),
                description: "Suggests the tools, database access and system prompt needed to complete the user's task.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "suggested_mcp_tool_names": {
                            "type": "array",
                            "description": "Tools that can be used to complete the task.",
                            "items": tool_names,
                        },
                        "suggested_database_tool_names": {
                            "type": "array",
                            "description": "Database tools that can be used to complete the task.",
                            "items": {"type": "string", "enum": db_tool_names},
                        },
                        "suggested_prompt": {
                            "type": "string",
                            "description": "System prompt for the chat that will complete the task.",
                        },
                        "suggested_database_access": access_schema,
                    },
                    "required": ["suggested_mcp_tool_names", "suggested_prompt", "suggested_database_access"],
                    "additionalProperties": false,
                }),
                output_schema: None,
                provider: ToolProvider::Ui {
                    tool: UiTool::SuggestToolsAndPrompt,
                },
            }]
        }
        _ => Vec::new(),
    }
}

/// Runs one database tool against a scoped handle. Shared by the permission
/// gate and the sandbox callback proxy.
pub async fn execute_db_tool(
    handle: &dyn DatabaseHandle,
    access: &DbAccess,
    tool: DbTool,
    arguments: Value,
) -> Result<Value, HubError> {
    let full_name = tool.full_name();
    if !db_tools_for(access).contains(&tool) {
        return Err(HubError::NotAuthorized {
            tool: full_name,
            message: Some("not available under the chat's database access mode".to_string()),
        });
    }

    match tool {
        DbTool::ExecuteSqlWithRollback | DbTool::ExecuteSqlWithCommit => {
            let args: SqlArgs = parse_args(&full_name, arguments)?;
            let query = with_statement_timeout(&args.sql, access.query_timeout_secs(), args.query_timeout);
            let commit = tool == DbTool::ExecuteSqlWithCommit;
            handle
                .sql(&query, args.query_params, commit)
                .await
                .map_err(|err| err.into_hub_error(&full_name))
        }
        DbTool::Select => {
            let args: SelectArgs = parse_args(&full_name, arguments)?;
            check_table(access, &args.table_name, TableAction::Select, &full_name)?;
            handle
                .find(
                    &args.table_name,
                    Value::Object(args.filter.unwrap_or_default()),
                    args.limit,
                )
                .await
                .map_err(|err| err.into_hub_error(&full_name))
        }
        DbTool::Insert => {
            let args: InsertArgs = parse_args(&full_name, arguments)?;
            check_table(access, &args.table_name, TableAction::Insert, &full_name)?;
            let count = handle
                .insert(&args.table_name, args.data)
                .await
                .map_err(|err| err.into_hub_error(&full_name))?;
            Ok(Value::String(format!("{count} rows inserted")))
        }
        DbTool::Update => {
            let args: UpdateArgs = parse_args(&full_name, arguments)?;
            check_table(access, &args.table_name, TableAction::Update, &full_name)?;
            let count = handle
                .update(&args.table_name, Value::Object(args.filter), Value::Object(args.data))
                .await
                .map_err(|err| err.into_hub_error(&full_name))?;
            Ok(Value::String(format!("{count} rows updated")))
        }
        DbTool::Delete => {
            let args: DeleteArgs = parse_args(&full_name, arguments)?;
            check_table(access, &args.table_name, TableAction::Delete, &full_name)?;
            let count = handle
                .delete(&args.table_name, Value::Object(args.filter))
                .await
                .map_err(|err| err.into_hub_error(&full_name))?;
            Ok(Value::String(format!("{count} rows deleted")))
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, HubError> {
    serde_json::from_value(arguments).map_err(|err| HubError::InvalidArguments {
        tool: tool.to_string(),
        message: err.to_string(),
    })
}

fn check_table(
    access: &DbAccess,
    table: &str,
    action: TableAction,
    tool: &str,
) -> Result<(), HubError> {
    let allowed = access
        .table(table)
        .map(|permission| permission.allows(action))
        .unwrap_or(false);
    if allowed {
        Ok(())
    } else {
        Err(HubError::NotAuthorized {
            tool: tool.to_string(),
            message: Some(format!("{} is not permitted on table {table}", action.as_str())),
        })
    }
}

/// The chat-level limit wins over a per-call limit.
fn with_statement_timeout(sql: &str, mode_secs: Option<u64>, call_ms: Option<u64>) -> String {
    match (mode_secs, call_ms) {
        (Some(secs), _) => format!("SET LOCAL statement_timeout to '{secs}s';\n{sql}"),
        (None, Some(ms)) => format!("SET LOCAL statement_timeout to '{ms}ms';\n{sql}"),
        (None, None) => sql.to_string(),
    }
}
