#![cfg(unix)]

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use toolhub::hub::ConnectionHub;
use toolhub::sandbox::{ContainerRegistry, SandboxOrchestrator, SandboxSettings};
use toolhub::store::{
    ArgumentType, Chat, ChatToolGrant, DbAccess, FunctionArgument, InMemoryChatStore, PromptType,
    PublishedFunction, TablePermission,
};
use toolhub::tools::{ApprovalState, ToolGate, ToolResult, ToolUseRequest};
use toolhub_error::ErrorType;

use common::{
    mock_server, mock_server_with_tools, servers, FakeEngine, RecordingDatabase, RunBehavior,
    SpawnLog,
};

struct GateHarness {
    gate: ToolGate,
    hub: ConnectionHub,
    store: Arc<InMemoryChatStore>,
    database: RecordingDatabase,
    _spawns: SpawnLog,
}

impl GateHarness {
    async fn new() -> Self {
        let spawns = SpawnLog::new();
        let hub = ConnectionHub::default();
        let mut quiet = mock_server("q:", &spawns.path());
        quiet.disabled = true;
        hub.set_server_connections(&servers(vec![
            ("fetch", mock_server("f:", &spawns.path())),
            ("quiet", quiet),
        ]))
        .await;
        assert_eq!(hub.connection_names(), vec!["fetch", "quiet"]);

        let store = Arc::new(InMemoryChatStore::new());
        let database = RecordingDatabase::new();
        let gate = ToolGate::new(hub.clone(), store.clone(), Arc::new(database.clone()));
        Self {
            gate,
            hub,
            store,
            database,
            _spawns: spawns,
        }
    }

    fn grant(&self, grant: ChatToolGrant) {
        self.store.insert_grant(grant);
    }

    async fn catalog_names(&self, chat: &Chat) -> Vec<String> {
        let mut names: Vec<String> = self
            .gate
            .get_catalog(chat)
            .await
            .expect("catalog")
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        names.sort();
        names
    }
}

fn chat() -> Chat {
    Chat {
        db_access: DbAccess::Custom {
            tables: vec![TablePermission {
                table_name: "orders".to_string(),
                select: true,
                insert: false,
                update: false,
                delete: false,
            }],
        },
        user_id: Some("user-1".to_string()),
        ..Chat::new("chat-1")
    }
}

fn error_type(result: &ToolResult) -> Option<ErrorType> {
    result.error.as_ref().map(|failure| failure.type_)
}

fn text(result: &ToolResult) -> &str {
    result.content[0]["text"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn catalog_contains_only_granted_and_enabled_tools() {
    let harness = GateHarness::new().await;
    let chat = chat();

    assert_eq!(harness.catalog_names(&chat).await, vec!["db--select"]);

    harness.grant(ChatToolGrant::new("chat-1", "fetch--echo"));
    harness.grant(ChatToolGrant::new("chat-1", "quiet--echo"));
    harness.grant(ChatToolGrant::new("other-chat", "fetch--echo"));
    assert_eq!(
        harness.catalog_names(&chat).await,
        vec!["db--select", "fetch--echo"]
    );

    // Every chat sees its own grants only.
    assert!(harness
        .catalog_names(&Chat::new("stranger"))
        .await
        .is_empty());

    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn ungranted_tool_is_not_authorized_and_audited_once() {
    let harness = GateHarness::new().await;
    let result = harness
        .gate
        .invoke(&chat(), "fetch--echo", json!({"text": "hi"}))
        .await;

    assert!(result.is_error);
    assert_eq!(error_type(&result), Some(ErrorType::NotAuthorized));
    let records = harness.store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_error());
    assert_eq!(records[0].tool_name, "fetch--echo");
    assert_eq!(records[0].user_id.as_deref(), Some("user-1"));

    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn granted_tool_is_dispatched_to_its_server() {
    let harness = GateHarness::new().await;
    harness.grant(ChatToolGrant::new("chat-1", "fetch--echo"));

    let result = harness
        .gate
        .invoke(&chat(), "fetch--echo", json!({"text": "hi"}))
        .await;
    assert!(!result.is_error, "{result:?}");
    assert_eq!(text(&result), "f:hi");

    let records = harness.store.records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_error());
    assert_eq!(records[0].arguments, json!({"text": "hi"}));

    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn invalid_arguments_are_never_dispatched() {
    let harness = GateHarness::new().await;
    let result = harness
        .gate
        .invoke(&chat(), "db--select", json!({"tableName": 5}))
        .await;

    assert_eq!(error_type(&result), Some(ErrorType::InvalidArguments));
    assert!(harness.database.calls().is_empty());
    assert_eq!(harness.store.records().len(), 1);

    let result = harness
        .gate
        .invoke(&chat(), "db--select", json!({"tableName": "orders", "limit": 3}))
        .await;
    assert!(!result.is_error, "{result:?}");
    let calls = harness.database.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "find");
    assert_eq!(calls[0].credential, None);

    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn allow_list_admits_only_exact_inputs() {
    let harness = GateHarness::new().await;
    harness.grant(
        ChatToolGrant::new("chat-1", "fetch--echo").allowing(vec![json!({"text": "ok"})]),
    );

    let denied = harness
        .gate
        .invoke(&chat(), "fetch--echo", json!({"text": "other"}))
        .await;
    assert_eq!(error_type(&denied), Some(ErrorType::NotAuthorized));

    let allowed = harness
        .gate
        .invoke(&chat(), "fetch--echo", json!({"text": "ok"}))
        .await;
    assert_eq!(text(&allowed), "f:ok");
    assert_eq!(harness.store.records().len(), 2);

    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn disabled_and_unknown_tools_fail_with_their_own_errors() {
    let harness = GateHarness::new().await;
    harness.grant(ChatToolGrant::new("chat-1", "quiet--echo"));

    let disabled = harness.gate.invoke(&chat(), "quiet--echo", json!({})).await;
    assert_eq!(error_type(&disabled), Some(ErrorType::ServerDisabled));

    let unknown = harness.gate.invoke(&chat(), "fetch--missing", json!({})).await;
    assert_eq!(error_type(&unknown), Some(ErrorType::NotFound));

    assert_eq!(harness.store.records().len(), 2);
    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn colliding_tool_names_fail_the_catalog() {
    let spawns = SpawnLog::new();
    let hub = ConnectionHub::default();
    hub.set_server_connections(&servers(vec![(
        "db",
        mock_server_with_tools("x:", "select", &spawns.path()),
    )]))
    .await;
    let store = Arc::new(InMemoryChatStore::new());
    let gate = ToolGate::new(hub.clone(), store.clone(), Arc::new(RecordingDatabase::new()));

    let err = gate.get_catalog(&chat()).await.expect_err("duplicate name");
    assert!(err.to_string().contains("db--select"));

    let result = gate.invoke(&chat(), "db--select", json!({"tableName": "orders"})).await;
    assert_eq!(error_type(&result), Some(ErrorType::Configuration));
    assert_eq!(store.records().len(), 1);

    // Without the database tool the names no longer collide.
    let names: Vec<String> = gate
        .get_catalog(&Chat::new("chat-1"))
        .await
        .expect("catalog")
        .into_iter()
        .map(|tool| tool.name)
        .collect();
    assert!(names.is_empty());

    hub.destroy_all().await;
}

#[tokio::test]
async fn published_functions_need_a_grant() {
    let harness = GateHarness::new().await;
    harness.store.publish_function(PublishedFunction {
        name: "summarize".to_string(),
        description: "Summarizes a text".to_string(),
        arguments: vec![FunctionArgument {
            name: "text".to_string(),
            type_: ArgumentType::String,
            optional: false,
            description: None,
        }],
    });

    let denied = harness
        .gate
        .invoke(&chat(), "db-methods--summarize", json!({"text": "abc"}))
        .await;
    assert_eq!(error_type(&denied), Some(ErrorType::NotAuthorized));

    harness.grant(ChatToolGrant::new("chat-1", "db-methods--summarize"));
    let missing_arg = harness
        .gate
        .invoke(&chat(), "db-methods--summarize", json!({}))
        .await;
    assert_eq!(error_type(&missing_arg), Some(ErrorType::InvalidArguments));

    let result = harness
        .gate
        .invoke(&chat(), "db-methods--summarize", json!({"text": "abc"}))
        .await;
    assert_eq!(result.structured_content, Some(json!({"ok": true})));
    let calls = harness.database.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload["name"], "summarize");

    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn dashboard_prompt_offers_the_ui_tool() {
    let harness = GateHarness::new().await;
    let chat = Chat {
        prompt_type: Some(PromptType::Dashboard),
        ..chat()
    };

    assert!(harness
        .catalog_names(&chat)
        .await
        .contains(&"ui--suggest_dashboards".to_string()));

    let result = harness
        .gate
        .invoke(&chat, "ui--suggest_dashboards", json!({"workspaces": []}))
        .await;
    assert_eq!(text(&result), "Done");

    harness.hub.destroy_all().await;
}

#[tokio::test]
async fn tool_uses_are_planned_against_grants_and_approvals() {
    let harness = GateHarness::new().await;
    harness.grant(ChatToolGrant::new("chat-1", "fetch--echo").auto_approved());
    let chat = chat();
    let requests = vec![
        ToolUseRequest {
            id: "1".to_string(),
            name: "fetch--echo".to_string(),
            arguments: json!({"text": "a"}),
        },
        ToolUseRequest {
            id: "2".to_string(),
            name: "db--select".to_string(),
            arguments: json!({"tableName": "orders"}),
        },
        ToolUseRequest {
            id: "3".to_string(),
            name: "quiet--echo".to_string(),
            arguments: Value::Null,
        },
    ];

    let states = |planned: Vec<toolhub::tools::PlannedToolUse>| {
        planned.into_iter().map(|use_| use_.state).collect::<Vec<_>>()
    };

    let pending = harness
        .gate
        .plan_tool_uses(&chat, &requests, None)
        .await
        .expect("plan");
    assert_eq!(
        states(pending),
        vec![
            ApprovalState::Approved,
            ApprovalState::NeedsApproval,
            ApprovalState::Missing
        ]
    );

    let approved = harness
        .gate
        .plan_tool_uses(&chat, &requests, Some(vec!["2".to_string()].as_slice()))
        .await
        .expect("plan");
    assert_eq!(states(approved)[1], ApprovalState::Approved);

    let rejected = harness
        .gate
        .plan_tool_uses(&chat, &requests, Some(Vec::<String>::new().as_slice()))
        .await
        .expect("plan");
    assert_eq!(states(rejected)[1], ApprovalState::Denied);
    assert_eq!(
        serde_json::to_value(ApprovalState::Missing).unwrap(),
        json!("tool-missing")
    );

    harness.hub.destroy_all().await;
}

const SANDBOX_TOOL: &str = "docker-sandbox--create_container";

struct SandboxGate {
    gate: ToolGate,
    store: Arc<InMemoryChatStore>,
    engine: Arc<FakeEngine>,
    _work_root: tempfile::TempDir,
}

impl SandboxGate {
    fn new(engine: Arc<FakeEngine>) -> Self {
        let registry = ContainerRegistry::new(engine.clone());
        engine.observe(&registry);
        let work_root = tempfile::tempdir().expect("work root");
        let orchestrator = SandboxOrchestrator::new(
            engine.clone(),
            registry,
            SandboxSettings {
                work_root: Some(work_root.path().to_path_buf()),
                ..SandboxSettings::default()
            },
        );
        let store = Arc::new(InMemoryChatStore::new());
        let gate = ToolGate::new(
            ConnectionHub::default(),
            store.clone(),
            Arc::new(RecordingDatabase::new()),
        )
        .with_sandbox(orchestrator);
        Self {
            gate,
            store,
            engine,
            _work_root: work_root,
        }
    }

    fn grant(&self) {
        self.store.insert_grant(ChatToolGrant::new("chat-1", SANDBOX_TOOL));
    }
}

fn sandbox_files(dockerfile: &str) -> Value {
    json!({"files": {"Dockerfile": dockerfile, "job.sh": "echo hi"}})
}

#[tokio::test]
async fn sandbox_tool_needs_a_grant_and_is_audited() {
    let sandbox = SandboxGate::new(FakeEngine::new(0, RunBehavior::Exit(0)));
    let chat = chat();

    let catalog = sandbox.gate.get_catalog(&chat).await.expect("catalog");
    assert!(!catalog.iter().any(|tool| tool.name == SANDBOX_TOOL));
    let denied = sandbox
        .gate
        .invoke(&chat, SANDBOX_TOOL, sandbox_files("FROM alpine"))
        .await;
    assert_eq!(error_type(&denied), Some(ErrorType::NotAuthorized));
    assert!(sandbox.engine.commands().is_empty());

    sandbox.grant();
    let catalog = sandbox.gate.get_catalog(&chat).await.expect("catalog");
    assert!(catalog.iter().any(|tool| tool.name == SANDBOX_TOOL));
    let result = sandbox
        .gate
        .invoke(&chat, SANDBOX_TOOL, sandbox_files("FROM alpine\nCMD sh job.sh"))
        .await;
    assert!(!result.is_error, "{result:?}");
    let output = result.structured_content.expect("run result");
    assert_eq!(output["state"], "finished");
    assert_eq!(output["stdout"], "hello from sandbox\n");
    assert_eq!(sandbox.engine.verbs(), vec!["build", "run", "rmi"]);
    assert_eq!(sandbox.engine.registered_during_run(), vec![true]);

    let records = sandbox.store.records();
    assert_eq!(records.len(), 2);
    assert!(records[0].is_error());
    assert!(!records[1].is_error());
    assert_eq!(records[1].tool_name, SANDBOX_TOOL);
}

#[tokio::test]
async fn sandbox_failures_come_back_as_tool_results() {
    let sandbox = SandboxGate::new(FakeEngine::new(0, RunBehavior::Exit(0)));
    sandbox.grant();
    let exposed = sandbox
        .gate
        .invoke(&chat(), SANDBOX_TOOL, sandbox_files("FROM alpine\nEXPOSE 80"))
        .await;
    assert_eq!(error_type(&exposed), Some(ErrorType::InvalidArguments));
    assert!(sandbox.engine.commands().is_empty());

    let unknown_field = sandbox
        .gate
        .invoke(&chat(), SANDBOX_TOOL, json!({"files": {"Dockerfile": "FROM alpine"}, "ports": [80]}))
        .await;
    assert_eq!(error_type(&unknown_field), Some(ErrorType::InvalidArguments));
    assert_eq!(sandbox.store.records().len(), 2);

    let unavailable = SandboxGate::new(FakeEngine::unavailable());
    unavailable.grant();
    let result = unavailable
        .gate
        .invoke(&chat(), SANDBOX_TOOL, sandbox_files("FROM alpine"))
        .await;
    assert!(result.is_error);
    assert_eq!(error_type(&result), Some(ErrorType::EngineUnavailable));
    let records = unavailable.store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_error());
}

#[tokio::test]
async fn gate_without_sandbox_does_not_offer_it() {
    let harness = GateHarness::new().await;
    harness.grant(ChatToolGrant::new("chat-1", SANDBOX_TOOL));
    let result = harness
        .gate
        .invoke(&chat(), SANDBOX_TOOL, sandbox_files("FROM alpine"))
        .await;
    assert_eq!(error_type(&result), Some(ErrorType::NotFound));
    harness.hub.destroy_all().await;
}
