#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use toolhub::config::{ServerLaunchConfig, ServersConfig};
use toolhub::db::{DatabaseConnector, DatabaseHandle, DbError, DbScope};
use toolhub::sandbox::{ContainerEngine, ContainerRegistry, EngineOutput, SandboxError};
use toolhub_stdio_transport::LaunchSpec;

pub const MOCK_SERVER: &str = env!("CARGO_BIN_EXE_mock-tool-server");

/// Scratch dir holding the spawn log shared by every mock server of a test.
pub struct SpawnLog {
    dir: TempDir,
}

impl SpawnLog {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create spawn log dir"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("spawns.log")
    }

    pub fn count(&self) -> usize {
        std::fs::read_to_string(self.path())
            .map(|text| text.lines().filter(|line| !line.is_empty()).count())
            .unwrap_or(0)
    }
}

pub fn mock_server(tag: &str, spawn_log: &Path) -> ServerLaunchConfig {
    ServerLaunchConfig {
        launch: LaunchSpec::new(MOCK_SERVER)
            .arg(tag)
            .env("MOCK_TOOL_SERVER_SPAWN_LOG", spawn_log.to_string_lossy()),
        disabled: false,
    }
}

pub fn mock_server_with_tools(tag: &str, tools: &str, spawn_log: &Path) -> ServerLaunchConfig {
    let mut config = mock_server(tag, spawn_log);
    config.launch = config.launch.env("MOCK_TOOL_SERVER_TOOLS", tools);
    config
}

pub fn failing_server(message: &str, spawn_log: &Path) -> ServerLaunchConfig {
    let mut config = mock_server("failing", spawn_log);
    config.launch = config.launch.env("MOCK_TOOL_SERVER_FAIL", message);
    config
}

pub fn servers(entries: Vec<(&str, ServerLaunchConfig)>) -> ServersConfig {
    entries
        .into_iter()
        .map(|(name, config)| (name.to_string(), config))
        .collect::<BTreeMap<_, _>>()
}

pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// One call observed by [`RecordingDatabase`].
#[derive(Debug, Clone, PartialEq)]
pub struct DbCall {
    pub chat_id: String,
    pub credential: Option<String>,
    pub action: String,
    pub payload: Value,
}

/// Database fake that records every call and answers with canned values.
#[derive(Debug, Default, Clone)]
pub struct RecordingDatabase {
    calls: Arc<Mutex<Vec<DbCall>>>,
}

impl RecordingDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DbCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl DatabaseConnector for RecordingDatabase {
    async fn connect(&self, scope: &DbScope) -> Result<Arc<dyn DatabaseHandle>, DbError> {
        Ok(Arc::new(RecordingHandle {
            scope: scope.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct RecordingHandle {
    scope: DbScope,
    calls: Arc<Mutex<Vec<DbCall>>>,
}

impl RecordingHandle {
    fn record(&self, action: &str, payload: Value) {
        self.calls.lock().expect("calls lock").push(DbCall {
            chat_id: self.scope.chat_id.clone(),
            credential: self.scope.credential.clone(),
            action: action.to_string(),
            payload,
        });
    }
}

#[async_trait]
impl DatabaseHandle for RecordingHandle {
    async fn find(&self, table: &str, filter: Value, limit: Option<u64>) -> Result<Value, DbError> {
        self.record("find", json!({"table": table, "filter": filter, "limit": limit}));
        Ok(json!([{"id": 1, "table": table}]))
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<u64, DbError> {
        let count = rows.len() as u64;
        self.record("insert", json!({"table": table, "rows": rows}));
        Ok(count)
    }

    async fn update(&self, table: &str, filter: Value, data: Value) -> Result<u64, DbError> {
        self.record("update", json!({"table": table, "filter": filter, "data": data}));
        Ok(1)
    }

    async fn delete(&self, table: &str, filter: Value) -> Result<u64, DbError> {
        self.record("delete", json!({"table": table, "filter": filter}));
        Ok(1)
    }

    async fn sql(&self, query: &str, params: Option<Value>, commit: bool) -> Result<Value, DbError> {
        self.record("sql", json!({"query": query, "params": params, "commit": commit}));
        Ok(json!([]))
    }

    async fn run_function(&self, name: &str, arguments: Value) -> Result<Value, DbError> {
        self.record("function", json!({"name": name, "arguments": arguments}));
        Ok(json!({"ok": true}))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RunBehavior {
    Exit(i32),
    TimeOut,
    /// `run` never returns.
    Hang,
}

#[derive(Default)]
struct EngineLog {
    commands: Vec<Vec<String>>,
    build_dirs: Vec<PathBuf>,
    dockerfiles: Vec<String>,
    registered_during_run: Vec<bool>,
}

/// Scripted container engine: builds succeed unless `build_exit` says
/// otherwise, runs follow `run`, and `inspect` answers from assigned addresses.
pub struct FakeEngine {
    build_exit: i32,
    run: RunBehavior,
    unavailable: bool,
    addresses: Mutex<HashMap<String, IpAddr>>,
    registry: Mutex<Option<ContainerRegistry>>,
    log: Mutex<EngineLog>,
    inspect_calls: Mutex<usize>,
}

impl FakeEngine {
    pub fn new(build_exit: i32, run: RunBehavior) -> Arc<Self> {
        Arc::new(Self::scripted(build_exit, run, false))
    }

    /// An engine whose CLI cannot be invoked at all.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self::scripted(0, RunBehavior::Exit(0), true))
    }

    fn scripted(build_exit: i32, run: RunBehavior, unavailable: bool) -> Self {
        Self {
            build_exit,
            run,
            unavailable,
            addresses: Mutex::new(HashMap::new()),
            registry: Mutex::new(None),
            log: Mutex::new(EngineLog::default()),
            inspect_calls: Mutex::new(0),
        }
    }

    /// Lets `run` report whether its container was registered while running.
    pub fn observe(&self, registry: &ContainerRegistry) {
        *self.registry.lock().unwrap() = Some(registry.clone());
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().commands.clone()
    }

    pub fn verbs(&self) -> Vec<String> {
        self.commands().iter().map(|args| args[0].clone()).collect()
    }

    pub fn build_dirs(&self) -> Vec<PathBuf> {
        self.log.lock().unwrap().build_dirs.clone()
    }

    pub fn dockerfiles(&self) -> Vec<String> {
        self.log.lock().unwrap().dockerfiles.clone()
    }

    pub fn registered_during_run(&self) -> Vec<bool> {
        self.log.lock().unwrap().registered_during_run.clone()
    }

    pub fn inspect_calls(&self) -> usize {
        *self.inspect_calls.lock().unwrap()
    }

    pub fn assign(&self, name: &str, address: IpAddr) {
        self.addresses.lock().unwrap().insert(name.to_string(), address);
    }

    fn record_run(&self, args: &[String]) {
        let name = args[args.iter().position(|arg| arg == "--name").unwrap() + 1].clone();
        let registered = self
            .registry
            .lock()
            .unwrap()
            .as_ref()
            .map(|registry| registry.contains(&name))
            .unwrap_or(false);
        self.log.lock().unwrap().registered_during_run.push(registered);
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn program(&self) -> &str {
        "docker"
    }

    async fn exec(
        &self,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> Result<EngineOutput, SandboxError> {
        if self.unavailable {
            return Err(SandboxError::EngineUnavailable(
                "docker: No such file or directory".to_string(),
            ));
        }
        self.log.lock().unwrap().commands.push(args.to_vec());
        match args[0].as_str() {
            "build" => {
                let dir = PathBuf::from(args.last().unwrap());
                let dockerfile = std::fs::read_to_string(dir.join("Dockerfile")).unwrap_or_default();
                let mut log = self.log.lock().unwrap();
                log.dockerfiles.push(dockerfile);
                log.build_dirs.push(dir);
                Ok(EngineOutput {
                    exit_code: Some(self.build_exit),
                    stdout: "Step 1/2 : FROM alpine".to_string(),
                    stderr: if self.build_exit == 0 {
                        String::new()
                    } else {
                        "unknown instruction: RUNN".to_string()
                    },
                    timed_out: false,
                })
            }
            "run" => {
                self.record_run(args);
                match self.run {
                    RunBehavior::Exit(code) => Ok(EngineOutput {
                        exit_code: Some(code),
                        stdout: "hello from sandbox\n".to_string(),
                        stderr: String::new(),
                        timed_out: false,
                    }),
                    RunBehavior::TimeOut => Ok(EngineOutput {
                        exit_code: None,
                        stdout: "partial".to_string(),
                        stderr: String::new(),
                        timed_out: true,
                    }),
                    RunBehavior::Hang => std::future::pending().await,
                }
            }
            _ => Ok(EngineOutput {
                exit_code: Some(0),
                ..EngineOutput::default()
            }),
        }
    }

    async fn container_addresses(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, IpAddr>, SandboxError> {
        *self.inspect_calls.lock().unwrap() += 1;
        let addresses = self.addresses.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|name| addresses.get(name).map(|address| (name.clone(), *address)))
            .collect())
    }
}
