use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use crate::launch::LaunchSpec;

const DEFAULT_LOG_CAPACITY: usize = 500;
const EVENT_CHANNEL_SIZE: usize = 256;
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
/// How long the exit watcher waits for buffered stderr after the child is reaped.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn subprocess `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture subprocess stdin")]
    MissingStdin,
    #[error("failed to capture subprocess stdout")]
    MissingStdout,
    #[error("failed to capture subprocess stderr")]
    MissingStderr,
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write subprocess stdin: {0}")]
    Write(std::io::Error),
    #[error("transport closed")]
    Closed,
    #[error("timeout waiting for response to {method}")]
    Timeout { method: String },
    #[error("json-rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Per-request deadline. `None` leaves the deadline to the caller.
    pub request_timeout: Option<Duration>,
    /// Number of stderr lines retained for diagnostics.
    pub log_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One line of the child's stderr.
    Log { line: String },
    /// A server-initiated notification.
    Notification { method: String, params: Value },
    /// The child exited; no further events follow.
    Closed { code: Option<i32>, success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// One child process speaking newline-delimited JSON-RPC 2.0 over stdio.
#[derive(Debug)]
pub struct StdioTransport {
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
    log: Arc<StdMutex<VecDeque<String>>>,
    kill: StdMutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<Option<ExitInfo>>,
    closed: Arc<AtomicBool>,
    options: TransportOptions,
    command: String,
    pid: Option<u32>,
    spawned_at: Instant,
}

impl StdioTransport {
    /// Spawns the process and starts the stdout, stderr and exit watchers.
    /// No protocol handshake happens here.
    pub async fn start(launch: &LaunchSpec, options: TransportOptions) -> Result<Self, TransportError> {
        let spawn_start = Instant::now();
        let command_for_display = launch.display_command();

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &launch.env {
            command.env(key, value);
        }

        tracing::info!(command = %command_for_display, "spawning tool server process");

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(command = %command_for_display, error = %err, "failed to spawn tool server process");
            TransportError::Spawn {
                command: command_for_display.clone(),
                error: err,
            }
        })?;

        let pid = child.id();
        tracing::debug!(
            pid = pid.unwrap_or(0),
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "tool server process spawned"
        );

        let stdin = child.stdin.take().ok_or(TransportError::MissingStdin)?;
        let stdout = child.stdout.take().ok_or(TransportError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(TransportError::MissingStderr)?;

        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let log_capacity = options.log_capacity.max(1);

        let transport = Self {
            stdin: Arc::new(Mutex::new(stdin)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            events,
            log: Arc::new(StdMutex::new(VecDeque::with_capacity(log_capacity))),
            kill: StdMutex::new(Some(kill_tx)),
            exited: exit_rx,
            closed: Arc::new(AtomicBool::new(false)),
            options,
            command: command_for_display,
            pid,
            spawned_at: spawn_start,
        };

        transport.spawn_stdout_loop(stdout);
        let stderr_task = transport.spawn_stderr_loop(stderr, log_capacity);
        transport.spawn_exit_watcher(child, kill_rx, exit_tx, stderr_task);

        Ok(transport)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribes to log, notification and close events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> impl Stream<Item = TransportEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move { item.ok() })
    }

    /// The retained stderr lines, oldest first.
    pub fn log_snapshot(&self) -> String {
        match self.log.lock() {
            Ok(guard) => guard.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(err) = self.send(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let started = Instant::now();
        let response = match self.options.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    tracing::warn!(
                        method = %method,
                        id = id,
                        timeout_ms = limit.as_millis() as u64,
                        "timed out waiting for tool server response"
                    );
                    return Err(TransportError::Timeout {
                        method: method.to_string(),
                    });
                }
            },
            None => rx.await,
        };

        let response = response.map_err(|_| TransportError::Closed)?;
        tracing::debug!(
            method = %method,
            id = id,
            response_ms = started.elapsed().as_millis() as u64,
            "tool server responded"
        );

        if let Some(error) = response.get("error") {
            return Err(TransportError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                data: error.get("data").cloned(),
            });
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.send(&payload).await
    }

    /// Kills the process (if still running) and waits for it to be reaped.
    pub async fn close(&self) {
        let kill = match self.kill.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(kill) = kill else {
            return;
        };

        tracing::info!(
            command = %self.command,
            age_ms = self.spawned_at.elapsed().as_millis() as u64,
            "closing tool server transport"
        );
        self.closed.store(true, Ordering::SeqCst);
        let _ = kill.send(());

        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|status| status.is_some()).await;
    }

    /// Resolves once the process has exited.
    pub async fn wait_closed(&self) -> Option<ExitInfo> {
        let mut exited = self.exited.clone();
        let result = exited.wait_for(|status| status.is_some()).await;
        result.ok().and_then(|status| *status)
    }

    async fn send(&self, payload: &Value) -> Result<(), TransportError> {
        write_line(&self.stdin, payload).await
    }

    fn spawn_stdout_loop(&self, stdout: tokio::process::ChildStdout) {
        let pending = self.pending.clone();
        let events = self.events.clone();
        let stdin = self.stdin.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let payload = match serde_json::from_str::<Value>(trimmed) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "tool server stdout: invalid JSON");
                        continue;
                    }
                };

                let method = payload.get("method").and_then(Value::as_str).map(str::to_string);
                let id = payload.get("id").cloned();

                match (method, id) {
                    (None, Some(id)) => {
                        let Some(key) = id.as_u64() else {
                            tracing::warn!(id = %id, "tool server stdout: response with foreign id");
                            continue;
                        };
                        if let Some(tx) = pending.lock().await.remove(&key) {
                            let _ = tx.send(payload);
                        } else {
                            tracing::warn!(id = key, "tool server stdout: orphan response");
                        }
                    }
                    (Some(method), Some(id)) => {
                        // Server-to-client request. Only ping is understood.
                        let reply = if method == "ping" {
                            json!({"jsonrpc": "2.0", "id": id, "result": {}})
                        } else {
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {
                                    "code": JSONRPC_METHOD_NOT_FOUND,
                                    "message": format!("method not supported: {method}"),
                                }
                            })
                        };
                        if let Err(err) = write_line(&stdin, &reply).await {
                            tracing::warn!(method = %method, error = %err, "failed to answer server request");
                        }
                    }
                    (Some(method), None) => {
                        let params = payload.get("params").cloned().unwrap_or(Value::Null);
                        let _ = events.send(TransportEvent::Notification { method, params });
                    }
                    (None, None) => {
                        tracing::warn!("tool server stdout: message without method or id");
                    }
                }
            }
            tracing::debug!("tool server stdout: stream ended");
        });
    }

    fn spawn_stderr_loop(
        &self,
        stderr: tokio::process::ChildStderr,
        capacity: usize,
    ) -> tokio::task::JoinHandle<()> {
        let log = self.log.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("tool server stderr: {}", line);
                if let Ok(mut guard) = log.lock() {
                    guard.push_back(line.clone());
                    while guard.len() > capacity {
                        guard.pop_front();
                    }
                }
                let _ = events.send(TransportEvent::Log { line });
            }
        })
    }

    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
        stderr_task: tokio::task::JoinHandle<()>,
    ) {
        let pending = self.pending.clone();
        let events = self.events.clone();
        let closed = self.closed.clone();
        let spawned_at = self.spawned_at;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };

            // Grandchildren may hold stderr open, so the drain is bounded.
            let _ = tokio::time::timeout(STDERR_DRAIN, stderr_task).await;

            closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every in-flight request with `Closed`.
            pending.lock().await.clear();

            let info = ExitInfo {
                code: status.and_then(|status| status.code()),
                success: status.map(|status| status.success()).unwrap_or(false),
            };
            tracing::info!(
                code = info.code,
                success = info.success,
                age_ms = spawned_at.elapsed().as_millis() as u64,
                "tool server process exited"
            );

            let _ = exit_tx.send(Some(info));
            let _ = events.send(TransportEvent::Closed {
                code: info.code,
                success: info.success,
            });
        });
    }
}

async fn write_line(stdin: &Mutex<ChildStdin>, payload: &Value) -> Result<(), TransportError> {
    let mut bytes = serde_json::to_vec(payload).map_err(TransportError::Serialize)?;
    bytes.push(b'\n');
    let mut stdin = stdin.lock().await;
    stdin.write_all(&bytes).await.map_err(TransportError::Write)?;
    stdin.flush().await.map_err(TransportError::Write)?;
    Ok(())
}
