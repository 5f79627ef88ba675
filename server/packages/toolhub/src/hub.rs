use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use toolhub_error::HubError;
use toolhub_stdio_transport::TransportEvent;

use crate::config::{ConfigSource, HubSettings, ServerLaunchConfig, ServersConfig};
use crate::connection::{
    ConnectOptions, Connection, ConnectionStatus, McpResource, McpResourceTemplate, McpTool,
};

/// Operator-facing view of one server, live or failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub name: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub resource_templates: Vec<McpResourceTemplate>,
    pub log: String,
}

struct Entry {
    connection: Arc<Connection>,
    watcher: JoinHandle<()>,
}

struct HubInner {
    connections: StdMutex<HashMap<String, Entry>>,
    /// Serializes reconciliation passes and shutdown.
    reconcile: Mutex<()>,
    logs: StdMutex<HashMap<String, VecDeque<String>>>,
    errors: StdMutex<HashMap<String, String>>,
    spawns: AtomicU64,
    options: ConnectOptions,
}

/// Owns every live tool-server connection, keyed by connection name.
///
/// The map is only written under the reconcile lock or by a connection's own
/// close watcher, and an entry is always removed before its connection is torn
/// down, so a name is never observable while its process is being destroyed.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("connections", &self.connection_names())
            .finish()
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(ConnectOptions::default())
    }
}

impl ConnectionHub {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: StdMutex::new(HashMap::new()),
                reconcile: Mutex::new(()),
                logs: StdMutex::new(HashMap::new()),
                errors: StdMutex::new(HashMap::new()),
                spawns: AtomicU64::new(0),
                options,
            }),
        }
    }

    pub fn from_settings(settings: &HubSettings) -> Self {
        Self::new(ConnectOptions {
            request_timeout: settings.request_timeout_ms.map(Duration::from_millis),
            log_capacity: settings.log_lines.max(1),
        })
    }

    /// Converges live connections onto `desired`. Unchanged servers keep their
    /// process; removed ones are destroyed; changed ones are destroyed and then
    /// relaunched. A server that fails to connect is logged and left absent
    /// until the next pass.
    pub async fn set_server_connections(&self, desired: &ServersConfig) {
        let _guard = self.inner.reconcile.lock().await;

        let current = self.connection_names();
        for name in current.iter().filter(|name| !desired.contains_key(*name)) {
            tracing::info!(server = %name, "removing tool server");
            self.remove_and_destroy(name).await;
        }
        self.inner.forget_absent(desired);

        let mut to_connect = Vec::new();
        for (name, config) in desired {
            match self.get(name) {
                Some(existing) if existing.config() == config => continue,
                Some(_) => {
                    tracing::info!(server = %name, "tool server configuration changed; restarting");
                    self.remove_and_destroy(name).await;
                }
                None => {}
            }
            to_connect.push((name.clone(), config.clone()));
        }

        let attempts = to_connect
            .into_iter()
            .map(|(name, config)| async move {
                let result = self.connect_one(&name, &config).await;
                (name, result)
            });
        for (name, result) in join_all(attempts).await {
            match result {
                Ok(connection) => self.insert(name, connection),
                Err(err) => self.record_failure(&name, &err),
            }
        }
    }

    /// Re-reads the desired set from `source` and reconciles against it.
    pub async fn reload(&self, source: &dyn ConfigSource) -> Result<(), HubError> {
        let desired = source.servers_config().await?;
        self.set_server_connections(&desired).await;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .ok()
            .and_then(|map| map.get(name).map(|entry| entry.connection.clone()))
    }

    pub fn connection_names(&self) -> Vec<String> {
        let mut names = self
            .inner
            .connections
            .lock()
            .map(|map| map.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self
            .inner
            .connections
            .lock()
            .map(|map| {
                map.values()
                    .map(|entry| entry.connection.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        connections.sort_by(|a, b| a.name().cmp(b.name()));
        connections
    }

    /// Number of server processes started over the hub's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    pub fn tools_for(&self, server: &str) -> Result<Vec<McpTool>, HubError> {
        self.get(server)
            .map(|connection| connection.tools().to_vec())
            .ok_or_else(|| HubError::NotFound {
                name: server.to_string(),
            })
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, HubError> {
        let connection = self.usable(server)?;
        connection.call_tool(tool, arguments).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Value, HubError> {
        let connection = self.usable(server)?;
        connection.read_resource(uri).await
    }

    pub fn server_log(&self, server: &str) -> String {
        self.inner
            .logs
            .lock()
            .ok()
            .and_then(|logs| logs.get(server).map(|lines| lines.iter().cloned().collect::<Vec<_>>()))
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        let mut snapshots: Vec<ServerSnapshot> = self
            .connections()
            .into_iter()
            .map(|connection| ServerSnapshot {
                name: connection.name().to_string(),
                status: connection.status(),
                error: connection.last_error(),
                disabled: connection.is_disabled(),
                command: Some(connection.command().to_string()),
                tools: connection.tools().to_vec(),
                resources: connection.resources().to_vec(),
                resource_templates: connection.resource_templates().to_vec(),
                log: self.server_log(connection.name()),
            })
            .collect();

        let live: HashSet<String> = snapshots.iter().map(|s| s.name.clone()).collect();
        let failed = self
            .inner
            .errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default();
        for (name, error) in failed {
            if live.contains(&name) {
                continue;
            }
            snapshots.push(ServerSnapshot {
                log: self.server_log(&name),
                name,
                status: ConnectionStatus::Disconnected,
                error: Some(error),
                disabled: false,
                command: None,
                tools: Vec::new(),
                resources: Vec::new(),
                resource_templates: Vec::new(),
            });
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Tears down every connection. Used on shutdown.
    pub async fn destroy_all(&self) {
        let _guard = self.inner.reconcile.lock().await;
        let entries: Vec<Entry> = match self.inner.connections.lock() {
            Ok(mut map) => map.drain().map(|(_, entry)| entry).collect(),
            Err(_) => Vec::new(),
        };
        tracing::info!(count = entries.len(), "destroying all tool servers");
        join_all(entries.into_iter().map(|entry| async move {
            entry.watcher.abort();
            entry.connection.destroy().await;
        }))
        .await;
    }

    fn usable(&self, server: &str) -> Result<Arc<Connection>, HubError> {
        let connection = self.get(server).ok_or_else(|| HubError::NotFound {
            name: server.to_string(),
        })?;
        if connection.is_disabled() {
            return Err(HubError::ServerDisabled {
                server: server.to_string(),
            });
        }
        Ok(connection)
    }

    async fn connect_one(
        &self,
        name: &str,
        config: &ServerLaunchConfig,
    ) -> Result<Connection, HubError> {
        tracing::info!(server = %name, command = %config.launch.display_command(), "connecting tool server");
        let result = Connection::connect(name, config, &self.inner.options).await;
        let spawned = match &result {
            Ok(_) => true,
            Err(HubError::Connection { log, .. }) => log.is_some(),
            Err(_) => false,
        };
        if spawned {
            self.inner.spawns.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    fn insert(&self, name: String, connection: Connection) {
        let connection = Arc::new(connection);
        if let Ok(mut errors) = self.inner.errors.lock() {
            errors.remove(&name);
        }
        // The watcher is spawned under the map lock so a close it observes can
        // never precede the insert.
        if let Ok(mut map) = self.inner.connections.lock() {
            let watcher =
                spawn_close_watcher(Arc::downgrade(&self.inner), name.clone(), connection.clone());
            map.insert(name, Entry { connection, watcher });
        }
    }

    fn record_failure(&self, name: &str, err: &HubError) {
        tracing::error!(server = %name, error = %err, "failed to connect tool server");
        self.inner.push_log(name, err.to_string());
        if let HubError::Connection { log: Some(log), .. } = err {
            for line in log.lines() {
                self.inner.push_log(name, line.to_string());
            }
        }
        if let Ok(mut errors) = self.inner.errors.lock() {
            errors.insert(name.to_string(), err.to_string());
        }
    }

    async fn remove_and_destroy(&self, name: &str) {
        let entry = match self.inner.connections.lock() {
            Ok(mut map) => map.remove(name),
            Err(_) => None,
        };
        if let Some(entry) = entry {
            entry.watcher.abort();
            entry.connection.destroy().await;
        }
    }
}

impl HubInner {
    fn push_log(&self, server: &str, line: String) {
        let capacity = self.options.log_capacity.max(1);
        if let Ok(mut logs) = self.logs.lock() {
            let lines = logs.entry(server.to_string()).or_default();
            lines.push_back(line);
            while lines.len() > capacity {
                lines.pop_front();
            }
        }
    }

    fn forget_absent(&self, desired: &ServersConfig) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.retain(|name, _| desired.contains_key(name));
        }
        if let Ok(mut logs) = self.logs.lock() {
            logs.retain(|name, _| desired.contains_key(name));
        }
    }

    /// Deregisters a connection whose transport closed on its own. Only the
    /// exact connection instance is removed; a newer one under the same name
    /// is left alone.
    async fn handle_closed(&self, name: &str, connection: &Arc<Connection>, code: Option<i32>) {
        let removed = match self.connections.lock() {
            Ok(mut map) => match map.get(name) {
                Some(entry) if Arc::ptr_eq(&entry.connection, connection) => map.remove(name),
                _ => None,
            },
            Err(_) => None,
        };
        if removed.is_none() {
            return;
        }
        let message = match code {
            Some(code) => format!("transport closed (exit code {code})"),
            None => "transport closed".to_string(),
        };
        tracing::warn!(server = %name, code = code, "tool server exited unexpectedly");
        connection.mark_disconnected(Some(message.clone()));
        self.push_log(name, message.clone());
        if let Ok(mut errors) = self.errors.lock() {
            errors.insert(name.to_string(), message);
        }
        connection.destroy().await;
    }
}

fn spawn_close_watcher(
    inner: Weak<HubInner>,
    name: String,
    connection: Arc<Connection>,
) -> JoinHandle<()> {
    let events = connection.take_events();
    tokio::spawn(async move {
        let mut code = None;
        if let Some(mut events) = events {
            while let Some(event) = events.next().await {
                match event {
                    TransportEvent::Log { line } => {
                        if let Some(inner) = inner.upgrade() {
                            inner.push_log(&name, line);
                        }
                    }
                    TransportEvent::Notification { method, .. } => {
                        tracing::debug!(server = %name, method = %method, "tool server notification");
                    }
                    TransportEvent::Closed { code: exit_code, .. } => {
                        code = exit_code;
                        break;
                    }
                }
            }
        }
        if !connection.is_closed() {
            connection.destroy().await;
        }
        if let Some(inner) = inner.upgrade() {
            inner.handle_closed(&name, &connection, code).await;
        }
    })
}
