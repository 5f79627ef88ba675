//! Tool server supervision, per-chat tool gating and sandboxed container runs.

pub mod app;
pub mod cli;
pub mod config;
pub mod connection;
pub mod db;
pub mod hub;
pub mod proxy;
pub mod sandbox;
pub mod store;
pub mod tools;

pub use app::AppState;
pub use config::{ConfigSource, FileConfigSource, ServersConfig, ToolhubConfig};
pub use connection::{Connection, ConnectionStatus};
pub use hub::{ConnectionHub, ServerSnapshot};
pub use tools::{ToolDescriptor, ToolGate, ToolResult};
