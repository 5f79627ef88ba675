//! Child-process transport for tool servers: one process per transport,
//! newline-delimited JSON-RPC 2.0 on stdin/stdout, stderr retained as a
//! rolling diagnostic log.

pub mod launch;
pub mod transport;

pub use launch::{format_command_for_display, shell_quote, LaunchSpec};
pub use transport::{ExitInfo, StdioTransport, TransportError, TransportEvent, TransportOptions};
