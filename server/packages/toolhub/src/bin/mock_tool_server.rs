//! Minimal stdio tool server used by integration tests.
//!
//! Environment:
//! - `MOCK_TOOL_SERVER_SPAWN_LOG`: file that gets one line appended per start.
//! - `MOCK_TOOL_SERVER_TOOLS`: comma-separated tool names (default `echo`).
//! - `MOCK_TOOL_SERVER_FAIL`: print the value to stderr and exit before the handshake.
//!
//! Calling the `crash` tool makes the process exit without replying.

use std::io::Write as _;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const SPAWN_LOG_ENV: &str = "MOCK_TOOL_SERVER_SPAWN_LOG";
const TOOLS_ENV: &str = "MOCK_TOOL_SERVER_TOOLS";
const FAIL_ENV: &str = "MOCK_TOOL_SERVER_FAIL";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    record_spawn();

    if let Ok(message) = std::env::var(FAIL_ENV) {
        eprintln!("{message}");
        std::process::exit(2);
    }

    let tools: Vec<String> = std::env::var(TOOLS_ENV)
        .unwrap_or_else(|_| "echo".to_string())
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    let tag = std::env::args().nth(1).unwrap_or_default();

    eprintln!("mock tool server started tag={tag}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(payload) = serde_json::from_str::<Value>(&line) else {
            eprintln!("unparseable line: {line}");
            continue;
        };
        let Some(method) = payload.get("method").and_then(Value::as_str) else {
            continue;
        };
        let Some(id) = payload.get("id").cloned() else {
            eprintln!("notification {method}");
            continue;
        };
        let params = payload.get("params").cloned().unwrap_or(Value::Null);

        let response = match handle_request(method, &params, &tools, &tag) {
            Some(Ok(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Some(Err((code, message))) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            }),
            None => {
                eprintln!("crashing on request");
                std::process::exit(3);
            }
        };
        let mut bytes = response.to_string().into_bytes();
        bytes.push(b'\n');
        if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}

fn handle_request(
    method: &str,
    params: &Value,
    tools: &[String],
    tag: &str,
) -> Option<Result<Value, (i64, String)>> {
    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": params
                .get("protocolVersion")
                .cloned()
                .unwrap_or_else(|| Value::String("2024-11-05".to_string())),
            "capabilities": {"tools": {}, "resources": {}},
            "serverInfo": {"name": "mock-tool-server", "version": "0.1.0"}
        })),
        "tools/list" => Ok(json!({
            "tools": tools
                .iter()
                .map(|name| json!({
                    "name": name,
                    "description": format!("mock tool {name}"),
                    "inputSchema": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "additionalProperties": false
                    }
                }))
                .collect::<Vec<_>>()
        })),
        "resources/list" => Ok(json!({
            "resources": [{"uri": "mock://tag", "name": "tag", "mimeType": "text/plain"}]
        })),
        "resources/read" => Ok(json!({
            "contents": [{"uri": "mock://tag", "mimeType": "text/plain", "text": tag}]
        })),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            if name == "crash" {
                return None;
            }
            if !tools.iter().any(|tool| tool == name) {
                Err((-32602, format!("unknown tool {name}")))
            } else {
                let text = params
                    .pointer("/arguments/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!({
                    "content": [{"type": "text", "text": format!("{tag}{text}")}],
                    "isError": false
                }))
            }
        }
        other => Err((-32601, format!("method not found: {other}"))),
    };
    Some(result)
}

fn record_spawn() {
    let Ok(path) = std::env::var(SPAWN_LOG_ENV) else {
        return;
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path);
    if let Ok(mut file) = file {
        let _ = writeln!(file, "{}", std::process::id());
    }
}
