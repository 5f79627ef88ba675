#![cfg(unix)]

use std::time::Duration;

use serde_json::{json, Value};
use toolhub_stdio_transport::{LaunchSpec, StdioTransport, TransportError, TransportEvent, TransportOptions};

fn shell(script: &str) -> LaunchSpec {
    LaunchSpec::new("sh").arg("-c").arg(script)
}

async fn start(script: &str) -> StdioTransport {
    StdioTransport::start(&shell(script), TransportOptions::default())
        .await
        .expect("start transport")
}

async fn wait_for_log(transport: &StdioTransport, needle: &str) -> String {
    for _ in 0..40 {
        let log = transport.log_snapshot();
        if log.contains(needle) {
            return log;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    transport.log_snapshot()
}

#[tokio::test]
async fn request_resolves_with_matching_response() {
    let transport = start(
        r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}\n'; sleep 5"#,
    )
    .await;

    let result = transport
        .request("initialize", json!({}))
        .await
        .expect("response");
    assert_eq!(result, json!({"ok": true}));

    transport.close().await;
    assert!(transport.is_closed());
}

#[tokio::test]
async fn rpc_error_is_surfaced_with_code() {
    let transport = start(
        r#"read line; printf '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}\n'; sleep 5"#,
    )
    .await;

    let err = transport
        .request("resources/list", json!({}))
        .await
        .expect_err("rpc error");
    match err {
        TransportError::Rpc { code, message, .. } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "nope");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    transport.close().await;
}

#[tokio::test]
async fn exit_before_response_fails_pending_request_and_keeps_stderr() {
    let transport = start(r#"echo "missing GITHUB_TOKEN" >&2; read line; exit 3"#).await;

    let err = transport
        .request("initialize", json!({}))
        .await
        .expect_err("closed");
    assert!(matches!(err, TransportError::Closed), "got {err:?}");

    let exit = transport.wait_closed().await.expect("exit info");
    assert_eq!(exit.code, Some(3));
    assert!(!exit.success);

    let log = wait_for_log(&transport, "missing GITHUB_TOKEN").await;
    assert!(log.contains("missing GITHUB_TOKEN"), "log was {log:?}");

    let err = transport.request("tools/list", json!({})).await.expect_err("closed");
    assert!(matches!(err, TransportError::Closed));
}

#[tokio::test]
async fn launch_applies_working_directory_and_environment() {
    let workdir = tempfile::tempdir().expect("tempdir");
    let expected = workdir.path().canonicalize().expect("canonical tempdir");
    let mut launch = shell(r#"echo "cwd=$(pwd -P) token=$API_TOKEN" >&2; sleep 5"#)
        .env("API_TOKEN", "t-123");
    launch.cwd = Some(workdir.path().to_path_buf());

    let transport = StdioTransport::start(&launch, TransportOptions::default())
        .await
        .expect("start transport");
    let log = wait_for_log(&transport, "token=").await;
    assert!(
        log.contains(&format!("cwd={} token=t-123", expected.display())),
        "log was {log:?}"
    );
    transport.close().await;
}

#[tokio::test]
async fn close_kills_process_and_emits_closed_event() {
    let transport = start("sleep 30").await;
    let mut events = transport.subscribe();

    tokio::time::timeout(Duration::from_secs(5), transport.close())
        .await
        .expect("close should not hang");

    let event = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(TransportEvent::Closed { success, .. })) => break success,
            Ok(Ok(_)) => continue,
            other => panic!("expected closed event, got {other:?}"),
        }
    };
    assert!(!event);
}

#[tokio::test]
async fn notifications_are_broadcast() {
    let transport = start(
        r#"read line; printf '{"jsonrpc":"2.0","method":"notifications/tools/list_changed","params":{}}\n'; sleep 5"#,
    )
    .await;
    let mut events = transport.subscribe();

    transport
        .notify("notifications/initialized", json!({}))
        .await
        .expect("notify");

    let received = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(TransportEvent::Notification { method, .. })) => break method,
            Ok(Ok(_)) => continue,
            other => panic!("expected notification, got {other:?}"),
        }
    };
    assert_eq!(received, "notifications/tools/list_changed");
    transport.close().await;
}

#[tokio::test]
async fn server_ping_is_answered() {
    let transport = start(
        r#"printf '{"jsonrpc":"2.0","id":"p1","method":"ping"}\n'; read reply; echo "$reply" >&2; sleep 5"#,
    )
    .await;

    let log = wait_for_log(&transport, "p1").await;
    let reply: Value = serde_json::from_str(log.lines().last().unwrap_or_default()).expect("json reply");
    assert_eq!(reply["id"], "p1");
    assert_eq!(reply["result"], json!({}));
    transport.close().await;
}

#[tokio::test]
async fn spawn_failure_names_the_command() {
    let err = StdioTransport::start(
        &LaunchSpec::new("/nonexistent/toolhub-test-binary"),
        TransportOptions::default(),
    )
    .await
    .expect_err("spawn should fail");
    assert!(err.to_string().contains("/nonexistent/toolhub-test-binary"));
}

#[tokio::test]
async fn request_timeout_is_enforced() {
    let transport = StdioTransport::start(
        &shell("sleep 30"),
        TransportOptions {
            request_timeout: Some(Duration::from_millis(200)),
            ..TransportOptions::default()
        },
    )
    .await
    .expect("start");

    let err = transport.request("tools/list", json!({})).await.expect_err("timeout");
    assert!(matches!(err, TransportError::Timeout { .. }));
    transport.close().await;
}
