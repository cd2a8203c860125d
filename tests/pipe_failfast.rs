//! Pipe client fail-fast: when the southbound stream closes while calls
//! are outstanding, every caller gets a transport-lost error in scheduler
//! time — never after the 30-second request timeout.
//!
//! Uses a small shell script as the tool server: it answers the handshake,
//! then exits on the first tools/call.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

use meshd::mcp::ToolArguments;
use meshd::transport::process::ProcessClient;
use meshd::transport::{AgentClient, ClientState, TransportError};
use tokio_util::sync::CancellationToken;

/// A fake MCP server: valid handshake replies (the client's outbound ids
/// are deterministic — initialize is 1, the first tools/list is 2), then
/// EOF on the next request.
const FAKE_SERVER: &str = r#"#!/bin/sh
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"1.0"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object"}}]}}'
read line
exit 0
"#;

fn write_fake_server(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("fake-server.sh");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(FAKE_SERVER.as_bytes()).unwrap();
    drop(f);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn outstanding_call_fails_fast_when_the_server_dies() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = write_fake_server(&dir);

    let client = ProcessClient::new(
        "fake",
        vec!["/bin/sh".into(), script],
        None,
        HashMap::new(),
    );
    let cancel = CancellationToken::new();

    client.initialize(&cancel).await.expect("handshake");
    assert_eq!(client.state().await, ClientState::Ready);
    let tools = client.tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    // The server exits on this request instead of answering it.
    let started = Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.call_tool(&cancel, "echo", ToolArguments::new()),
    )
    .await
    .expect("call did not fail fast — still waiting after 5s")
    .unwrap_err();

    assert!(
        matches!(err, TransportError::ConnectionLost),
        "expected connection lost, got {err}"
    );
    // Well under the configured request timeout.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.state().await, ClientState::Disconnected);

    client.close().await;
    assert_eq!(client.state().await, ClientState::Closed);
}

#[tokio::test]
async fn initialize_is_idempotent_once_ready() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = write_fake_server(&dir);

    let client = ProcessClient::new(
        "fake",
        vec!["/bin/sh".into(), script],
        None,
        HashMap::new(),
    );
    let cancel = CancellationToken::new();

    client.initialize(&cancel).await.expect("handshake");
    // A second initialize after ready is a no-op — the script would not
    // answer a second handshake.
    client.initialize(&cancel).await.expect("idempotent");
    assert_eq!(client.state().await, ClientState::Ready);
    client.close().await;
}

#[tokio::test]
async fn failed_initialize_retries_from_the_start() {
    // A server that speaks garbage: the first initialize fails, and a
    // retry must spawn a fresh process rather than reuse the dead one.
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("garbage-server.sh");
    std::fs::write(&path, "#!/bin/sh\nread line\necho not json\nexit 0\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let client = ProcessClient::new(
        "garbage",
        vec!["/bin/sh".into(), path.display().to_string()],
        None,
        HashMap::new(),
    );
    let cancel = CancellationToken::new();

    let err = tokio::time::timeout(Duration::from_secs(10), client.initialize(&cancel))
        .await
        .expect("initialize hung")
        .unwrap_err();
    assert!(
        matches!(err, TransportError::ConnectionLost),
        "got {err}"
    );
    assert_eq!(client.state().await, ClientState::Disconnected);

    // Second attempt starts over and fails the same way instead of
    // erroring out with a half-open state.
    let err = tokio::time::timeout(Duration::from_secs(10), client.initialize(&cancel))
        .await
        .expect("second initialize hung")
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionLost), "got {err}");
    client.close().await;
}
