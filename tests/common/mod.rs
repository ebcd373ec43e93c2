//! Shared fixtures: a mock stdio MCP backend and relay construction helpers.

#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode},
};
use mcp_relay::{
    AppState, BackendConfig, BackendConnector, SessionRegistry, build_router,
    request_handler::SESSION_ID_HEADER,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// Tools advertised by the mock backend. Tests compare HTTP round-trips
/// against this set via a direct backend call.
pub const MOCK_TOOL_NAMES: [&str; 2] = ["navigate", "screenshot"];

/// Write a stdio MCP backend that answers initialize, tools/list and
/// tools/call. The `explode` tool always fails with a backend error.
pub fn write_mock_backend_script(dir: &TempDir) -> PathBuf {
    write_script(dir, "mock_backend.py", false)
}

/// Variant that prints a non-JSON line before every tools/list response,
/// exercising the malformed-output event path without tearing the channel
/// down.
pub fn write_noisy_backend_script(dir: &TempDir) -> PathBuf {
    write_script(dir, "noisy_backend.py", true)
}

fn write_script(dir: &TempDir, name: &str, noisy: bool) -> PathBuf {
    let noise = if noisy {
        r###"        print("## stray diagnostic line, not json ##")
        sys.stdout.flush()
"###
    } else {
        ""
    };
    let script = format!(
        r#"import sys, json

TOOLS = [
    {{"name": "navigate", "description": "Open a URL", "inputSchema": {{"type": "object"}}}},
    {{"name": "screenshot", "description": "Capture the page", "inputSchema": {{"type": "object"}}}},
]

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    try:
        msg = json.loads(line)
    except Exception:
        continue
    if not isinstance(msg, dict) or "method" not in msg:
        continue
    method = msg.get("method")
    msg_id = msg.get("id")
    if method == "initialize":
        out = {{"jsonrpc": "2.0", "id": msg_id, "result": {{
            "protocolVersion": "2025-06-18",
            "capabilities": {{"tools": {{}}}},
            "serverInfo": {{"name": "mock-backend", "version": "1.0"}}}}}}
    elif method == "tools/list":
{noise}        out = {{"jsonrpc": "2.0", "id": msg_id, "result": {{"tools": TOOLS}}}}
    elif method == "tools/call":
        name = (msg.get("params") or {{}}).get("name")
        if name == "explode":
            out = {{"jsonrpc": "2.0", "id": msg_id,
                    "error": {{"code": -32001, "message": "tool exploded"}}}}
        else:
            out = {{"jsonrpc": "2.0", "id": msg_id, "result": {{
                "content": [{{"type": "text", "text": "ran " + str(name)}}]}}}}
    elif msg_id is not None:
        out = {{"jsonrpc": "2.0", "id": msg_id, "result": {{}}}}
    else:
        continue
    print(json.dumps(out))
    sys.stdout.flush()
"#
    );
    let path = dir.path().join(name);
    std::fs::write(&path, script).expect("failed to write mock backend script");
    path
}

pub async fn connect_backend(script: PathBuf) -> Arc<BackendConnector> {
    BackendConnector::connect(&BackendConfig {
        command: "python3".to_string(),
        args: vec![script.to_string_lossy().to_string()],
    })
    .await
    .expect("mock backend should connect")
}

/// Router plus its state, wired to the standard mock backend.
pub async fn test_app(dir: &TempDir) -> (Router, Arc<AppState>) {
    test_app_with_script(write_mock_backend_script(dir)).await
}

pub async fn test_app_with_script(script: PathBuf) -> (Router, Arc<AppState>) {
    let backend = connect_backend(script).await;
    let state = Arc::new(AppState {
        registry: Arc::new(SessionRegistry::new()),
        backend,
        endpoint_url: "http://127.0.0.1:3000/mcp".to_string(),
    });
    let bind: SocketAddr = "127.0.0.1:3000".parse().expect("valid addr");
    let app = build_router(Arc::clone(&state), "/mcp", bind);
    (app, state)
}

pub fn initialize_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.0.0"},
        },
    })
}

pub fn request_body(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Drive one POST through the router and return status, headers and the
/// parsed JSON body.
pub async fn post(
    app: &Router,
    path: &str,
    session: Option<&str>,
    body: &Value,
) -> (StatusCode, HeaderMap, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(session) = session {
        request = request.header(SESSION_ID_HEADER, session);
    }
    let request = request
        .body(Body::from(serde_json::to_vec(body).expect("serializable body")))
        .expect("valid request");
    send(app, request).await
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router never fails");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body is readable");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

/// Run initialize through the router and return the minted session id.
pub async fn open_session(app: &Router) -> String {
    let (status, headers, body) = post(app, "/mcp", None, &initialize_body(1)).await;
    assert_eq!(status, StatusCode::OK, "initialize failed: {body}");
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("initialize response carries a session id")
        .to_string()
}

/// Find a port that is currently free. The listener is dropped before the
/// relay binds, which is racy in principle but stable in practice for
/// loopback tests.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("read local addr")
        .port()
}
