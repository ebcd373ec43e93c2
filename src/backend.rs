//! Backend connector: the single shared stdio channel to the tool provider.
//!
//! One subprocess is launched at startup and serves every session for the
//! lifetime of the process. Calls from concurrent sessions are multiplexed
//! over the channel with connector-assigned wire ids, so caller-supplied ids
//! never collide; responses are matched back through a pending-request map.
//!
//! Channel-level errors (malformed output, broken pipe, unexpected EOF) are
//! published on a typed event channel and logged by the subscriber. They do
//! not tear the connection down, and the connector never reconnects; whether
//! a dead channel should self-repair is a product decision that the bridge
//! deliberately does not make.

use crate::config::BackendConfig;
use crate::error::{RelayError, Result};
use crate::proto::{self, RpcError, RpcId};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{Mutex, broadcast, mpsc, oneshot},
};
use tracing::{debug, error, info, warn};

/// Seconds the startup handshake may take before the launch is failed.
const CONNECT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Buffered messages on the writer channel and the event channel.
const CHANNEL_CAPACITY: usize = 100;

/// Asynchronous channel-level events observed on the shared backend channel.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// The subprocess emitted bytes that do not parse as a JSON-RPC message.
    MalformedOutput(String),
    /// The channel failed at the transport level (write error, read error).
    ChannelError(String),
    /// The subprocess closed its stdout; the channel is permanently dead.
    ChannelClosed,
}

/// The single persistent connection to the tool-provider subprocess.
///
/// Created once via [`BackendConnector::connect`]; shared by every session.
#[derive(Debug)]
pub struct BackendConnector {
    writer_tx: mpsc::Sender<String>,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    events_tx: broadcast::Sender<BackendEvent>,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
    initialize_result: Value,
}

impl BackendConnector {
    /// Launch the subprocess and perform the MCP initialize handshake.
    ///
    /// The subprocess inherits the relay's full environment and communicates
    /// over newline-delimited JSON on stdin/stdout. Any failure here is fatal
    /// to startup and is reported with a diagnostic enumerating the likely
    /// causes; it is never retried.
    pub async fn connect(config: &BackendConfig) -> Result<Arc<Self>> {
        info!(command = %config.command, "launching tool backend");

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::BackendConnect(connect_diagnostic(config, &format!("spawn failed: {e}")))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::BackendConnect("subprocess stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::BackendConnect("subprocess stdout unavailable".into()))?;

        let (writer_tx, writer_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel::<BackendEvent>(CHANNEL_CAPACITY);
        let pending: Arc<DashMap<String, oneshot::Sender<Value>>> = Arc::new(DashMap::new());

        tokio::spawn(run_channel(
            Arc::clone(&pending),
            events_tx.clone(),
            writer_rx,
            stdin,
            stdout,
        ));

        let mut connector = Self {
            writer_tx,
            pending,
            events_tx,
            next_id: AtomicU64::new(1),
            child: Mutex::new(Some(child)),
            closed: AtomicBool::new(false),
            initialize_result: Value::Null,
        };

        let init_params = json!({
            "protocolVersion": proto::DEFAULT_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let handshake = tokio::time::timeout(
            Duration::from_secs(CONNECT_HANDSHAKE_TIMEOUT_SECS),
            connector.request("initialize", init_params),
        );
        let init_result = match handshake.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let _ = connector.kill_child().await;
                return Err(RelayError::BackendConnect(connect_diagnostic(
                    config,
                    &format!("initialize handshake failed: {e}"),
                )));
            }
            Err(_) => {
                let _ = connector.kill_child().await;
                return Err(RelayError::BackendConnect(connect_diagnostic(
                    config,
                    &format!("initialize handshake timed out after {CONNECT_HANDSHAKE_TIMEOUT_SECS}s"),
                )));
            }
        };
        connector.initialize_result = init_result;
        connector.notify("notifications/initialized").await.map_err(|e| {
            RelayError::BackendConnect(connect_diagnostic(
                config,
                &format!("could not confirm initialization: {e}"),
            ))
        })?;

        info!(command = %config.command, "backend channel established");
        Ok(Arc::new(connector))
    }

    /// The backend's `initialize` result, captured at connect time.
    pub fn initialize_result(&self) -> &Value {
        &self.initialize_result
    }

    /// Subscribe to channel-level events. Observation is decoupled from the
    /// connector's internals; subscribers only log.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events_tx.subscribe()
    }

    /// Forward `tools/list` over the channel and return the result verbatim.
    pub async fn list_tools(&self) -> Result<Value> {
        self.request("tools/list", json!({})).await
    }

    /// Forward `tools/call` over the channel and return the result verbatim.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        self.request("tools/call", json!({ "name": name, "arguments": args }))
            .await
    }

    /// Send a request with a connector-assigned wire id and await its
    /// response. No retry, no backoff, and no call-level timeout: a stuck
    /// call is the calling client's to abandon.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::BackendCall {
                code: proto::CODE_INTERNAL_ERROR,
                message: "backend channel is shut down".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let message = json!({
            "jsonrpc": proto::JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });
        let line = serde_json::to_string(&message)?;
        debug!(method, wire_id = id, "forwarding request to backend");

        if let Err(e) = self.writer_tx.send(line).await {
            self.pending.remove(&key);
            return Err(RelayError::BackendCall {
                code: proto::CODE_INTERNAL_ERROR,
                message: format!("backend channel unavailable: {e}"),
            });
        }

        let response = rx.await.map_err(|_| RelayError::BackendCall {
            code: proto::CODE_INTERNAL_ERROR,
            message: "backend channel closed before a response arrived".to_string(),
        })?;

        if let Some(err) = response.get("error") {
            let parsed: RpcError =
                serde_json::from_value(err.clone()).unwrap_or_else(|_| RpcError {
                    code: proto::CODE_INTERNAL_ERROR,
                    message: err.to_string(),
                    data: None,
                });
            return Err(RelayError::BackendCall {
                code: parsed.code,
                message: parsed.message,
            });
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send a notification (no id, no response).
    async fn notify(&self, method: &str) -> Result<()> {
        let message = json!({ "jsonrpc": proto::JSONRPC_VERSION, "method": method });
        self.writer_tx
            .send(serde_json::to_string(&message)?)
            .await
            .map_err(|e| RelayError::BackendCall {
                code: proto::CODE_INTERNAL_ERROR,
                message: format!("backend channel unavailable: {e}"),
            })?;
        Ok(())
    }

    /// Close the channel: fail every pending request, then kill the
    /// subprocess. Idempotent; failures are logged and swallowed.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing backend channel");
        fail_pending(&self.pending);
        if let Err(e) = self.kill_child().await {
            warn!("failed to kill backend subprocess: {e}");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn kill_child(&self) -> std::io::Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            child.kill().await?;
        }
        Ok(())
    }
}

/// Startup diagnostic enumerating the likely causes of a connect failure.
fn connect_diagnostic(config: &BackendConfig, cause: &str) -> String {
    format!(
        "could not establish the backend channel via '{}': {}. Likely causes: \
         (1) the backend executable is not installed or not on PATH; \
         (2) the backend fails at launch; run '{} {}' by hand and check its stderr; \
         (3) the inherited environment is missing variables the backend requires",
        config.command,
        cause,
        config.command,
        config.args.join(" "),
    )
}

/// Owns the subprocess pipes: writes queued outgoing lines to stdin and
/// dispatches stdout lines to pending requests. Runs until the writer handle
/// drops or the channel dies, then fails whatever is still pending.
async fn run_channel(
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    events_tx: broadcast::Sender<BackendEvent>,
    mut writer_rx: mpsc::Receiver<String>,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            outgoing = writer_rx.recv() => {
                let Some(message) = outgoing else {
                    debug!("backend writer handle dropped, stopping channel task");
                    break;
                };
                if let Err(e) = write_line(&mut stdin, &message).await {
                    error!("failed to write to backend stdin: {e}");
                    let _ = events_tx.send(BackendEvent::ChannelError(e.to_string()));
                    break;
                }
            }
            incoming = lines.next_line() => {
                match incoming {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        dispatch_line(&pending, &events_tx, &line);
                    }
                    Ok(None) => {
                        warn!("backend stdout closed");
                        let _ = events_tx.send(BackendEvent::ChannelClosed);
                        break;
                    }
                    Err(e) => {
                        error!("failed to read backend stdout: {e}");
                        let _ = events_tx.send(BackendEvent::ChannelError(e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    fail_pending(&pending);
}

async fn write_line(stdin: &mut ChildStdin, message: &str) -> std::io::Result<()> {
    stdin.write_all(message.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Route one stdout line. Malformed output is reported as an event and
/// dropped without tearing the channel down.
fn dispatch_line(
    pending: &DashMap<String, oneshot::Sender<Value>>,
    events_tx: &broadcast::Sender<BackendEvent>,
    line: &str,
) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!("backend emitted unparseable output: {e}");
            let _ = events_tx.send(BackendEvent::MalformedOutput(line.to_string()));
            return;
        }
    };

    if let Some(id) = value.get("id").filter(|id| !id.is_null())
        && let Ok(id) = serde_json::from_value::<RpcId>(id.clone())
        && let Some((_, sender)) = pending.remove(&id.as_key())
    {
        let _ = sender.send(value);
        return;
    }

    // The shared channel carries no session addressing, so server-initiated
    // traffic cannot be attributed to a client.
    debug!("dropping unaddressed backend message: {line}");
}

/// Answer every pending request with an error so callers see a protocol
/// failure instead of a dropped oneshot.
fn fail_pending(pending: &DashMap<String, oneshot::Sender<Value>>) {
    let keys: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    if keys.is_empty() {
        return;
    }
    warn!(count = keys.len(), "failing requests pending on the backend channel");
    for key in keys {
        if let Some((id, sender)) = pending.remove(&key) {
            let _ = sender.send(json!({
                "jsonrpc": proto::JSONRPC_VERSION,
                "id": id,
                "error": {
                    "code": proto::CODE_INTERNAL_ERROR,
                    "message": "backend channel closed before a response arrived",
                },
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_failure_reports_diagnostic_checklist() {
        let config = BackendConfig {
            command: "/nonexistent/tool-backend".to_string(),
            args: vec!["--stdio".to_string()],
        };
        let err = BackendConnector::connect(&config)
            .await
            .expect_err("spawn of a missing executable must fail");

        let message = err.to_string();
        assert!(message.contains("backend connect error"));
        assert!(message.contains("Likely causes"));
        assert!(message.contains("/nonexistent/tool-backend"));
    }

    #[test]
    fn dispatch_matches_pending_by_numeric_and_string_id() {
        let pending: DashMap<String, oneshot::Sender<Value>> = DashMap::new();
        let (events_tx, _) = broadcast::channel(8);

        let (tx_num, mut rx_num) = oneshot::channel();
        pending.insert("7".to_string(), tx_num);
        dispatch_line(&pending, &events_tx, r#"{"jsonrpc":"2.0","id":7,"result":{}}"#);
        assert!(rx_num.try_recv().is_ok());

        let (tx_str, mut rx_str) = oneshot::channel();
        pending.insert("abc".to_string(), tx_str);
        dispatch_line(
            &pending,
            &events_tx,
            r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#,
        );
        assert!(rx_str.try_recv().is_ok());
        assert!(pending.is_empty());
    }

    #[test]
    fn dispatch_reports_malformed_output_without_teardown() {
        let pending: DashMap<String, oneshot::Sender<Value>> = DashMap::new();
        let (events_tx, mut events_rx) = broadcast::channel(8);

        dispatch_line(&pending, &events_tx, "definitely not json");

        match events_rx.try_recv() {
            Ok(BackendEvent::MalformedOutput(line)) => {
                assert_eq!(line, "definitely not json");
            }
            other => panic!("expected MalformedOutput event, got {other:?}"),
        }
    }

    #[test]
    fn fail_pending_answers_with_internal_error() {
        let pending: DashMap<String, oneshot::Sender<Value>> = DashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert("1".to_string(), tx);

        fail_pending(&pending);

        let response = rx.try_recv().expect("pending request must be answered");
        assert_eq!(response["error"]["code"], proto::CODE_INTERNAL_ERROR);
        assert!(pending.is_empty());
    }
}
