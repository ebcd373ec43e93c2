//! Session registry and per-session protocol servers.
//!
//! A session is the isolated binding between one HTTP client and one
//! protocol-server instance, identified by a UUID minted at the
//! initialization handshake. The registry is the single owner of every live
//! session; `insert`, `lookup`, `remove` and `drain` are the only mutation
//! paths, which is what keeps the id-to-session invariant trivially true.

use crate::backend::BackendConnector;
use crate::proto::{self, RpcId};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Capacity of the per-session server-to-client stream channel.
const SESSION_STREAM_CAPACITY: usize = 100;

/// One protocol server per session. Answers `initialize` and `ping`
/// locally; forwards `tools/list` and `tools/call` to the shared backend
/// connector and returns backend results verbatim.
#[derive(Debug)]
pub struct ProtocolServer {
    session_id: String,
    backend: Arc<BackendConnector>,
    initialized: AtomicBool,
}

impl ProtocolServer {
    fn new(session_id: String, backend: Arc<BackendConnector>) -> Self {
        Self {
            session_id,
            backend,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Answer one request. Always produces a complete JSON-RPC response
    /// body; backend failures become error responses scoped to this session.
    pub async fn handle_request(
        &self,
        id: &RpcId,
        method: &str,
        params: Option<&Value>,
    ) -> Value {
        match method {
            "initialize" => self.handle_initialize(id, params),
            "ping" => proto::result_response(id, json!({})),
            "tools/list" => match self.backend.list_tools().await {
                Ok(result) => proto::result_response(id, result),
                Err(e) => self.backend_error_response(id, e),
            },
            "tools/call" => self.handle_tool_call(id, params).await,
            other => proto::error_response(
                id,
                proto::CODE_METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
            ),
        }
    }

    fn handle_initialize(&self, id: &RpcId, params: Option<&Value>) -> Value {
        let requested_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(proto::DEFAULT_PROTOCOL_VERSION);
        self.initialized.store(true, Ordering::SeqCst);
        debug!(session_id = %self.session_id, "session protocol server initialized");
        proto::result_response(
            id,
            json!({
                "protocolVersion": requested_version,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    async fn handle_tool_call(&self, id: &RpcId, params: Option<&Value>) -> Value {
        let Some(name) = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        else {
            return proto::error_response(
                id,
                proto::CODE_INVALID_PARAMS,
                "tools/call requires params.name",
            );
        };
        let args = params
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        match self.backend.call_tool(name, args).await {
            Ok(result) => proto::result_response(id, result),
            Err(e) => self.backend_error_response(id, e),
        }
    }

    fn backend_error_response(&self, id: &RpcId, err: crate::error::RelayError) -> Value {
        debug!(session_id = %self.session_id, "backend call failed: {err}");
        match err {
            crate::error::RelayError::BackendCall { code, message } => {
                proto::error_response(id, code, &message)
            }
            other => proto::error_response(id, proto::CODE_INTERNAL_ERROR, &other.to_string()),
        }
    }
}

/// An active client session: protocol server plus streamable transport.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    server: ProtocolServer,
    stream_tx: broadcast::Sender<String>,
    closed: AtomicBool,
}

impl Session {
    fn new(backend: Arc<BackendConnector>) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let (stream_tx, _) = broadcast::channel(SESSION_STREAM_CAPACITY);
        Arc::new(Self {
            server: ProtocolServer::new(id.clone(), backend),
            id,
            stream_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn server(&self) -> &ProtocolServer {
        &self.server
    }

    /// Subscribe to the session's server-to-client stream. The stream ends
    /// when the session is released.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.stream_tx.subscribe()
    }

    /// Push a server-initiated message onto the session's stream. Returns
    /// the number of connected receivers.
    pub fn broadcast(&self, message: String) -> usize {
        self.stream_tx.send(message).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the session closed. Idempotent; the registry removes the entry.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.id, "session closed");
        }
    }
}

/// Single owner of all live sessions, keyed by session id.
///
/// A session id, once issued, maps to exactly one live session until it is
/// closed; closed ids are never reused (ids are UUIDs and removal is final).
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a session bound to the shared backend and run its
    /// initialization handshake. The session is registered only after the
    /// protocol server produced a successful initialize response, so a
    /// half-initialized session is never routable.
    ///
    /// Returns the new session id (when registered) and the response body.
    pub async fn create_session(
        &self,
        backend: Arc<BackendConnector>,
        id: &RpcId,
        params: Option<&Value>,
    ) -> (Option<String>, Value) {
        let session = Session::new(backend);
        let response = session.server().handle_request(id, "initialize", params).await;
        if response.get("error").is_some() {
            debug!(session_id = %session.id, "initialization failed, session discarded");
            return (None, response);
        }

        info!(session_id = %session.id, "session initialized and registered");
        let session_id = session.id.clone();
        self.insert(session);
        (Some(session_id), response)
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Look up an active session. Closed sessions are never returned.
    pub fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry))
            .filter(|session| !session.is_closed())
    }

    /// Remove and close a session. Returns it for final inspection.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(session_id)?;
        session.close();
        Some(session)
    }

    /// Remove and close every session. Order-independent: sessions are
    /// mutually disjoint.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
