//! JSON-RPC envelope vocabulary shared by the HTTP front door and the
//! backend channel.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision the relay speaks when a client does not request one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Request arrived without a routable session.
pub const CODE_MISSING_SESSION: i64 = -32000;
/// Malformed request object.
pub const CODE_INVALID_REQUEST: i64 = -32600;
/// Unknown request method.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// Structurally invalid params.
pub const CODE_INVALID_PARAMS: i64 = -32602;
/// Internal failure while handling a request.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

/// Request/response correlation id. The wire allows numbers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl RpcId {
    /// Stable map key used for pending-request correlation.
    pub fn as_key(&self) -> String {
        match self {
            RpcId::Number(n) => n.to_string(),
            RpcId::String(s) => s.clone(),
        }
    }
}

/// Error member of a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Loosely-parsed incoming message. Requests, notifications and client
/// replies all share this shape, distinguished by which members are present.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RpcId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// Classification of an incoming envelope, driving the routing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Carries a method and an id; expects exactly one response.
    Request,
    /// Carries a method but no id; acknowledged, never answered.
    Notification,
    /// Carries an id plus result or error but no method: a client reply to a
    /// server-initiated request.
    ClientReply,
    /// Anything else.
    Malformed,
}

impl Envelope {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn kind(&self) -> EnvelopeKind {
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => EnvelopeKind::Request,
            (Some(_), None) => EnvelopeKind::Notification,
            (None, Some(_)) if self.result.is_some() || self.error.is_some() => {
                EnvelopeKind::ClientReply
            }
            _ => EnvelopeKind::Malformed,
        }
    }

    pub fn is_initialize(&self) -> bool {
        self.method.as_deref() == Some("initialize")
    }
}

/// Response envelope carrying a result, keyed to the caller's id.
pub fn result_response(id: &RpcId, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

/// Response envelope carrying an error, keyed to the caller's id.
pub fn error_response(id: &RpcId, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Protocol-level error envelope for failures with no routable request id.
pub fn error_envelope(code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "error": { "code": code, "message": message },
        "id": null
    })
}

/// A backend `tools/call` result.
///
/// The backend may answer with a structured payload (`structuredContent`), a
/// generic JSON content array (`content`), or an opaque raw value. Consumers
/// prefer them in that fixed order; exactly one view is used.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    raw: Value,
}

impl ToolCallResult {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// Preferred payload view, in the fixed structured > generic > raw order.
    pub fn payload(&self) -> &Value {
        if let Some(structured) = self.raw.get("structuredContent") {
            return structured;
        }
        if let Some(content) = self.raw.get("content") {
            return content;
        }
        &self.raw
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }
}
