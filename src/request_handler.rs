//! Request routing for the MCP endpoint.
//!
//! Implements the per-request routing rules: an initialization handshake
//! without a session header mints a new session; a header naming an active
//! session routes to its protocol server; everything else is rejected with
//! the fixed missing-session envelope. Uncaught failures surface as a 500
//! with the internal-error envelope, which is safe because routing never
//! starts writing a response before the outcome is known.

use crate::backend::BackendConnector;
use crate::error::{RelayError, Result};
use crate::proto::{self, Envelope, EnvelopeKind};
use crate::session::{Session, SessionRegistry};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Session-identifying header, required on requests and minted on the
/// initialization response.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

fn json_response_with_status(status: StatusCode, value: &Value) -> Result<Response> {
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(value)?))
        .unwrap_or_else(|_| (status, "failed to build response").into_response()))
}

fn json_response(value: &Value) -> Result<Response> {
    json_response_with_status(StatusCode::OK, value)
}

/// HTTP 400 with the fixed missing-session envelope.
pub(crate) fn missing_session_response() -> Response {
    static_envelope(
        StatusCode::BAD_REQUEST,
        proto::CODE_MISSING_SESSION,
        "missing valid session",
    )
}

/// HTTP 500 with an internal-error envelope. Only used before any response
/// bytes have been written.
pub(crate) fn internal_error_response(message: &str) -> Response {
    static_envelope(StatusCode::INTERNAL_SERVER_ERROR, proto::CODE_INTERNAL_ERROR, message)
}

/// Infallible envelope construction for the error paths themselves.
fn static_envelope(status: StatusCode, code: i64, message: &str) -> Response {
    let body = serde_json::to_vec(&proto::error_envelope(code, message)).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| status.into_response())
}

pub(crate) fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

pub(crate) fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

/// POST entry point. Any error escaping the routing itself becomes the
/// internal-error envelope.
pub async fn handle_post(
    registry: Arc<SessionRegistry>,
    backend: Arc<BackendConnector>,
    headers: HeaderMap,
    body: &[u8],
) -> Response {
    match route_post(registry, backend, headers, body).await {
        Ok(response) => response,
        Err(RelayError::Session(message)) => {
            warn!("{message}");
            missing_session_response()
        }
        Err(e) => {
            error!("request handling failed: {e}");
            internal_error_response(&e.to_string())
        }
    }
}

/// The routing rules proper. The body arrives raw so every rejection
/// carries the structured error envelope rather than a framework default.
async fn route_post(
    registry: Arc<SessionRegistry>,
    backend: Arc<BackendConnector>,
    headers: HeaderMap,
    body: &[u8],
) -> Result<Response> {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            debug!("rejecting unparseable request body: {e}");
            return Ok(missing_session_response());
        }
    };
    let Some(envelope) = Envelope::from_value(&payload) else {
        debug!("rejecting non-object request body");
        return Ok(missing_session_response());
    };

    debug!(
        method = ?envelope.method,
        has_id = envelope.id.is_some(),
        "incoming MCP request"
    );

    // An active session header takes precedence over everything else.
    if let Some(session_id) = session_id_from_headers(&headers) {
        let session = registry.lookup(&session_id).ok_or_else(|| {
            RelayError::Session(format!("unknown or closed session: {session_id}"))
        })?;
        let response = dispatch_to_session(&session, &envelope).await?;
        return Ok(with_session_header(response, &session_id));
    }

    // Without a header, only the initialization handshake may proceed.
    if envelope.is_initialize()
        && let Some(id) = envelope.id.clone()
    {
        let (created, response) = registry
            .create_session(backend, &id, envelope.params.as_ref())
            .await;
        let http = json_response(&response)?;
        return Ok(match created {
            Some(session_id) => with_session_header(http, &session_id),
            None => http,
        });
    }

    debug!(method = ?envelope.method, "POST without a routable session");
    Ok(missing_session_response())
}

/// Forward an envelope to a bound session's protocol server.
async fn dispatch_to_session(session: &Session, envelope: &Envelope) -> Result<Response> {
    match envelope.kind() {
        EnvelopeKind::Request => {
            let (Some(id), Some(method)) = (&envelope.id, envelope.method.as_deref()) else {
                return json_response_with_status(
                    StatusCode::BAD_REQUEST,
                    &proto::error_envelope(proto::CODE_INVALID_REQUEST, "invalid request envelope"),
                );
            };
            let body = session
                .server()
                .handle_request(id, method, envelope.params.as_ref())
                .await;
            json_response(&body)
        }
        // Notifications and client replies are acknowledged, never answered.
        EnvelopeKind::Notification | EnvelopeKind::ClientReply => {
            debug!(session_id = %session.id, method = ?envelope.method, "accepted without response");
            json_response_with_status(StatusCode::ACCEPTED, &json!({}))
        }
        EnvelopeKind::Malformed => json_response_with_status(
            StatusCode::BAD_REQUEST,
            &proto::error_envelope(proto::CODE_INVALID_REQUEST, "invalid request envelope"),
        ),
    }
}
