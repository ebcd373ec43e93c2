//! HTTP front door: router construction and the stream handlers.
//!
//! One axum router serves the fixed `/health` probe plus the configured MCP
//! endpoint path, which carries POST (requests), GET (the server-initiated
//! SSE stream) and DELETE (session termination). Anything else falls through
//! to axum's 404/405 handling.

use crate::backend::BackendConnector;
use crate::config;
use crate::request_handler::{
    self, missing_session_response, session_id_from_headers, with_session_header,
};
use crate::session::SessionRegistry;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::StreamExt;
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Shared router state.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub backend: Arc<BackendConnector>,
    /// Advertised endpoint URL, reported by the health probe.
    pub endpoint_url: String,
}

/// Build the front-door router for the given endpoint path.
///
/// The bind address decides the CORS posture: loopback binds only accept
/// browser origins from localhost, anything else allows all origins (the
/// caller logs the exposure warning).
pub fn build_router(state: Arc<AppState>, endpoint_path: &str, bind_addr: SocketAddr) -> Router {
    let cors = build_cors_layer(&bind_addr);
    Router::new()
        .route(config::HEALTH_PATH, get(health))
        .route(
            endpoint_path,
            post(post_endpoint)
                .get(sse_endpoint)
                .delete(delete_endpoint),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors_layer(bind_addr: &SocketAddr) -> CorsLayer {
    let methods = AllowMethods::list([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS]);
    let headers = AllowHeaders::list([
        HeaderName::from_static("content-type"),
        HeaderName::from_static(request_handler::SESSION_ID_HEADER),
        HeaderName::from_static("accept"),
        HeaderName::from_static("last-event-id"),
    ]);
    let expose = ExposeHeaders::list([HeaderName::from_static(request_handler::SESSION_ID_HEADER)]);

    let origin = if bind_addr.ip().is_loopback() {
        AllowOrigin::predicate(
            |origin: &axum::http::HeaderValue, _parts: &axum::http::request::Parts| {
                origin.to_str().is_ok_and(|origin| {
                    let lower = origin.to_ascii_lowercase();
                    lower.starts_with("http://127.0.0.1")
                        || lower.starts_with("http://localhost")
                        || lower.starts_with("http://[::1]")
                })
            },
        )
    } else {
        AllowOrigin::any()
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(expose)
}

/// Health never depends on backend or session state.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "ok": true, "endpoint": state.endpoint_url }))
}

async fn post_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    request_handler::handle_post(
        Arc::clone(&state.registry),
        Arc::clone(&state.backend),
        headers,
        &body,
    )
    .await
}

/// GET opens the session's server-initiated SSE stream.
///
/// The handler keeps only the broadcast receiver, so the stream terminates
/// once the session is removed from the registry and its sender drops.
async fn sse_endpoint(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_from_headers(&headers) else {
        return missing_session_response();
    };
    let Some(session) = state.registry.lookup(&session_id) else {
        return missing_session_response();
    };

    info!(session_id = %session_id, "server event stream opened");
    let rx = session.subscribe();
    drop(session);

    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        let session_id = session_id.clone();
        async move {
            match item {
                Ok(message) => Some(Ok::<_, Infallible>(Event::default().data(message))),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %session_id,
                        skipped,
                        "event stream receiver lagged, messages dropped"
                    );
                    // An SSE comment keeps the connection alive without
                    // injecting a fake protocol message.
                    Some(Ok(Event::default().comment(format!(
                        "lagged: {skipped} events dropped"
                    ))))
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// DELETE terminates the session named by the header.
async fn delete_endpoint(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_from_headers(&headers) else {
        return missing_session_response();
    };
    match state.registry.remove(&session_id) {
        Some(_) => {
            info!(session_id = %session_id, "session terminated by client");
            with_session_header(StatusCode::NO_CONTENT.into_response(), &session_id)
        }
        None => missing_session_response(),
    }
}
