//! # mcp_relay
//!
//! A session-aware HTTP gateway that shares one stdio-hosted MCP tool
//! backend across many concurrent HTTP clients.
//!
//! The backend is a subprocess speaking JSON-RPC over stdin/stdout. It is
//! launched once, at startup, and the relay multiplexes every client's
//! `tools/list` and `tools/call` traffic onto that single channel while
//! keeping each client's session state isolated.
//!
//! ## Architecture
//!
//! *   **Backend Connector** ([`backend`]): the one persistent subprocess
//!     channel; correlates concurrent requests by wire id.
//! *   **Session Registry** ([`session`]): session id to protocol-server
//!     binding; created on the initialization handshake, removed on close.
//! *   **HTTP Front Door** ([`bridge`], [`request_handler`]): axum router
//!     implementing the MCP Streamable HTTP surface (POST requests, GET for
//!     SSE, DELETE to terminate) plus an unconditional `/health` probe.
//! *   **Lifecycle Controller** ([`lifecycle`]): connect-or-abort startup
//!     and drain-then-close graceful shutdown on termination signals.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_relay::{BackendConfig, Endpoint, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig {
//!         endpoint: Endpoint::new("127.0.0.1", 3000, "/mcp")?,
//!         backend: BackendConfig {
//!             command: "my-tool-backend".to_string(),
//!             args: vec![],
//!         },
//!         persist_endpoint: false,
//!     };
//!     mcp_relay::run_relay(config).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod proto;
pub mod request_handler;
pub mod session;

pub use backend::{BackendConnector, BackendEvent};
pub use bridge::{AppState, build_router};
pub use config::{BackendConfig, Endpoint, RelayConfig};
pub use error::{RelayError, Result};
pub use lifecycle::{RelayHandle, run_relay, start_relay};
pub use session::{Session, SessionRegistry};
