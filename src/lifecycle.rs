//! Lifecycle controller: startup, signal handling and graceful shutdown.
//!
//! Startup order is fixed: validate config, connect the backend (abort the
//! whole launch on failure), bind the listener, serve. Shutdown reverses it:
//! drain sessions, close the listener, then close the backend channel, so
//! cleanup traffic never lands on a dead subprocess.
//!
//! Signal subscriptions are scoped to [`RelayHandle::run_until_shutdown`]
//! rather than registered globally, so multiple relay instances can coexist
//! in one process (tests rely on this).

use crate::backend::BackendConnector;
use crate::bridge::{AppState, build_router};
use crate::config::{Endpoint, RelayConfig};
use crate::error::{RelayError, Result};
use crate::session::SessionRegistry;
use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Start the relay: connect the backend, bind the listener, begin serving.
///
/// Returns a handle owning every resource. Startup failures are fatal by
/// construction; a [`RelayError::BackendConnect`] carries the diagnostic
/// checklist for the operator.
pub async fn start_relay(config: RelayConfig) -> Result<RelayHandle> {
    let endpoint = config.endpoint.clone();

    // Backend first. If the subprocess cannot complete its handshake there
    // is nothing to serve, and no port should be claimed.
    let backend = BackendConnector::connect(&config.backend).await?;

    let listener = tokio::net::TcpListener::bind((endpoint.host().to_string(), endpoint.port()))
        .await
        .map_err(|e| {
            RelayError::HttpServer(format!(
                "failed to bind {}:{}: {e}",
                endpoint.host(),
                endpoint.port()
            ))
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| RelayError::HttpServer(format!("failed to read local addr: {e}")))?;

    if !local_addr.ip().is_loopback() {
        warn!(
            addr = %local_addr,
            "relay bound to a non-loopback address; it trusts all callers, restrict access externally"
        );
    }

    let registry = Arc::new(SessionRegistry::new());
    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        backend: Arc::clone(&backend),
        endpoint_url: endpoint.url(),
    });
    let app = build_router(state, endpoint.path(), local_addr);

    let cancel = CancellationToken::new();

    // Channel-level backend errors are observed here, decoupled from the
    // connector's internals. They are logged, never acted on.
    let mut events = backend.subscribe();
    let events_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => warn!(?event, "backend channel event"),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let serve_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await
    });

    info!(endpoint = %endpoint.url(), "relay listening");
    if config.persist_endpoint {
        // Writing the value to disk belongs to the host's config layer.
        info!(endpoint = %endpoint.url(), "endpoint ready for host config persistence");
    }

    Ok(RelayHandle {
        endpoint,
        local_addr,
        registry,
        backend,
        cancel,
        server: Mutex::new(Some(server)),
        stopped: AtomicBool::new(false),
    })
}

/// Start the relay and run until a termination signal arrives, then shut
/// down gracefully.
pub async fn run_relay(config: RelayConfig) -> Result<()> {
    let handle = start_relay(config).await?;
    handle.run_until_shutdown().await
}

/// Owns a running relay: listener task, session registry, backend channel.
#[derive(Debug)]
pub struct RelayHandle {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    backend: Arc<BackendConnector>,
    cancel: CancellationToken,
    server: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    stopped: AtomicBool,
}

impl RelayHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn endpoint_url(&self) -> String {
        self.endpoint.url()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently registered sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether graceful shutdown has completed.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) && self.backend.is_closed()
    }

    /// Graceful shutdown: drain sessions, close the listener, close the
    /// backend channel. Idempotent; shutdown-path failures are logged and
    /// swallowed so shutdown always completes.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("relay shutting down");

        let drained = self.registry.drain();
        info!(sessions = drained.len(), "drained active sessions");
        // Open event streams end when their session's sender drops; that
        // must happen before the listener is awaited, or graceful shutdown
        // would wait on them forever.
        drop(drained);

        self.cancel.cancel();
        if let Some(server) = self.server.lock().await.take() {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("HTTP listener closed with error: {e}"),
                Err(e) => warn!("HTTP server task failed: {e}"),
            }
        }

        self.backend.shutdown().await;
        info!("relay shutdown complete");
    }

    /// Block until SIGINT or SIGTERM, then run graceful shutdown.
    pub async fn run_until_shutdown(self) -> Result<()> {
        wait_for_termination_signal().await;
        self.stop().await;
        Ok(())
    }
}

async fn wait_for_termination_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = term.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received ctrl-c, initiating graceful shutdown");
    }
}
