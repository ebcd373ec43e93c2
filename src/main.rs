use anyhow::Context;
use clap::Parser;
use mcp_relay::{BackendConfig, Endpoint, RelayConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Session-aware HTTP gateway for a stdio-hosted MCP tool backend.
///
/// Accepts MCP Streamable HTTP clients on one endpoint and forwards their
/// tool calls to a single shared backend subprocess.
#[derive(Parser, Debug)]
#[command(name = "mcp_relay")]
#[command(version, about)]
struct Args {
    /// Host to bind the HTTP listener.
    #[arg(long, default_value = Endpoint::DEFAULT_HOST)]
    host: String,

    /// Port to bind (1-65535). Validated before any socket is opened.
    #[arg(long, default_value = "3000")]
    port: String,

    /// Request path of the MCP endpoint.
    #[arg(long, default_value = Endpoint::DEFAULT_PATH)]
    path: String,

    /// Command that starts the tool backend subprocess.
    #[arg(long)]
    backend_command: String,

    /// Additional argument for the backend subprocess (repeatable).
    #[arg(long = "backend-arg")]
    backend_args: Vec<String>,

    /// Hand the effective endpoint to the host's config persistence layer.
    #[arg(long)]
    persist_endpoint: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // The port arrives as a raw string so range and integer errors surface
    // here, not at bind time.
    let endpoint = Endpoint::parse(&args.host, &args.port, &args.path)
        .context("invalid endpoint configuration")?;

    let config = RelayConfig {
        endpoint,
        backend: BackendConfig {
            command: args.backend_command,
            args: args.backend_args,
        },
        persist_endpoint: args.persist_endpoint,
    };

    tracing::info!(
        endpoint = %config.endpoint,
        backend = %config.backend.command,
        "starting mcp_relay"
    );

    mcp_relay::run_relay(config).await?;
    Ok(())
}
