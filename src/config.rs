//! Endpoint and relay configuration.
//!
//! Validation happens once, at construction. An [`Endpoint`] cannot exist
//! with an out-of-range port or a malformed path, so the listener code never
//! re-checks it.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved for the unconditional health probe; the MCP endpoint may not
/// shadow it.
pub const HEALTH_PATH: &str = "/health";

/// Validated HTTP endpoint: host, port and request path.
///
/// Construct through [`Endpoint::new`] or [`Endpoint::parse`]; both reject
/// invalid values before any socket is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PATH: &'static str = "/mcp";

    /// Build an endpoint from an already-numeric port.
    ///
    /// Port 0 is rejected: the bridge advertises a stable, configured
    /// endpoint, not an OS-assigned one.
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Result<Self> {
        let host = host.into();
        let path = path.into();
        if port == 0 {
            return Err(RelayError::Config(
                "port must be in 1..=65535, got 0".to_string(),
            ));
        }
        if host.is_empty() {
            return Err(RelayError::Config("host must not be empty".to_string()));
        }
        if !path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "endpoint path must start with '/', got '{path}'"
            )));
        }
        if path == HEALTH_PATH {
            return Err(RelayError::Config(format!(
                "endpoint path may not shadow the reserved '{HEALTH_PATH}' route"
            )));
        }
        Ok(Self { host, port, path })
    }

    /// Build an endpoint from raw string inputs, e.g. CLI arguments.
    ///
    /// The port must parse as an integer in 1..=65535; `"0"`, `"-1"`,
    /// `"65536"` and non-integer strings all fail here, before bind.
    pub fn parse(host: &str, port: &str, path: &str) -> Result<Self> {
        let port = port
            .trim()
            .parse::<i64>()
            .map_err(|_| RelayError::Config(format!("port must be an integer, got '{port}'")))
            .and_then(|raw| {
                u16::try_from(raw)
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| {
                        RelayError::Config(format!("port must be in 1..=65535, got {raw}"))
                    })
            })?;
        Self::new(host, port, path)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full URL clients connect to.
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Launch description for the tool-provider subprocess.
///
/// The subprocess inherits the relay's full environment.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Executable that speaks MCP over stdio.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub endpoint: Endpoint,
    pub backend: BackendConfig,
    /// When set, the effective endpoint is handed to the host's config
    /// persistence layer after bind. Persistence itself lives outside the
    /// bridge.
    pub persist_endpoint: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_valid_endpoint() {
        let ep = Endpoint::parse("127.0.0.1", "3000", "/mcp").unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 3000);
        assert_eq!(ep.path(), "/mcp");
        assert_eq!(ep.url(), "http://127.0.0.1:3000/mcp");
    }

    #[test]
    fn parse_rejects_port_zero() {
        assert!(Endpoint::parse("127.0.0.1", "0", "/mcp").is_err());
        assert!(Endpoint::new("127.0.0.1", 0, "/mcp").is_err());
    }

    #[test]
    fn parse_rejects_negative_port() {
        assert!(Endpoint::parse("127.0.0.1", "-1", "/mcp").is_err());
    }

    #[test]
    fn parse_rejects_port_above_range() {
        assert!(Endpoint::parse("127.0.0.1", "65536", "/mcp").is_err());
    }

    #[test]
    fn parse_rejects_non_integer_port() {
        assert!(Endpoint::parse("127.0.0.1", "http", "/mcp").is_err());
        assert!(Endpoint::parse("127.0.0.1", "30a0", "/mcp").is_err());
        assert!(Endpoint::parse("127.0.0.1", "", "/mcp").is_err());
    }

    #[test]
    fn parse_accepts_port_bounds() {
        assert!(Endpoint::parse("127.0.0.1", "1", "/mcp").is_ok());
        assert!(Endpoint::parse("127.0.0.1", "65535", "/mcp").is_ok());
    }

    #[test]
    fn new_rejects_bad_path() {
        assert!(Endpoint::new("127.0.0.1", 3000, "mcp").is_err());
        assert!(Endpoint::new("127.0.0.1", 3000, "/health").is_err());
        assert!(Endpoint::new("127.0.0.1", 3000, "").is_err());
    }

    #[test]
    fn new_rejects_empty_host() {
        assert!(Endpoint::new("", 3000, "/mcp").is_err());
    }
}
