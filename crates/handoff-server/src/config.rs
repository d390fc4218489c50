//! Server configuration from environment variables and command-line flags.
//!
//! # Environment Variables
//!
//! - `HANDOFF_LISTEN_ADDR`: Address to bind in fresh mode. Default: `:9999`
//! - `HANDOFF_DRAIN_TIMEOUT_SECS`: Seconds to wait for in-flight connections
//!   on shutdown or restart. Default: `30`
//!
//! Flags passed on the command line override the environment.
//!
//! # Examples
//!
//! ```bash
//! HANDOFF_LISTEN_ADDR=127.0.0.1:8080 cargo run -p handoff-server
//! # restart without dropping connections:
//! kill -USR2 <pid>
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use handoff::AcquireMode;
use tracing::{info, warn};

/// Default listen address; a leading `:` means every IPv4 interface.
pub const DEFAULT_LISTEN_ADDR: &str = ":9999";

/// Default drain timeout in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Effective server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind when not inheriting a listener
    pub listen_addr: SocketAddr,
    /// How long shutdown waits for in-flight connections
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9999)),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("HANDOFF_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = parse_listen_addr(&listen_addr)?;

        let drain_timeout_secs = match lookup("HANDOFF_DRAIN_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(
                    value = %raw,
                    default = DEFAULT_DRAIN_TIMEOUT_SECS,
                    "Invalid HANDOFF_DRAIN_TIMEOUT_SECS, using default"
                );
                DEFAULT_DRAIN_TIMEOUT_SECS
            }),
            None => DEFAULT_DRAIN_TIMEOUT_SECS,
        };

        Ok(Self {
            listen_addr,
            drain_timeout: Duration::from_secs(drain_timeout_secs),
        })
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, addr: Option<&str>, drain_timeout_secs: Option<u64>) -> Result<Self> {
        if let Some(addr) = addr {
            self.listen_addr = parse_listen_addr(addr)?;
        }
        if let Some(secs) = drain_timeout_secs {
            self.drain_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }

    /// Log the effective configuration.
    pub fn log_config(&self, mode: AcquireMode) {
        match mode {
            AcquireMode::Fresh => info!("Listener: fresh bind on {}", self.listen_addr),
            AcquireMode::Inherited => info!(
                "Listener: inherited from parent process (configured address {})",
                self.listen_addr
            ),
        }
        info!("Drain timeout: {}s", self.drain_timeout.as_secs());
    }
}

/// Parse `host:port`, or `:port` for all IPv4 interfaces.
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    if let Some(port) = raw.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("Invalid port in listen address '{raw}'"))?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    raw.parse()
        .with_context(|| format!("Invalid listen address '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr.port(), 9999);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_values() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("HANDOFF_LISTEN_ADDR", "127.0.0.1:8080"),
            ("HANDOFF_DRAIN_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_drain_timeout_falls_back_to_default() {
        let config =
            ServerConfig::from_lookup(lookup_from(&[("HANDOFF_DRAIN_TIMEOUT_SECS", "soon")]))
                .unwrap();
        assert_eq!(config.drain_timeout, Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS));
    }

    #[test]
    fn test_invalid_listen_addr_is_an_error() {
        assert!(ServerConfig::from_lookup(lookup_from(&[("HANDOFF_LISTEN_ADDR", "nowhere")])).is_err());
    }

    #[test]
    fn test_overrides_win() {
        let config = ServerConfig::default()
            .with_overrides(Some("[::1]:7000"), Some(2))
            .unwrap();
        assert_eq!(config.listen_addr, "[::1]:7000".parse().unwrap());
        assert_eq!(config.drain_timeout, Duration::from_secs(2));

        let untouched = ServerConfig::default().with_overrides(None, None).unwrap();
        assert_eq!(untouched, ServerConfig::default());
    }

    #[test]
    fn test_parse_port_only_address() {
        assert_eq!(
            parse_listen_addr(":9999").unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 9999))
        );
        assert!(parse_listen_addr(":http").is_err());
        assert!(parse_listen_addr(":70000").is_err());
    }
}
