//! Runtime configuration
//!
//! Defaults, then an optional TOML file, then environment variables. The
//! binary applies its command-line flags last.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the BACnet client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacnetConfig {
    /// Interface to bind to (e.g., "0.0.0.0" for all interfaces)
    pub interface: String,
    /// UDP port (default: 47808 / 0xBAC0)
    pub port: u16,
    /// Broadcast address (e.g., "10.0.1.255" for subnet broadcast)
    pub broadcast: Option<String>,
    /// Longest single blocking receive in the protocol loop
    pub poll_interval_ms: u64,
    /// Deadline used when a caller does not pick one
    pub default_timeout_ms: u64,
    /// Who-Is window at startup
    pub discovery_window_ms: u64,
    /// Seconds between auto-discovery broadcasts (0 = disabled)
    pub discovery_interval: u64,
    pub feed: FeedConfig,
}

/// Where the trend feed is served
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for BacnetConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 47808,
            broadcast: None,
            poll_interval_ms: 20,
            default_timeout_ms: 3000,
            discovery_window_ms: 2000,
            discovery_interval: 60,
            feed: FeedConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9600,
        }
    }
}

impl BacnetConfig {
    /// Load a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        toml::from_str(&text).map_err(|e| {
            Error::InvalidArgument(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay environment values
    ///
    /// Reads:
    /// - `BACNET_IP` or `BACBRIDGE_BACNET_IP`: Bind address
    /// - `BACNET_PORT`: UDP port
    /// - `BACNET_BROADCAST`: Broadcast address
    /// - `BACNET_TIMEOUT_MS`: Default request timeout
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(interface) = var("BACNET_IP").or_else(|| var("BACBRIDGE_BACNET_IP")) {
            self.interface = interface;
        }
        if let Some(port) = var("BACNET_PORT").and_then(|s| s.parse().ok()) {
            self.port = port;
        }
        if let Some(broadcast) = var("BACNET_BROADCAST") {
            self.broadcast = Some(broadcast);
        }
        if let Some(timeout) = var("BACNET_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.default_timeout_ms = timeout;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BacnetConfig::default();
        assert_eq!(config.port, 47808);
        assert_eq!(config.interface, "0.0.0.0");
        assert!(config.broadcast.is_none());
        assert!(config.feed.enabled);
        assert_eq!(config.default_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
interface = "192.168.1.10"
broadcast = "192.168.1.255"

[feed]
port = 9700
"#
        )
        .unwrap();

        let config = BacnetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.interface, "192.168.1.10");
        assert_eq!(config.broadcast.as_deref(), Some("192.168.1.255"));
        assert_eq!(config.port, 47808);
        assert_eq!(config.feed.port, 9700);
        assert!(config.feed.enabled);
    }

    #[test]
    fn test_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        assert!(matches!(
            BacnetConfig::from_file(file.path()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(BacnetConfig::from_file(Path::new("/nonexistent/bacbridge.toml")).is_err());
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BACBRIDGE_BACNET_IP", "10.1.1.5"),
            ("BACNET_PORT", "47809"),
            ("BACNET_TIMEOUT_MS", "bogus"),
        ]);
        let mut config = BacnetConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.interface, "10.1.1.5");
        assert_eq!(config.port, 47809);
        assert_eq!(config.default_timeout_ms, 3000);
    }
}
