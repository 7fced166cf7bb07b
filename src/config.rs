//! Session and gateway configuration.

use crate::error::Result;
use crate::message::DEFAULT_MAX_MESSAGE_SIZE;
use crate::url::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default address of the service directory.
pub const DEFAULT_SERVICE_DIRECTORY: &str = "tcp://127.0.0.1:5555";

/// Connection-plane settings shared by sessions and the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address of the service directory backend.
    pub service_directory: Url,
    /// Per-endpoint connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Maximum accepted frame size, header included.
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_directory: Url::parse(DEFAULT_SERVICE_DIRECTORY),
            connect_timeout_ms: 5_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration of a gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address clients connect to.
    pub listen: Url,
    pub session: SessionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: Url::parse("tcp://0.0.0.0:9559"),
            session: SessionConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from a YAML file; missing keys fall back to defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(
            config.session.service_directory,
            Url::parse("tcp://127.0.0.1:5555")
        );
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(5));
        assert!(config.listen.is_valid());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: GatewayConfig =
            serde_yaml::from_str("listen: tcp://127.0.0.1:12000\n").unwrap();
        assert_eq!(config.listen.port(), 12000);
        assert_eq!(
            config.session.service_directory,
            Url::parse(DEFAULT_SERVICE_DIRECTORY)
        );
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "listen: tcp://127.0.0.1:9000\nsession:\n  connect_timeout_ms: 750\n",
        )
        .unwrap();
        let config = GatewayConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.session.connect_timeout_ms, 750);
        assert_eq!(config.session.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = GatewayConfig::default();
        config.session.connect_timeout_ms = 250;
        let text = serde_yaml::to_string(&config).unwrap();
        let parsed: GatewayConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.session.connect_timeout_ms, 250);
        assert_eq!(parsed.listen, config.listen);
    }
}
