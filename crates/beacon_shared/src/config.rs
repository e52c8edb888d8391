//! Gemeinsame Konfigurationsstrukturen für Host, Client und Federation-Knoten.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::negotiation::EncryptionFailureAction;
use crate::protocol::{DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION};

/// Default period of inactivity before the client sends a keep-alive ping.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 4_000;
/// Default time a host waits for the next handshake step.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
/// Default time a client waits without receiving anything.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 45_000;

/// Verschlüsselungsrichtlinie eines Endpunkts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Without usable encryption data the handshake only continues if the
    /// failure hook answers `AllowConnection`.
    pub required: bool,
    /// Resolves `EncryptionFailureAction::Default`.
    pub default_failure_action: EncryptionFailureAction,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            required: false,
            default_failure_action: EncryptionFailureAction::RejectConnection,
        }
    }
}

/// Hostseitige Konfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub listen_addr: String,
    /// Upper bound of open, non-closing sessions across all beacon types.
    pub max_connections: Option<u32>,
    /// `None` disables the handshake timer.
    pub handshake_timeout_ms: Option<u64>,
    pub auth_required: bool,
    pub encryption: EncryptionConfig,
    pub max_frame_bytes: u32,
    pub protocol_version: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:15000".into(),
            max_connections: None,
            handshake_timeout_ms: Some(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            auth_required: false,
            encryption: EncryptionConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid {
                field: "listen_addr",
                reason: "must not be empty".into(),
            });
        }
        validate_frame_limit(self.max_frame_bytes)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

/// Clientseitige Konfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Idle timeout measured from the last received packet. `None` disables it.
    pub connection_timeout_ms: Option<u64>,
    pub keep_alive_interval_ms: Option<u64>,
    /// Bandwidth hint sent in `Netspeed`.
    pub net_speed: u32,
    pub login_options: String,
    pub auth_token: Option<String>,
    pub encryption: EncryptionConfig,
    pub max_frame_bytes: u32,
    pub protocol_version: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: Some(DEFAULT_CONNECTION_TIMEOUT_MS),
            keep_alive_interval_ms: Some(DEFAULT_KEEP_ALIVE_INTERVAL_MS),
            net_speed: 10_000,
            login_options: String::new(),
            auth_token: None,
            encryption: EncryptionConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_alive_interval_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "keep_alive_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        validate_frame_limit(self.max_frame_bytes)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_ms.map(Duration::from_millis)
    }
}

/// Konfiguration eines Federation-Knotens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Announced as player id on outbound links.
    pub node_name: String,
    pub listen_addr: String,
    pub peers: Vec<String>,
    pub beacon_type: String,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub host: HostConfig,
    pub client: ClientConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            node_name: "node".into(),
            listen_addr: "127.0.0.1:15100".into(),
            peers: Vec::new(),
            beacon_type: "federation".into(),
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            host: HostConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl FederationConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "node_name",
                reason: "must not be empty".into(),
            });
        }
        if self.beacon_type.is_empty() {
            return Err(ConfigError::Invalid {
                field: "beacon_type",
                reason: "must not be empty".into(),
            });
        }
        if self.retry_base_ms == 0 || self.retry_base_ms > self.retry_max_ms {
            return Err(ConfigError::Invalid {
                field: "retry_base_ms",
                reason: format!(
                    "must be in 1..={} (retry_max_ms)",
                    self.retry_max_ms
                ),
            });
        }
        self.host.validate()?;
        self.client.validate()
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

fn validate_frame_limit(max_frame_bytes: u32) -> Result<(), ConfigError> {
    if max_frame_bytes < 64 {
        return Err(ConfigError::Invalid {
            field: "max_frame_bytes",
            reason: format!("{max_frame_bytes} is below the 64 byte minimum"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_toml_yields_defaults() {
        assert_eq!(HostConfig::from_toml_str("").unwrap(), HostConfig::default());
        assert_eq!(ClientConfig::from_toml_str("").unwrap(), ClientConfig::default());
    }

    #[test]
    fn host_toml_overrides_fields() {
        let config = HostConfig::from_toml_str(
            r#"
            listen_addr = "lobby:7777"
            max_connections = 8
            auth_required = true

            [encryption]
            required = true
            default_failure_action = "allow_connection"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr, "lobby:7777");
        assert_eq!(config.max_connections, Some(8));
        assert!(config.auth_required);
        assert!(config.encryption.required);
        assert_eq!(
            config.encryption.default_failure_action,
            EncryptionFailureAction::AllowConnection
        );
        assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS)));
    }

    #[test]
    fn federation_rejects_inverted_retry_window() {
        let err = FederationConfig::from_toml_str(
            r#"
            node_name = "a"
            retry_base_ms = 5000
            retry_max_ms = 1000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry_base_ms", .. }));
    }

    #[test]
    fn federation_nested_tables() {
        let config = FederationConfig::from_toml_str(
            r#"
            node_name = "b"
            peers = ["mesh-a", "mesh-c"]

            [client]
            connection_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.peers, vec!["mesh-a".to_string(), "mesh-c".to_string()]);
        assert_eq!(config.client.connection_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.host, HostConfig::default());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            ClientConfig::from_toml_str("net_speed = \"fast\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
