//! Network configuration for a pairlink node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which discovered peers are surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleFilter {
    /// Only peers advertising the role complementary to ours.
    Opposite,
    /// Every peer, regardless of role.
    Any,
}

/// Configuration for the pairlink networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming link connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// UDP port used for LAN discovery announcements.
    pub discovery_port: u16,

    /// How often our presence is announced.
    #[serde(with = "duration_millis_serde")]
    pub announce_interval: Duration,

    /// A peer not heard from for this long is reported lost.
    #[serde(with = "duration_millis_serde")]
    pub peer_ttl: Duration,

    /// Timeout for an outgoing invitation to be answered.
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Discovery role policy.
    pub role_filter: RoleFilter,

    /// Where received resources are written.
    pub incoming_dir: PathBuf,

    /// Size of each resource chunk on the wire.
    pub chunk_size: usize,

    /// Automatic reconnection after a drop.
    pub reconnect: ReconnectPolicy,

    /// Batch transfer limits.
    pub transfer: TransferPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9480)),
            discovery_port: 9481,
            announce_interval: Duration::from_secs(1),
            peer_ttl: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            role_filter: RoleFilter::Opposite,
            incoming_dir: std::env::temp_dir().join("pairlink-incoming"),
            chunk_size: 64 * 1024,
            reconnect: ReconnectPolicy::default(),
            transfer: TransferPolicy::default(),
        }
    }
}

/// Bounds for the reconnect supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Whether drops are retried automatically.
    pub enabled: bool,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// How long to wait for `Connected` after issuing a connect.
    #[serde(with = "duration_millis_serde")]
    pub observation_window: Duration,
    /// Pause between attempts.
    #[serde(with = "duration_millis_serde")]
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            observation_window: Duration::from_secs(3),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Limits for batch transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    /// Hard wall-clock limit for a single item.
    #[serde(with = "duration_serde")]
    pub item_timeout: Duration,
    /// Delay before temporary sources are deleted.
    #[serde(with = "duration_serde")]
    pub cleanup_grace: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(60),
            cleanup_grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), 9480);
        assert_eq!(config.discovery_port, 9481);
        assert_eq!(config.role_filter, RoleFilter::Opposite);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.observation_window, Duration::from_secs(3));
        assert_eq!(config.transfer.item_timeout, Duration::from_secs(60));
        assert_eq!(config.transfer.cleanup_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = NetworkConfig::default();
        config.reconnect.retry_delay = Duration::from_millis(1500);
        config.role_filter = RoleFilter::Any;

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.listen_addr, config.listen_addr);
        assert_eq!(deserialized.role_filter, RoleFilter::Any);
        assert_eq!(deserialized.reconnect.retry_delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"discovery_port": 7000, "reconnect": {"max_attempts": 3}}"#;
        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.discovery_port, 7000);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert!(config.reconnect.enabled);
        assert_eq!(config.listen_addr.port(), 9480);
    }
}
