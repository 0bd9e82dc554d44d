use anyhow::{Context, Result};
use pairlink_network::{NetworkConfig, Role};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable that relocates the data directory.
pub const HOME_ENV: &str = "PAIRLINK_HOME";

/// Application configuration, stored at `~/.pairlink/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairlinkConfig {
    /// Name shown to the other device.
    pub device_name: String,
    pub role: Role,
    pub network: NetworkConfig,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for PairlinkConfig {
    fn default() -> Self {
        Self {
            device_name: whoami::devicename(),
            role: Role::Responder,
            network: NetworkConfig::default(),
            log_level: "info".into(),
        }
    }
}

fn resolve_base_dir(override_dir: Option<OsString>) -> Result<PathBuf> {
    match override_dir.filter(|dir| !dir.is_empty()) {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(".pairlink"))
        }
    }
}

impl PairlinkConfig {
    /// Returns the base data directory: `$PAIRLINK_HOME` or `~/.pairlink/`
    pub fn base_dir() -> Result<PathBuf> {
        resolve_base_dir(std::env::var_os(HOME_ENV))
    }

    /// Returns the config file path: `~/.pairlink/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.pairlink/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the identity file path: `~/.pairlink/identity.json`
    pub fn identity_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("identity.json"))
    }

    /// Returns the session file path: `~/.pairlink/session.json`
    pub fn session_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("session.json"))
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from disk, or creates the default file if missing.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Load config from a specific file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to_path(&path)
    }

    /// Save config to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_base_dir_override() {
        let dir = resolve_base_dir(Some(OsString::from("/tmp/pairlink-b"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/pairlink-b"));
    }

    #[test]
    fn test_base_dir_empty_override_falls_back_to_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let dir = resolve_base_dir(Some(OsString::new())).unwrap();
        assert_eq!(dir, home.join(".pairlink"));
    }

    #[test]
    fn test_missing_file_creates_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let config = PairlinkConfig::load_from_path(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.role, Role::Responder);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = PairlinkConfig {
            device_name: "Kitchen iPad".into(),
            role: Role::Initiator,
            ..PairlinkConfig::default()
        };
        config.network.reconnect.max_attempts = 4;
        config.network.transfer.item_timeout = Duration::from_secs(90);
        config.save_to_path(&path).unwrap();

        let loaded = PairlinkConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.device_name, "Kitchen iPad");
        assert_eq!(loaded.role, Role::Initiator);
        assert_eq!(loaded.network.reconnect.max_attempts, 4);
        assert_eq!(loaded.network.transfer.item_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"device_name":"Studio","role":"responder"}"#).unwrap();

        let loaded = PairlinkConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.device_name, "Studio");
        assert_eq!(loaded.network.discovery_port, 9481);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = PairlinkConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
