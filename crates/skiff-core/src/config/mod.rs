//! Configuration for a Skiff server instance.
//!
//! The engine receives a listen port, a CIDR hint for local IPv4 selection,
//! a transfer folder, a buffer size, and the socket/stall deadlines. Values
//! are read from and written to TOML; every field has a default so partial
//! files load cleanly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a Skiff server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Display name for this server
    pub name: String,
    /// TCP listen port
    pub port: u16,
    /// CIDR hint (`a.b.c.d/len`) used to pick the local IPv4 address
    pub local_network_cidr: Option<String>,
    /// Folder served to peers and written to by inbound transfers
    pub transfer_folder: PathBuf,
    /// Socket buffer size in bytes; also the transfer chunk size
    pub buffer_size: usize,
    /// Deadline for connect calls
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Deadline for each send call
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    /// Deadline for each receive call
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,
    /// No-progress interval after which an inbound transfer counts as stalled
    #[serde(with = "humantime_serde")]
    pub stall_timeout: Duration,
    /// Fraction of the file that must arrive between progress events
    pub transfer_update_interval: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: hostname::get().map_or_else(
                |_| "Skiff Server".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            port: crate::DEFAULT_PORT,
            local_network_cidr: None,
            transfer_folder: std::env::temp_dir().join("skiff"),
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            send_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            receive_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            stall_timeout: Duration::from_millis(crate::DEFAULT_STALL_TIMEOUT_MS),
            transfer_update_interval: crate::DEFAULT_TRANSFER_UPDATE_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, crate::DEFAULT_PORT);
        assert_eq!(config.buffer_size, crate::DEFAULT_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.local_network_cidr.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = ServerConfig::default();
        config.name = "test-server".to_string();
        config.port = 52599;
        config.local_network_cidr = Some("192.168.1.0/24".to_string());
        config.stall_timeout = Duration::from_secs(2);

        config.save_to(&path).unwrap();
        let loaded = ServerConfig::load_from(&path).unwrap();

        assert_eq!(loaded.name, "test-server");
        assert_eq!(loaded.port, 52599);
        assert_eq!(loaded.local_network_cidr.as_deref(), Some("192.168.1.0/24"));
        assert_eq!(loaded.stall_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 52551\n").unwrap();

        let loaded = ServerConfig::load_from(&path).unwrap();
        assert_eq!(loaded.port, 52551);
        assert_eq!(loaded.buffer_size, crate::DEFAULT_BUFFER_SIZE);
    }
}
