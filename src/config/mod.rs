//! Configuration module
//!
//! Handles loading and saving FriendHub configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::hub::{
    HubConfig, CHECK_USERS_INTERVAL, HEARTBEAT_TIMEOUT, MAX_HEARTBEAT_TIMEOUT, MIN_CHECK_INTERVAL,
    QUEUE_CAPACITY,
};
use crate::network::{Transport, HEARTBEAT_INTERVAL, MIN_HEARTBEAT_INTERVAL, WRITE_DEADLINE};
use crate::protocol::DEFAULT_PORT;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Hub server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport to serve
    #[serde(default)]
    pub transport: Transport,
    /// Address to listen on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Liveness check interval in ms
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
    /// Heartbeat timeout in ms
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// Capacity of the login and heartbeat queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Write deadline for notifications in ms
    #[serde(default = "default_write_deadline")]
    pub write_deadline_ms: u64,
}

fn default_bind_address() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_check_interval() -> u64 {
    CHECK_USERS_INTERVAL.as_millis() as u64
}

fn default_heartbeat_timeout() -> u64 {
    HEARTBEAT_TIMEOUT.as_millis() as u64
}

fn default_queue_capacity() -> usize {
    QUEUE_CAPACITY
}

fn default_write_deadline() -> u64 {
    WRITE_DEADLINE.as_millis() as u64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            bind_address: default_bind_address(),
            check_interval_ms: default_check_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            queue_capacity: default_queue_capacity(),
            write_deadline_ms: default_write_deadline(),
        }
    }
}

impl ServerConfig {
    /// Hub settings derived from this section
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            check_interval: Duration::from_millis(self.check_interval_ms).max(MIN_CHECK_INTERVAL),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms).min(MAX_HEARTBEAT_TIMEOUT),
            // A zero capacity channel would panic
            queue_capacity: self.queue_capacity.max(1),
        }
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Transport to connect with
    #[serde(default)]
    pub transport: Transport,
    /// Hub address
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Heartbeat interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

fn default_server_address() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL.as_millis() as u64
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            server_address: default_server_address(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms).max(MIN_HEARTBEAT_INTERVAL)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("friendhub/config.toml")),
            Some(PathBuf::from("./friendhub.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Sample configuration, everything at its default but the transport
pub fn sample_config() -> Config {
    Config {
        server: ServerConfig {
            transport: Transport::Udp,
            ..Default::default()
        },
        client: ClientConfig {
            transport: Transport::Udp,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    Ok(toml::to_string_pretty(&sample_config())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.transport, Transport::Tcp);
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");

        let hub = config.server.hub_config();
        assert_eq!(hub.check_interval, Duration::from_millis(300));
        assert_eq!(hub.heartbeat_timeout, Duration::from_millis(1000));
        assert_eq!(hub.queue_capacity, 10);
        assert_eq!(config.server.write_deadline(), Duration::from_secs(3));
        assert_eq!(config.client.heartbeat_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.server.heartbeat_timeout_ms = 2500;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.heartbeat_timeout_ms, 2500);
        assert_eq!(loaded.client.server_address, config.client.server_address);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ntransport = \"udp\"\nqueue_capacity = 0").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.transport, Transport::Udp);
        assert_eq!(config.server.check_interval_ms, 300);
        assert_eq!(config.server.hub_config().queue_capacity, 1);
        assert!(!config.general.verbose);
    }

    #[tokio::test]
    async fn test_out_of_range_durations_are_clamped() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\ncheck_interval_ms = 0\nheartbeat_timeout_ms = {}\n[client]\nheartbeat_interval_ms = 0",
            u64::MAX
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        let hub = config.server.hub_config();
        assert_eq!(hub.check_interval, MIN_CHECK_INTERVAL);
        assert_eq!(hub.heartbeat_timeout, MAX_HEARTBEAT_TIMEOUT);
        assert_eq!(config.client.heartbeat_interval(), MIN_HEARTBEAT_INTERVAL);

        // The sweep keeps ticking with the clamped period
        let mut ticks = crate::hub::spawn_ticker(hub.check_interval);
        let tick = tokio::time::timeout(Duration::from_secs(2), ticks.recv()).await.unwrap();
        assert!(tick.is_some());
    }

    #[test]
    fn test_save_sample_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/friendhub.toml");

        sample_config().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.transport, Transport::Udp);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/friendhub.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.transport, Transport::Udp);
        assert_eq!(parsed.client.transport, Transport::Udp);
    }
}
