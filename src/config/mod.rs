//! # Configuration Management Module
//!
//! TOML configuration for the gateway, loaded once at startup.
//!
//! ## Configuration Structure
//!
//! - [`MeshcoreConfig`] - device address, reconnect and refresh timing
//! - [`StatusConfig`] - where the durable status file lives
//! - [`ControlConfig`] - the local command listener
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshcore_gateway::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Device: {}:{}", config.meshcore.host, config.meshcore.port);
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [meshcore]
//! host = "192.168.1.50"
//! port = 5000
//! reconnect_ms = 5000
//! refresh_contacts_ms = 60000
//!
//! [status]
//! data_dir = "./data"
//!
//! [control]
//! listen = "127.0.0.1:7373"
//! ```
//!
//! Interval values that are missing, zero or negative fall back to their
//! defaults. Host and port are not checked here; the lifecycle manager validates
//! them at start and reports a configuration error through the status surface.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::time::Duration;

use crate::lifecycle::ConnectionConfig;
use crate::meshcore::ClientOptions;

pub const DEFAULT_RECONNECT_MS: u64 = 5_000;
pub const DEFAULT_REFRESH_CONTACTS_MS: u64 = 60_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub meshcore: MeshcoreConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshcoreConfig {
    #[serde(default)]
    pub host: String,
    /// Kept signed so out-of-range values reach validation instead of failing the parse.
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default)]
    pub reconnect_ms: Option<i64>,
    #[serde(default)]
    pub refresh_contacts_ms: Option<i64>,
    #[serde(default)]
    pub request_timeout_ms: Option<i64>,
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_port() -> i64 {
    5000
}

fn default_app_name() -> String {
    "meshcore-gateway".to_string()
}

/// Positive-integer coercion: anything absent or `<= 0` becomes `default`.
fn positive_or(value: Option<i64>, default: u64) -> u64 {
    value
        .and_then(|v| u64::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl Default for MeshcoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_port(),
            reconnect_ms: Some(DEFAULT_RECONNECT_MS as i64),
            refresh_contacts_ms: Some(DEFAULT_REFRESH_CONTACTS_MS as i64),
            request_timeout_ms: Some(DEFAULT_REQUEST_TIMEOUT_MS as i64),
            app_name: default_app_name(),
        }
    }
}

impl MeshcoreConfig {
    pub fn reconnect_ms(&self) -> u64 {
        positive_or(self.reconnect_ms, DEFAULT_RECONNECT_MS)
    }

    pub fn refresh_contacts_ms(&self) -> u64 {
        positive_or(self.refresh_contacts_ms, DEFAULT_REFRESH_CONTACTS_MS)
    }

    pub fn request_timeout_ms(&self) -> u64 {
        positive_or(self.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS)
    }

    /// Connection settings handed to the lifecycle manager, not yet validated.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            reconnect_interval_ms: self.reconnect_ms(),
            refresh_interval_ms: self.refresh_contacts_ms(),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_millis(self.request_timeout_ms()),
            app_name: self.app_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub data_dir: String,
    #[serde(default = "default_status_file")]
    pub file: String,
}

fn default_status_file() -> String {
    "status.json".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            file: default_status_file(),
        }
    }
}

impl StatusConfig {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,
    #[serde(default = "default_control_listen")]
    pub listen: String,
}

fn default_control_enabled() -> bool {
    true
}

fn default_control_listen() -> String {
    "127.0.0.1:7373".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_control_enabled(),
            listen: default_control_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl LoggingConfig {
    /// Parsed `level`; unknown names fall back to info.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level
            .trim()
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshcore-gateway.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_level_parsing() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.level_filter(), log::LevelFilter::Info);
        logging.level = "DEBUG".into();
        assert_eq!(logging.level_filter(), log::LevelFilter::Debug);
        logging.level = "chatty".into();
        assert_eq!(logging.level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_non_positive_intervals_fall_back_to_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [meshcore]
            host = "radio.local"
            port = 5000
            reconnect_ms = 0
            refresh_contacts_ms = -10
            "#,
        )
        .unwrap();
        let conn = cfg.meshcore.connection_config();
        assert_eq!(conn.reconnect_interval_ms, DEFAULT_RECONNECT_MS);
        assert_eq!(conn.refresh_interval_ms, DEFAULT_REFRESH_CONTACTS_MS);
        assert_eq!(cfg.meshcore.request_timeout_ms(), DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn test_out_of_range_port_survives_parsing() {
        let cfg: Config = toml::from_str("[meshcore]\nhost = \"h\"\nport = 70000\n").unwrap();
        assert_eq!(cfg.meshcore.port, 70_000);
        assert!(cfg.meshcore.connection_config().validate().is_err());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let cfg: Config = toml::from_str("[meshcore]\nhost = \"h\"\n").unwrap();
        assert_eq!(cfg.meshcore.port, 5000);
        assert_eq!(cfg.meshcore.app_name, "meshcore-gateway");
        assert!(cfg.control.enabled);
        assert_eq!(cfg.control.listen, "127.0.0.1:7373");
        assert_eq!(cfg.status.path(), PathBuf::from("./data").join("status.json"));
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.meshcore.host, "127.0.0.1");
        assert_eq!(back.meshcore.reconnect_ms(), 5_000);
        assert_eq!(back.logging.level, "info");
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let cfg = Config::load(path).await.unwrap();
        assert_eq!(cfg.meshcore.refresh_contacts_ms(), 60_000);
        assert!(Config::load("/nonexistent/config.toml").await.is_err());
    }
}
