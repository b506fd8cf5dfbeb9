//! Daemon Configuration
//!
//! Configuration management for the intake daemon.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use signal_intake::config::{
    DEFAULT_ATTACHMENT_SERVER_URL, DEFAULT_SERVER_PORTS, DEFAULT_SERVER_URL, DEFAULT_SIGNAL_BUFFER,
};
use signal_intake::{IntakeConfig, ServiceEndpoint};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Message service
    #[serde(default)]
    pub service: ServiceConfig,

    /// Connection and sync behaviour
    #[serde(default)]
    pub intake: IntakeSection,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,

    /// File this configuration was loaded from
    #[serde(skip)]
    source: Option<PathBuf>,
}

/// Message service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_server_ports")]
    pub server_ports: Vec<u16>,

    #[serde(default = "default_attachment_server_url")]
    pub attachment_server_url: String,
}

/// Connection supervisor and sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeSection {
    /// Delay between connection retries while online, in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Give up after this many consecutive retries (unset retries forever)
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,

    /// Time the primary device has to answer a sync request, in seconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// Signal bus capacity
    #[serde(default = "default_signal_buffer")]
    pub signal_buffer: usize,
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (settings store)
    pub data_dir: PathBuf,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_server_ports() -> Vec<u16> {
    DEFAULT_SERVER_PORTS.to_vec()
}

fn default_attachment_server_url() -> String {
    DEFAULT_ATTACHMENT_SERVER_URL.to_string()
}

fn default_retry_delay() -> u64 {
    60
}

fn default_sync_timeout() -> u64 {
    60
}

fn default_signal_buffer() -> usize {
    DEFAULT_SIGNAL_BUFFER
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            server_ports: default_server_ports(),
            attachment_server_url: default_attachment_server_url(),
        }
    }
}

impl Default for IntakeSection {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay(),
            max_retry_attempts: None,
            sync_timeout_secs: default_sync_timeout(),
            signal_buffer: default_signal_buffer(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from(".local/share"))
                .join("signal-intake"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            intake: IntakeSection::default(),
            paths: PathConfig::default(),
            source: None,
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("signal-intake")
}

impl Config {
    /// Load configuration from file, creating default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_dir().join(CONFIG_FILE))
    }

    /// Load configuration from an explicit path, creating default if not found
    ///
    /// The file keeps whatever name it was given; later saves write back to it.
    /// A file without a `[paths]` section uses the default directories.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let mut config = Config::default();
            if let Some(parent) = config_path.parent() {
                config.paths.config_dir = parent.to_path_buf();
            }
            config
        };

        config.source = Some(config_path.to_path_buf());
        if !config_path.exists() {
            config.save()?;
        }
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir).context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.source
            .clone()
            .unwrap_or_else(|| self.paths.config_dir.join(CONFIG_FILE))
    }

    /// Get the settings store path
    pub fn settings_path(&self) -> PathBuf {
        self.paths.data_dir.join("settings.json")
    }

    /// Map onto the intake core configuration
    pub fn intake_config(&self) -> IntakeConfig {
        IntakeConfig {
            endpoint: ServiceEndpoint {
                server_url: self.service.server_url.clone(),
                server_ports: self.service.server_ports.clone(),
                attachment_server_url: self.service.attachment_server_url.clone(),
            },
            retry_delay: Duration::from_secs(self.intake.retry_delay_secs),
            max_retry_attempts: self.intake.max_retry_attempts,
            sync_timeout: Duration::from_secs(self.intake.sync_timeout_secs),
            signal_buffer: self.intake.signal_buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.intake.retry_delay_secs, 60);
        assert_eq!(config.intake.max_retry_attempts, None);
        assert_eq!(config.service.server_ports, vec![80, 4433, 8443]);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.intake.sync_timeout_secs, config.intake.sync_timeout_secs);
        assert_eq!(parsed.service.server_url, config.service.server_url);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [intake]
            retry_delay_secs = 5
            max_retry_attempts = 10

            [paths]
            config_dir = "/tmp/signal-intake"
            data_dir = "/tmp/signal-intake/data"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();

        let intake = config.intake_config();
        assert_eq!(intake.retry_delay, Duration::from_secs(5));
        assert_eq!(intake.max_retry_attempts, Some(10));
        assert_eq!(intake.sync_timeout, Duration::from_secs(60));
        assert_eq!(intake.endpoint, ServiceEndpoint::default());
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE);

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.config_path(), path);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.intake.retry_delay_secs, 60);
    }

    #[test]
    fn test_load_keeps_custom_file_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(!temp_dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.config_path(), path);

        config.intake.retry_delay_secs = 7;
        config.save().unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.intake.retry_delay_secs, 7);
        assert!(!temp_dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_existing_file_without_paths_uses_default_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("minimal.toml");
        fs::write(&path, "[intake]\nretry_delay_secs = 3\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.intake.retry_delay_secs, 3);
        assert_eq!(config.config_path(), path);
        assert_eq!(config.paths.data_dir, PathConfig::default().data_dir);
    }
}
