//! Intake Configuration
//!
//! Runtime knobs for the connection supervisor and sync orchestrator. The
//! daemon maps its TOML file onto [`IntakeConfig`]; embedders can build one
//! directly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default message service URL
pub const DEFAULT_SERVER_URL: &str = "https://textsecure-service-ca.whispersystems.org";

/// Default ports tried by the transport
pub const DEFAULT_SERVER_PORTS: [u16; 3] = [80, 4433, 8443];

/// Default attachment server URL
pub const DEFAULT_ATTACHMENT_SERVER_URL: &str =
    "https://whispersystems-textsecure-attachments.s3.amazonaws.com";

/// Fixed delay before retrying a failed connection while online
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Time the primary device has to answer a sync request
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Broadcast capacity of the signal bus
pub const DEFAULT_SIGNAL_BUFFER: usize = 256;

/// Message service the receive connection talks to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub server_url: String,
    pub server_ports: Vec<u16>,
    pub attachment_server_url: String,
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            server_ports: DEFAULT_SERVER_PORTS.to_vec(),
            attachment_server_url: DEFAULT_ATTACHMENT_SERVER_URL.to_string(),
        }
    }
}

/// Intake core configuration
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeConfig {
    pub endpoint: ServiceEndpoint,
    /// Delay between connection retries while online
    pub retry_delay: Duration,
    /// Give up after this many consecutive retries (`None` retries forever)
    pub max_retry_attempts: Option<u32>,
    pub sync_timeout: Duration,
    pub signal_buffer: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            endpoint: ServiceEndpoint::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_attempts: None,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            signal_buffer: DEFAULT_SIGNAL_BUFFER,
        }
    }
}

impl IntakeConfig {
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IntakeConfig::default();
        assert_eq!(config.retry_delay, Duration::from_secs(60));
        assert_eq!(config.max_retry_attempts, None);
        assert_eq!(config.sync_timeout, Duration::from_secs(60));
        assert_eq!(config.endpoint.server_ports, vec![80, 4433, 8443]);
    }

    #[test]
    fn test_builders() {
        let config = IntakeConfig::default()
            .with_retry_delay(Duration::from_millis(10))
            .with_max_retry_attempts(Some(3))
            .with_sync_timeout(Duration::from_millis(50));
        assert_eq!(config.retry_delay, Duration::from_millis(10));
        assert_eq!(config.max_retry_attempts, Some(3));
        assert_eq!(config.sync_timeout, Duration::from_millis(50));
    }
}
