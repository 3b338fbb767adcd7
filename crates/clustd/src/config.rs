//! Configuration management for clustd.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use clustd_common::ClustdError;
use clustd_common::constants::{
    HANDSHAKE_TIMEOUT_MS, MAX_TIMING_MS, PING_INTERVAL_MS, RECONNECT_DELAY_MS, REQUEST_TIMEOUT_MS,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Listener and advertised address
    pub server: ServerConfig,

    /// Cluster identity and seed peers
    pub cluster: ClusterConfig,

    /// Protocol timings
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind the listener on
    #[serde(default)]
    pub bind_address: String,

    /// Port to bind the listener on
    #[serde(default)]
    pub bind_port: u16,

    /// Address other nodes dial to reach this one (e.g. `ws://10.0.0.1:7070`)
    #[serde(default)]
    pub remote_address: String,
}

/// Cluster membership configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// This node's unique id
    #[serde(default)]
    pub id: String,

    /// Shared secret all channel keys derive from
    #[serde(default)]
    pub secret: String,

    /// Seed peer addresses dialed at boot
    #[serde(default)]
    pub machines: Vec<String>,
}

/// Protocol timings, all in milliseconds
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            request_timeout_ms: default_request_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl TimingConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

// Default value functions
fn default_ping_interval() -> u64 { PING_INTERVAL_MS }
fn default_request_timeout() -> u64 { REQUEST_TIMEOUT_MS }
fn default_handshake_timeout() -> u64 { HANDSHAKE_TIMEOUT_MS }
fn default_reconnect_delay() -> u64 { RECONNECT_DELAY_MS }

impl AppConfig {
    /// Load configuration from file, with `CLUSTD__SECTION__KEY` environment overrides
    pub fn load(config_path: &str) -> Result<Self> {
        if !Path::new(config_path).exists() {
            anyhow::bail!("Config file not found: {}", config_path);
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(
                config::Environment::with_prefix("CLUSTD")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster.machines")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load config file")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot start with
    pub fn validate(&self) -> Result<(), ClustdError> {
        fn require(value: &str, name: &str) -> Result<(), ClustdError> {
            if value.trim().is_empty() {
                return Err(ClustdError::Config(format!("missing {} config", name)));
            }
            Ok(())
        }

        require(&self.server.bind_address, "server.bind_address")?;
        if self.server.bind_port == 0 {
            return Err(ClustdError::Config("missing server.bind_port config".into()));
        }
        require(&self.server.remote_address, "server.remote_address")?;

        require(&self.cluster.secret, "cluster.secret")?;
        require(&self.cluster.id, "cluster.id")?;
        for host in &self.cluster.machines {
            require(host, "cluster.machines entry")?;
            if *host == self.server.remote_address {
                return Err(ClustdError::Config(format!(
                    "cluster.machines contains this node's own address ({})",
                    host
                )));
            }
        }

        let timing = &self.timing;
        let values = [
            timing.ping_interval_ms,
            timing.request_timeout_ms,
            timing.handshake_timeout_ms,
            timing.reconnect_delay_ms,
        ];
        if values.contains(&0) {
            return Err(ClustdError::Config("timing values must be non-zero".into()));
        }
        if values.iter().any(|&ms| ms > MAX_TIMING_MS) {
            return Err(ClustdError::Config(format!(
                "timing values must not exceed {} ms",
                MAX_TIMING_MS
            )));
        }

        Ok(())
    }

    /// Listener socket address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.bind_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                bind_address: "127.0.0.1".into(),
                bind_port: 7070,
                remote_address: "ws://127.0.0.1:7070".into(),
            },
            cluster: ClusterConfig {
                id: "a".into(),
                secret: "s3cret".into(),
                machines: vec!["ws://127.0.0.1:7071".into()],
            },
            timing: TimingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
        assert_eq!(valid().bind_addr(), "127.0.0.1:7070");
    }

    #[test]
    fn test_missing_secret_rejected() {
        let mut config = valid();
        config.cluster.secret = String::new();
        assert_eq!(
            config.validate(),
            Err(ClustdError::Config("missing cluster.secret config".into()))
        );
    }

    #[test]
    fn test_missing_port_rejected() {
        let mut config = valid();
        config.server.bind_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_seed_equal_to_own_address_rejected() {
        let mut config = valid();
        config.cluster.machines.push(config.server.remote_address.clone());
        assert!(matches!(config.validate(), Err(ClustdError::Config(_))));
    }

    #[test]
    fn test_timing_bounds() {
        let mut config = valid();
        config.timing.ping_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ClustdError::Config(_))));

        let mut config = valid();
        config.timing.reconnect_delay_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(ClustdError::Config(_))));

        let mut config = valid();
        config.timing.ping_interval_ms = MAX_TIMING_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timing_defaults() {
        let timing = TimingConfig::default();
        assert_eq!(timing.ping_interval(), Duration::from_millis(1500));
        assert_eq!(timing.request_timeout(), Duration::from_secs(3));
        assert_eq!(timing.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_yaml_file() {
        let path = std::env::temp_dir().join(format!("clustd-config-{}.yml", std::process::id()));
        std::fs::write(
            &path,
            "server:\n  bind_address: 0.0.0.0\n  bind_port: 7070\n  remote_address: ws://10.0.0.1:7070\n\
             cluster:\n  id: node-a\n  secret: hunter2\n  machines:\n    - ws://10.0.0.2:7070\n\
             timing:\n  reconnect_delay_ms: 250\n",
        )
        .unwrap();

        let config = AppConfig::load(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.cluster.id, "node-a");
        assert_eq!(config.cluster.machines, vec!["ws://10.0.0.2:7070".to_string()]);
        assert_eq!(config.timing.reconnect_delay_ms, 250);
        assert_eq!(config.timing.ping_interval_ms, PING_INTERVAL_MS);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load("/nonexistent/clustd.yml").is_err());
    }
}
