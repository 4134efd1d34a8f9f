//! Configuration management for the routing core
//!
//! This module provides structured configuration management using TOML/YAML
//! files with serde for serialization and deserialization. Everything the
//! original deployment read from ambient environment flags lives here as an
//! explicit field, so multiple routers can coexist in one process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for one router instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Logical producer identity owning this router
    pub source_id: String,
    /// Use per-shard asynchronous writers (false = direct writes)
    pub asynchronous: bool,
    /// Routing discovery service configuration
    pub routing_service: RoutingServiceConfig,
    /// Control-channel (pub/sub) configuration
    pub control_channel: ControlChannelConfig,
    /// Actuation queue configuration
    pub actuation: ActuationQueueConfig,
    /// Shard backend credentials
    pub backend: BackendConfig,
    /// On-disk failure/backpressure log configuration
    pub persistence: PersistenceConfig,
    /// Retry, health-check and update-request behavior
    pub reliability: ReliabilityConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Routing discovery service coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingServiceConfig {
    /// Base URI of the routing service; empty = start with an empty table
    pub uri: String,
    /// Route used to fetch the initial source mapping
    pub mapping_api: String,
    /// Route used to request shard re-assignment
    pub update_api: String,
}

/// Control-channel bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlChannelConfig {
    /// Subscribe to routing-table updates
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Channel suffix; the subscribed channel is "{source_id}__{channel}"
    pub channel: String,
    /// When set, host:port is a sentinel and the master for this name is
    /// resolved before subscribing
    pub sentinel_master: Option<String>,
}

/// Actuation queue endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuationQueueConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

/// Credentials applied to every shard backend connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub password: Option<String>,
    pub db: i64,
}

/// On-disk log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Base directory for the failure/backpressure/corrupt logs
    pub data_dir: PathBuf,
    /// Persist writes that failed against an unreachable shard, and reload
    /// them onto the writer queue at startup
    pub persist_failures: bool,
}

/// Retry-buffer, health-check and update-request behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Buffer failed writes locally and replay them in order
    pub enable_local_buffering: bool,
    /// Respawn dead background tasks on the next producer call
    pub enable_health_check: bool,
    /// Ask the routing service for re-assignment after repeated failures
    pub enable_update_requests: bool,
    /// Consecutive failed writes per shard before a re-assignment request
    pub min_backlog_writes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Enable console output
    pub console: bool,
    /// Include target/thread metadata in events
    pub structured: bool,
}

/// Log level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl RouterConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: RouterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: RouterConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.source_id.is_empty() {
            errors.push("Source id cannot be empty".to_string());
        }

        if self.control_channel.enabled {
            if self.control_channel.host.is_empty() {
                errors.push("Control channel host cannot be empty".to_string());
            }
            if self.control_channel.port == 0 {
                errors.push("Control channel port cannot be 0".to_string());
            }
            if self.control_channel.channel.is_empty() {
                errors.push("Control channel name cannot be empty".to_string());
            }
        }

        if !self.routing_service.uri.is_empty() {
            if self.routing_service.mapping_api.is_empty() {
                errors.push("Routing service mapping api cannot be empty".to_string());
            }
            if self.reliability.enable_update_requests && self.routing_service.update_api.is_empty()
            {
                errors.push("Routing service update api cannot be empty".to_string());
            }
        }

        if self.persistence.persist_failures && self.persistence.data_dir.as_os_str().is_empty() {
            errors.push("Data directory cannot be empty".to_string());
        }

        if self.reliability.enable_update_requests && self.reliability.min_backlog_writes == 0 {
            errors.push("Minimum backlog writes cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            source_id: "source-1".to_string(),
            asynchronous: true,
            routing_service: RoutingServiceConfig::default(),
            control_channel: ControlChannelConfig::default(),
            actuation: ActuationQueueConfig::default(),
            backend: BackendConfig::default(),
            persistence: PersistenceConfig::default(),
            reliability: ReliabilityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RoutingServiceConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            mapping_api: "/routing/getMapping".to_string(),
            update_api: "/routing/updateMapping".to_string(),
        }
    }
}

impl Default for ControlChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            channel: "routing_updates".to_string(),
            sentinel_master: None,
        }
    }
}

impl Default for ActuationQueueConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { password: None, db: 0 }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./db"),
            persist_failures: false,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            enable_local_buffering: true,
            enable_health_check: false,
            enable_update_requests: false,
            min_backlog_writes: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: true,
            structured: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.source_id, "source-1");
        assert!(config.asynchronous);
        assert_eq!(config.control_channel.channel, "routing_updates");
        assert_eq!(config.reliability.min_backlog_writes, 10);
        assert!(!config.persistence.persist_failures);
    }

    #[test]
    fn test_config_validation() {
        let mut config = RouterConfig::default();
        assert!(config.validate().is_ok());

        config.source_id = String::new();
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&"Source id cannot be empty".to_string()));

        let mut config = RouterConfig::default();
        config.control_channel.port = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&"Control channel port cannot be 0".to_string()));

        let mut config = RouterConfig::default();
        config.reliability.enable_update_requests = true;
        config.reliability.min_backlog_writes = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&"Minimum backlog writes cannot be 0".to_string()));
    }

    #[test]
    fn test_config_serialization() {
        let config = RouterConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: RouterConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.source_id, deserialized.source_id);
        assert_eq!(
            config.control_channel.port,
            deserialized.control_channel.port
        );
    }
}
