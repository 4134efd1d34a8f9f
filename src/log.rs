//! Structured logging for the routing core
//!
//! This module provides structured logging using the `tracing` crate with
//! console output configured from [`LoggingConfig`].

use crate::config::{LogLevel, LoggingConfig};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;

static INIT: Once = Once::new();

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    INIT.call_once(|| {
        let _ = init_logging_inner(config);
    });
    Ok(())
}

fn init_logging_inner(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let level = convert_log_level(&config.level);

    let builder = tracing_subscriber::fmt()
        .with_target(config.structured)
        .with_thread_ids(config.structured)
        .with_timer(UtcTime::rfc_3339())
        .with_ansi(config.console)
        .with_max_level(level);

    builder.init();

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

/// Convert our log level to tracing level
fn convert_log_level(level: &LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log a shard write outcome with structured fields
pub fn log_shard_write(op: &str, key: &str, node_tag: &str, success: bool) {
    if success {
        tracing::debug!(op = op, key = key, node_tag = node_tag, "shard write completed");
    } else {
        tracing::error!(op = op, key = key, node_tag = node_tag, "shard write failed");
    }
}

/// Log router startup
pub fn log_startup(config: &crate::config::RouterConfig) {
    tracing::info!("Starting framedb router for source: {}", config.source_id);

    if config.reliability.enable_local_buffering {
        tracing::info!("Local buffering enabled, failed writes are retried in order");
    }
    if config.reliability.enable_health_check {
        tracing::info!("Health check enabled, dead background tasks will be respawned");
    }
    if config.persistence.persist_failures {
        tracing::info!(
            "Failure persistence enabled: data_dir={}",
            config.persistence.data_dir.display()
        );
    }
    if config.control_channel.enabled {
        tracing::info!(
            "Routing updates enabled on channel: {}__{}",
            config.source_id,
            config.control_channel.channel
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(convert_log_level(&LogLevel::Error), Level::ERROR);
        assert_eq!(convert_log_level(&LogLevel::Warn), Level::WARN);
        assert_eq!(convert_log_level(&LogLevel::Info), Level::INFO);
        assert_eq!(convert_log_level(&LogLevel::Debug), Level::DEBUG);
        assert_eq!(convert_log_level(&LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_logging_initialization() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
    }
}
