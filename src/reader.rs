//! Shard reader for consumers
//!
//! The read-side counterpart of the router: resolves one shard from the
//! source's mapping and polls it for data. Used by consumer processes that
//! drain what a source wrote.

use crate::backend::{ReadBackend, RedisBackend};
use crate::config::BackendConfig;
use crate::discovery::RoutingServiceClient;
use crate::error::{Result, RouterError};
use crate::router::table::ShardDescriptor;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Read outcome events surfaced to the optional callback
pub const READ_SUCCESS_EVENT: &str = "framedb_read_success";
pub const READ_FAIL_EVENT: &str = "framedb_read_fail";

/// Observer for read outcomes: `(key, event, error)`
pub type ReadCallback = Box<dyn Fn(&str, &str, Option<&str>) + Send + Sync>;

/// Polling reader bound to one `(source, shard)` pair
pub struct RouterReader {
    source_id: String,
    node_tag: String,
    backend: Box<dyn ReadBackend>,
    callback: Option<ReadCallback>,
}

impl RouterReader {
    /// Resolve the shard from the source's mapping and connect to it
    pub async fn connect(
        source_id: &str,
        node_tag: &str,
        routing_service: &RoutingServiceClient,
        auth: &BackendConfig,
        callback: Option<ReadCallback>,
    ) -> Result<Self> {
        let mapping = routing_service.fetch_mapping(source_id).await?;
        let descriptor = mapping
            .into_iter()
            .find(|d| d.node_tag == node_tag)
            .ok_or_else(|| {
                RouterError::Discovery(format!(
                    "node {} is not receiving any frames from source {}",
                    node_tag, source_id
                ))
            })?;

        let backend = Box::new(RedisBackend::connect(&descriptor.endpoint(auth)).await?);
        Ok(Self {
            source_id: source_id.to_string(),
            node_tag: node_tag.to_string(),
            backend,
            callback,
        })
    }

    /// Build a reader from an already-resolved descriptor and backend
    pub fn from_parts(
        source_id: &str,
        descriptor: &ShardDescriptor,
        backend: Box<dyn ReadBackend>,
        callback: Option<ReadCallback>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            node_tag: descriptor.node_tag.clone(),
            backend,
            callback,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn node_tag(&self) -> &str {
        &self.node_tag
    }

    /// Poll `GET key` until a value appears
    pub async fn get(&mut self, key: &str) -> Result<Vec<u8>> {
        loop {
            match self.backend.get(key).await {
                Ok(Some(data)) => {
                    self.emit(key, READ_SUCCESS_EVENT, None);
                    return Ok(data);
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    self.emit(key, READ_FAIL_EVENT, Some(&e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    /// Poll `LPOP key` until an element appears
    pub async fn lpop(&mut self, key: &str) -> Result<Vec<u8>> {
        loop {
            match self.backend.lpop(key).await {
                Ok(Some(data)) => {
                    self.emit(key, READ_SUCCESS_EVENT, None);
                    return Ok(data);
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    self.emit(key, READ_FAIL_EVENT, Some(&e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    /// Poll `RPOP key` until an element appears
    pub async fn rpop(&mut self, key: &str) -> Result<Vec<u8>> {
        loop {
            match self.backend.rpop(key).await {
                Ok(Some(data)) => {
                    self.emit(key, READ_SUCCESS_EVENT, None);
                    return Ok(data);
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    self.emit(key, READ_FAIL_EVENT, Some(&e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    fn emit(&self, key: &str, event: &str, error: Option<&str>) {
        if let Some(callback) = &self.callback {
            callback(key, event, error);
        }
    }
}
