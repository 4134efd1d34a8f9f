//! Routing table and shard descriptors
//!
//! The table maps shard tags to descriptors and their writers. Iteration
//! follows insertion order because the metadata policy is "first entry with
//! non-empty metadata wins".

use crate::actuation::ShardMetadata;
use crate::backend::Endpoint;
use crate::config::BackendConfig;
use crate::writer::ShardWriter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One destination shard as known to a source, in the routing service's
/// wire format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    #[serde(rename = "nodeTag")]
    pub node_tag: String,
    #[serde(rename = "cluster_name", default)]
    pub cluster_name: String,
    #[serde(rename = "masterIP")]
    pub master_host: String,
    #[serde(rename = "redisPort")]
    pub master_port: u16,
    #[serde(rename = "serviceIp", default)]
    pub service_host: Option<String>,
    #[serde(rename = "sentinelPort", default)]
    pub sentinel_port: Option<u16>,
    #[serde(default)]
    pub metadata: ShardMetadata,
    #[serde(skip)]
    pub backpressure_enabled: bool,
}

impl ShardDescriptor {
    /// Write endpoint for the shard's current master
    pub fn endpoint(&self, auth: &BackendConfig) -> Endpoint {
        Endpoint::new(self.master_host.clone(), self.master_port)
            .with_auth(auth.password.clone(), auth.db)
    }
}

/// Read-only view of one table entry
#[derive(Debug, Clone, PartialEq)]
pub struct ShardView {
    pub cluster_name: String,
    pub metadata: ShardMetadata,
}

/// One table entry: the descriptor plus the writer it owns
pub struct ShardEntry {
    pub descriptor: ShardDescriptor,
    pub writer: ShardWriter,
}

/// Insertion-ordered map of shard tag → entry
#[derive(Default)]
pub struct RoutingTable {
    entries: HashMap<String, ShardEntry>,
    order: Vec<String>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, node_tag: &str) -> Option<&ShardEntry> {
        self.entries.get(node_tag)
    }

    pub fn get_mut(&mut self, node_tag: &str) -> Option<&mut ShardEntry> {
        self.entries.get_mut(node_tag)
    }

    /// Insert or replace; a replaced entry keeps its original position
    pub fn insert(&mut self, entry: ShardEntry) {
        let node_tag = entry.descriptor.node_tag.clone();
        if self.entries.insert(node_tag.clone(), entry).is_none() {
            self.order.push(node_tag);
        }
    }

    pub fn remove(&mut self, node_tag: &str) -> Option<ShardEntry> {
        let removed = self.entries.remove(node_tag);
        if removed.is_some() {
            self.order.retain(|tag| tag != node_tag);
        }
        removed
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ShardEntry)> {
        self.order
            .iter()
            .filter_map(|tag| self.entries.get(tag).map(|entry| (tag, entry)))
    }

    /// First non-empty metadata in insertion order
    pub fn first_metadata(&self) -> Option<ShardMetadata> {
        self.iter()
            .map(|(_, entry)| &entry.descriptor.metadata)
            .find(|metadata| !metadata.is_empty())
            .cloned()
    }

    /// Detached copy for snapshot reads
    pub fn view(&self) -> HashMap<String, ShardView> {
        self.entries
            .iter()
            .map(|(tag, entry)| {
                (
                    tag.clone(),
                    ShardView {
                        cluster_name: entry.descriptor.cluster_name.clone(),
                        metadata: entry.descriptor.metadata.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DirectShardWriter;
    use crate::writer::WriterSettings;
    use crate::metrics::RouterMetrics;
    use std::sync::Arc;

    fn descriptor(tag: &str, metadata: ShardMetadata) -> ShardDescriptor {
        ShardDescriptor {
            node_tag: tag.to_string(),
            cluster_name: "cluster-a".to_string(),
            master_host: "10.0.0.1".to_string(),
            master_port: 6379,
            service_host: None,
            sentinel_port: None,
            metadata,
            backpressure_enabled: false,
        }
    }

    struct NoopConnector;

    #[async_trait::async_trait]
    impl crate::backend::BackendConnector for NoopConnector {
        async fn connect(
            &self,
            _endpoint: &crate::backend::Endpoint,
        ) -> crate::error::Result<Box<dyn crate::backend::ShardBackend>> {
            Err(crate::error::RouterError::Discovery("noop".to_string()))
        }
    }

    fn entry(tag: &str, metadata: ShardMetadata) -> ShardEntry {
        let descriptor = descriptor(tag, metadata);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = ShardWriter::Direct(DirectShardWriter::new(
            Endpoint::new("10.0.0.1", 6379),
            WriterSettings {
                source_id: "src".to_string(),
                node_tag: tag.to_string(),
                data_dir: std::path::PathBuf::from("/tmp"),
                persist_failures: false,
                buffer_retries: false,
                health_check: false,
            },
            Arc::new(NoopConnector),
            tx,
            RouterMetrics::new(),
        ));
        ShardEntry { descriptor, writer }
    }

    #[test]
    fn test_insertion_order_iteration() {
        let mut table = RoutingTable::new();
        table.insert(entry("n2", ShardMetadata::new()));
        table.insert(entry("n0", ShardMetadata::new()));
        table.insert(entry("n1", ShardMetadata::new()));

        let tags: Vec<_> = table.iter().map(|(tag, _)| tag.clone()).collect();
        assert_eq!(tags, vec!["n2", "n0", "n1"]);

        // replacing keeps the original position
        table.insert(entry("n0", ShardMetadata::new()));
        let tags: Vec<_> = table.iter().map(|(tag, _)| tag.clone()).collect();
        assert_eq!(tags, vec!["n2", "n0", "n1"]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_first_metadata_in_insertion_order() {
        let mut table = RoutingTable::new();
        table.insert(entry("n0", ShardMetadata::new()));

        let mut meta_a = ShardMetadata::new();
        meta_a.insert("act_batch_size".to_string(), serde_json::json!(4));
        table.insert(entry("n1", meta_a.clone()));

        let mut meta_b = ShardMetadata::new();
        meta_b.insert("act_batch_size".to_string(), serde_json::json!(8));
        table.insert(entry("n2", meta_b));

        assert_eq!(table.first_metadata(), Some(meta_a));
    }

    #[test]
    fn test_remove_updates_order() {
        let mut table = RoutingTable::new();
        table.insert(entry("n0", ShardMetadata::new()));
        table.insert(entry("n1", ShardMetadata::new()));
        assert!(table.remove("n0").is_some());
        assert!(table.remove("n0").is_none());

        let tags: Vec<_> = table.iter().map(|(tag, _)| tag.clone()).collect();
        assert_eq!(tags, vec!["n1"]);
    }

    #[test]
    fn test_descriptor_wire_format() {
        let raw = r#"{
            "nodeTag": "framedb-0",
            "cluster_name": "cluster-a",
            "masterIP": "10.0.0.5",
            "redisPort": 6380,
            "metadata": {"act_batch_size": 2, "fps": 25}
        }"#;
        let descriptor: ShardDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(descriptor.node_tag, "framedb-0");
        assert_eq!(descriptor.master_host, "10.0.0.5");
        assert_eq!(descriptor.master_port, 6380);
        assert!(!descriptor.backpressure_enabled);
        assert_eq!(
            descriptor.metadata.get("fps"),
            Some(&serde_json::json!(25))
        );
    }
}
