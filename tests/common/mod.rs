//! Shared in-memory backend for the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use framedb_router::{
    ActuationSink, BackendConnector, Endpoint, Result, ShardBackend, WriteOp,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded backend write: `(endpoint, op, key, data)`
pub type RecordedOp = (String, WriteOp, String, Vec<u8>);

/// State shared by every connection the mock connector hands out
#[derive(Clone, Default)]
pub struct ClusterState {
    pub ops: Arc<Mutex<Vec<RecordedOp>>>,
    pub fail_writes: Arc<AtomicBool>,
    pub ping_ok: Arc<AtomicBool>,
}

impl ClusterState {
    pub fn healthy() -> Self {
        let state = Self::default();
        state.ping_ok.store(true, Ordering::SeqCst);
        state
    }

    pub fn dead() -> Self {
        let state = Self::default();
        state.fail_writes.store(true, Ordering::SeqCst);
        state
    }

    /// Keys delivered to one endpoint, in delivery order
    pub fn keys_for(&self, endpoint: &str) -> Vec<String> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _, _)| e == endpoint)
            .map(|(_, _, key, _)| key.clone())
            .collect()
    }

    pub fn total_ops(&self) -> usize {
        self.ops.lock().unwrap().len()
    }
}

pub struct MemoryBackend {
    endpoint: String,
    state: ClusterState,
}

impl MemoryBackend {
    fn record(&self, op: WriteOp, key: &str, data: &[u8]) -> Result<()> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(framedb_router::RouterError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "injected backend failure",
            )));
        }
        self.state.ops.lock().unwrap().push((
            self.endpoint.clone(),
            op,
            key.to_string(),
            data.to_vec(),
        ));
        Ok(())
    }
}

#[async_trait]
impl ShardBackend for MemoryBackend {
    async fn set(&mut self, key: &str, data: &[u8]) -> Result<()> {
        self.record(WriteOp::Set, key, data)
    }
    async fn lpush(&mut self, key: &str, data: &[u8]) -> Result<()> {
        self.record(WriteOp::Lpush, key, data)
    }
    async fn rpush(&mut self, key: &str, data: &[u8]) -> Result<()> {
        self.record(WriteOp::Rpush, key, data)
    }
    async fn ping(&mut self) -> bool {
        self.state.ping_ok.load(Ordering::SeqCst)
    }
}

pub struct MemoryConnector {
    pub state: ClusterState,
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ShardBackend>> {
        Ok(Box::new(MemoryBackend {
            endpoint: endpoint.to_string(),
            state: self.state.clone(),
        }))
    }
}

/// Actuation sink that records instead of publishing
#[derive(Default)]
pub struct RecordingSink {
    pub published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

#[async_trait]
impl ActuationSink for RecordingSink {
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((queue.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Poll until the condition holds or a generous deadline passes
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Descriptor payload in the control channel's wire format
pub fn shard_json(
    node_tag: &str,
    cluster: &str,
    host: &str,
    port: u16,
    batch_size: Option<u64>,
) -> serde_json::Value {
    let metadata = match batch_size {
        Some(size) => serde_json::json!({ "act_batch_size": size }),
        None => serde_json::json!({}),
    };
    serde_json::json!({
        "nodeTag": node_tag,
        "cluster_name": cluster,
        "masterIP": host,
        "redisPort": port,
        "metadata": metadata,
    })
}
