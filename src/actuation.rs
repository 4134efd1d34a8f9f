//! Actuation batching and publication
//!
//! Downstream consumers pace themselves on batch-completion notices instead
//! of per-write signals. The controller accumulates `(seq, key, ts)` triples
//! up to the batch size taken from shard metadata and hands full batches to
//! a background publisher task over a bounded queue; a saturated queue
//! blocks the caller, which is the intended flow control. Publication is
//! best-effort: a failed push is dropped after a reconnect attempt.

use crate::backend::Endpoint;
use crate::error::Result;
use crate::metrics::{incr, RouterMetrics};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Opaque operator-set shard metadata
pub type ShardMetadata = HashMap<String, Value>;

/// Metadata key carrying the actuation batch size
pub const BATCH_SIZE_KEY: &str = "act_batch_size";

const PUBLISH_QUEUE_CAPACITY: usize = 100;

/// One batch-completion notice, serialized onto the actuation queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuationPacket {
    #[serde(rename = "sourceID")]
    pub source_id: String,
    #[serde(rename = "actuationSeq")]
    pub actuation_seq: u64,
    pub keys: Vec<String>,
    pub seq: Vec<u64>,
    pub ts: Vec<f64>,
}

/// Destination queue for actuation packets
#[async_trait]
pub trait ActuationSink: Send {
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Re-establish the underlying connection after a publish failure
    async fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Production sink: LPUSH onto a Redis list
pub struct RedisActuationSink {
    endpoint: Endpoint,
    connection: Option<redis::aio::MultiplexedConnection>,
}

impl RedisActuationSink {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connection: None,
        }
    }

    async fn connection(&mut self) -> Result<&mut redis::aio::MultiplexedConnection> {
        if self.connection.is_none() {
            let client = redis::Client::open(self.endpoint.url())?;
            self.connection = Some(client.get_multiplexed_async_connection().await?);
        }
        Ok(self.connection.as_mut().unwrap())
    }
}

#[async_trait]
impl ActuationSink for RedisActuationSink {
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<()> {
        let connection = self.connection().await?;
        let _: () = connection.lpush(queue, payload).await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.connection = None;
        self.connection().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BatchState {
    activated: bool,
    batch_size: usize,
    actuation_seq: u64,
    seqs: Vec<u64>,
    keys: Vec<String>,
    ts: Vec<f64>,
}

/// Batches per-write sequence/key metadata and publishes completion notices
pub struct ActuationController {
    source_id: String,
    state: Mutex<BatchState>,
    tx: mpsc::Sender<ActuationPacket>,
    _publisher: tokio::task::JoinHandle<()>,
}

impl ActuationController {
    pub fn new(source_id: &str, sink: Box<dyn ActuationSink>, metrics: Arc<RouterMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        let queue_name = format!("{}__act_queue", source_id);
        let publisher = tokio::spawn(run_publisher(rx, sink, queue_name, metrics));
        tracing::info!("Initialized actuation queue publisher for {}", source_id);

        Self {
            source_id: source_id.to_string(),
            state: Mutex::new(BatchState::default()),
            tx,
            _publisher: publisher,
        }
    }

    /// Reconfigure from shard metadata; `None` (or metadata without a usable
    /// batch size) disables actuation and turns `update` into a no-op.
    /// The batch buffer and the packet sequence both reset.
    pub async fn reset_config(&self, metadata: Option<&ShardMetadata>) {
        let mut state = self.state.lock().await;
        state.actuation_seq = 0;
        state.seqs.clear();
        state.keys.clear();
        state.ts.clear();

        let batch_size = metadata
            .and_then(|m| m.get(BATCH_SIZE_KEY))
            .and_then(|v| v.as_u64());

        match batch_size {
            Some(size) if size > 0 => {
                state.activated = true;
                state.batch_size = size as usize;
            }
            Some(_) | None => {
                if metadata.is_some() {
                    tracing::warn!(
                        "metadata for {} has no usable {}, actuation disabled",
                        self.source_id,
                        BATCH_SIZE_KEY
                    );
                }
                state.activated = false;
                state.batch_size = 0;
            }
        }
    }

    /// Record one completed write; flushes a packet when the batch fills.
    /// Blocks only when the publisher queue is saturated.
    pub async fn update(&self, seq_number: u64, key_prefix: &str) {
        let packet = {
            let mut state = self.state.lock().await;
            if !state.activated {
                return;
            }

            state.seqs.push(seq_number);
            state.keys.push(key_prefix.to_string());
            state.ts.push(now_seconds());

            if state.seqs.len() % state.batch_size != 0 {
                return;
            }

            let packet = ActuationPacket {
                source_id: self.source_id.clone(),
                actuation_seq: state.actuation_seq,
                keys: std::mem::take(&mut state.keys),
                seq: std::mem::take(&mut state.seqs),
                ts: std::mem::take(&mut state.ts),
            };
            state.actuation_seq += 1;
            packet
        };

        if self.tx.send(packet).await.is_err() {
            tracing::error!("actuation publisher is gone, dropping batch");
        }
    }
}

async fn run_publisher(
    mut rx: mpsc::Receiver<ActuationPacket>,
    mut sink: Box<dyn ActuationSink>,
    queue_name: String,
    metrics: Arc<RouterMetrics>,
) {
    while let Some(packet) = rx.recv().await {
        let payload = match serde_json::to_vec(&packet) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("failed to encode actuation packet: {}", e);
                continue;
            }
        };

        match sink.publish(&queue_name, &payload).await {
            Ok(()) => {
                incr(&metrics.actuation.batches_published);
                tracing::info!("Pushed actuation message {}", packet.actuation_seq);
            }
            Err(e) => {
                // best-effort signal: the packet is dropped, not retried
                tracing::error!("Failed to push actuation message, reconnecting: {}", e);
                incr(&metrics.actuation.packets_dropped);
                if let Err(e) = sink.reconnect().await {
                    tracing::error!("actuation reconnect failed: {}", e);
                }
            }
        }
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingSink {
        published: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
        fail: bool,
    }

    #[async_trait]
    impl ActuationSink for RecordingSink {
        async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<()> {
            if self.fail {
                return Err(crate::error::RouterError::Discovery(
                    "sink down".to_string(),
                ));
            }
            self.published
                .lock()
                .unwrap()
                .push((queue.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn metadata(batch: u64) -> ShardMetadata {
        let mut m = ShardMetadata::new();
        m.insert(BATCH_SIZE_KEY.to_string(), Value::from(batch));
        m
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_batch_flushes_exactly_once() {
        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink {
            published: Arc::clone(&published),
            fail: false,
        };
        let controller =
            ActuationController::new("cam-1", Box::new(sink), RouterMetrics::new());
        controller.reset_config(Some(&metadata(3))).await;

        controller.update(0, "cam-1_key0").await;
        controller.update(1, "cam-1_key1").await;
        assert!(published.lock().unwrap().is_empty());

        controller.update(2, "cam-1_key2").await;
        wait_for(|| published.lock().unwrap().len() == 1).await;

        let (queue, payload) = published.lock().unwrap()[0].clone();
        assert_eq!(queue, "cam-1__act_queue");
        let packet: ActuationPacket = serde_json::from_slice(&payload).unwrap();
        assert_eq!(packet.source_id, "cam-1");
        assert_eq!(packet.actuation_seq, 0);
        assert_eq!(packet.seq, vec![0, 1, 2]);
        assert_eq!(
            packet.keys,
            vec!["cam-1_key0", "cam-1_key1", "cam-1_key2"]
        );
        assert_eq!(packet.ts.len(), 3);

        // next batch carries the incremented actuation sequence
        for i in 3..6 {
            controller.update(i, "k").await;
        }
        wait_for(|| published.lock().unwrap().len() == 2).await;
        let packet: ActuationPacket =
            serde_json::from_slice(&published.lock().unwrap()[1].1).unwrap();
        assert_eq!(packet.actuation_seq, 1);
    }

    #[tokio::test]
    async fn test_disabled_controller_ignores_updates() {
        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink {
            published: Arc::clone(&published),
            fail: false,
        };
        let controller =
            ActuationController::new("cam-2", Box::new(sink), RouterMetrics::new());
        controller.reset_config(Some(&metadata(2))).await;
        controller.update(0, "a").await;

        // reset with no metadata disables actuation and clears the batch
        controller.reset_config(None).await;
        for i in 0..10 {
            controller.update(i, "b").await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_drops_packet() {
        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink {
            published: Arc::clone(&published),
            fail: true,
        };
        let metrics = RouterMetrics::new();
        let controller =
            ActuationController::new("cam-3", Box::new(sink), Arc::clone(&metrics));
        controller.reset_config(Some(&metadata(1))).await;
        controller.update(0, "a").await;

        wait_for(|| metrics.snapshot().actuation_packets_dropped == 1).await;
        assert!(published.lock().unwrap().is_empty());
        assert_eq!(metrics.snapshot().actuation_batches_published, 0);
    }

    #[tokio::test]
    async fn test_metadata_without_batch_size_disables() {
        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink {
            published: Arc::clone(&published),
            fail: false,
        };
        let controller =
            ActuationController::new("cam-4", Box::new(sink), RouterMetrics::new());

        let mut meta = ShardMetadata::new();
        meta.insert("fps".to_string(), Value::from(25));
        controller.reset_config(Some(&meta)).await;
        controller.update(0, "a").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(published.lock().unwrap().is_empty());
    }
}
