//! Per-shard asynchronous writers
//!
//! One [`AsyncShardWriter`] is the unit of concurrency for one destination
//! shard: an unbounded command queue drained by a single worker task, a
//! local retry buffer replayed in order before any new write, and the
//! backpressure-log integration. Submission never blocks the producer and
//! per-shard FIFO order holds even across transient failures.
//!
//! The queue receiver, retry buffer and connection state live outside the
//! worker task, so a respawned worker resumes exactly where the dead one
//! stopped.

use crate::backend::{BackendConnector, Endpoint, ShardBackend, WriteOp};
use crate::error::{fatal, Result};
use crate::metrics::{incr, RouterMetrics};
use crate::persistence::{BackpressureLog, FailureLog};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

/// Outcome of one delivery attempt, surfaced on the notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEvent {
    Success,
    Failed,
}

/// One delivery outcome with enough context to persist or re-route
#[derive(Debug, Clone)]
pub struct WriteNotification {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub event: WriteEvent,
    pub node_tag: String,
    pub error: Option<String>,
    pub op: WriteOp,
    pub data: Vec<u8>,
}

/// One producer write, consumed exactly once by the work loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWrite {
    pub op: WriteOp,
    pub key: String,
    pub data: Vec<u8>,
}

enum WriterCommand {
    Write(QueuedWrite),
    UpdateConnection(Endpoint),
    EnableBackpressure,
    DisableBackpressure,
}

/// Per-writer behavior knobs, cut from the router configuration
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub source_id: String,
    pub node_tag: String,
    pub data_dir: PathBuf,
    pub persist_failures: bool,
    pub buffer_retries: bool,
    pub health_check: bool,
}

struct ConnState {
    backend: Option<Box<dyn ShardBackend>>,
    endpoint: Endpoint,
    bp_enabled: bool,
    bp_log: Option<BackpressureLog>,
}

struct WorkerShared {
    settings: WriterSettings,
    connector: Arc<dyn BackendConnector>,
    notifications: mpsc::UnboundedSender<WriteNotification>,
    metrics: Arc<RouterMetrics>,
    rx: Mutex<mpsc::UnboundedReceiver<WriterCommand>>,
    conn: Mutex<ConnState>,
    retry_buffer: Mutex<VecDeque<QueuedWrite>>,
}

/// Reliable writer for one shard
pub struct AsyncShardWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    shared: Arc<WorkerShared>,
    worker: StdMutex<tokio::task::JoinHandle<()>>,
}

impl AsyncShardWriter {
    /// Start the writer and its worker task. With failure persistence on,
    /// leftover records for this `(source, shard)` pair are loaded onto the
    /// queue before any new submission can land behind them.
    pub async fn start(
        endpoint: Endpoint,
        settings: WriterSettings,
        connector: Arc<dyn BackendConnector>,
        notifications: mpsc::UnboundedSender<WriteNotification>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        if settings.persist_failures {
            tracing::info!(
                "Searching for persisted left-over writes for {}",
                settings.node_tag
            );
            match FailureLog::read_and_consume(
                &settings.data_dir,
                &settings.source_id,
                &settings.node_tag,
            )
            .await
            {
                Ok(records) => {
                    let count = records.len();
                    for record in records {
                        let _ = tx.send(WriterCommand::Write(QueuedWrite {
                            op: record.op,
                            key: record.key,
                            data: record.data,
                        }));
                    }
                    incr_replayed(&metrics, count as u64);
                    tracing::info!("Restored {} failed writes from persistent db", count);
                }
                Err(e) => fatal(&format!(
                    "cannot restore persisted writes for {}: {}",
                    settings.node_tag, e
                )),
            }
        }

        let shared = Arc::new(WorkerShared {
            settings,
            connector,
            notifications,
            metrics,
            rx: Mutex::new(rx),
            conn: Mutex::new(ConnState {
                backend: None,
                endpoint,
                bp_enabled: false,
                bp_log: None,
            }),
            retry_buffer: Mutex::new(VecDeque::new()),
        });

        let worker = spawn_worker(Arc::clone(&shared));
        tracing::info!(
            "Created asynchronous writer for {}",
            shared.settings.node_tag
        );

        Self {
            tx,
            shared,
            worker: StdMutex::new(worker),
        }
    }

    pub fn node_tag(&self) -> &str {
        &self.shared.settings.node_tag
    }

    /// Enqueue one write; returns immediately
    pub fn submit(&self, op: WriteOp, key: &str, data: &[u8]) {
        incr(&self.shared.metrics.writes.submitted);
        let _ = self.tx.send(WriterCommand::Write(QueuedWrite {
            op,
            key: key.to_string(),
            data: data.to_vec(),
        }));

        if self.shared.settings.health_check {
            self.respawn_if_dead();
        }
    }

    /// Replace the backend endpoint; the worker applies the swap between
    /// writes, so no write observes a half-updated connection
    pub fn update_connection(&self, endpoint: Endpoint) {
        let _ = self.tx.send(WriterCommand::UpdateConnection(endpoint));
    }

    /// Divert subsequent writes for this shard to the backpressure log
    pub fn enable_backpressure(&self) {
        let _ = self.tx.send(WriterCommand::EnableBackpressure);
    }

    /// Resume live writes; logged writes replay first, in append order
    pub fn disable_backpressure(&self) {
        let _ = self.tx.send(WriterCommand::DisableBackpressure);
    }

    /// Number of writes parked in the retry buffer
    pub async fn retry_backlog(&self) -> usize {
        self.shared.retry_buffer.lock().await.len()
    }

    fn respawn_if_dead(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_finished() {
            *worker = spawn_worker(Arc::clone(&self.shared));
            tracing::info!(
                "work loop for {} was not alive, respawned",
                self.shared.settings.node_tag
            );
        }
    }
}

fn spawn_worker(shared: Arc<WorkerShared>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = shared.rx.lock().await;
        while let Some(command) = rx.recv().await {
            match command {
                WriterCommand::Write(write) => {
                    let mut conn = shared.conn.lock().await;
                    let mut buffer = shared.retry_buffer.lock().await;
                    process_one(&shared, &mut conn, &mut buffer, write).await;
                }
                WriterCommand::UpdateConnection(endpoint) => {
                    apply_connection_update(&shared, endpoint).await;
                }
                WriterCommand::EnableBackpressure => {
                    enable_backpressure(&shared).await;
                }
                WriterCommand::DisableBackpressure => {
                    disable_backpressure(&shared).await;
                }
            }
        }
    })
}

/// Deliver one write, replaying the retry buffer first. On failure the
/// write lands at the buffer tail, the failure is notified, and liveness is
/// probed; the buffer itself is never reordered.
async fn process_one(
    shared: &WorkerShared,
    conn: &mut ConnState,
    buffer: &mut VecDeque<QueuedWrite>,
    write: QueuedWrite,
) {
    match deliver(shared, conn, buffer, &write).await {
        Ok(()) => {}
        Err(e) => {
            let message = e.to_string();
            buffer.push_back(write.clone());
            incr(&shared.metrics.writes.failed);
            tracing::error!(
                "shard {} unreachable, saving key={} in local buffer (depth {})",
                shared.settings.node_tag,
                write.key,
                buffer.len()
            );
            notify(shared, &write, WriteEvent::Failed, Some(message));

            let alive = match conn.backend.as_mut() {
                Some(backend) => backend.ping().await,
                None => false,
            };
            if !alive {
                // persistent outage for this shard only; the producer is
                // never unblocked on it
                tracing::error!(
                    "shard {} at {} did not answer ping",
                    shared.settings.node_tag,
                    conn.endpoint
                );
            }
        }
    }
}

async fn deliver(
    shared: &WorkerShared,
    conn: &mut ConnState,
    buffer: &mut VecDeque<QueuedWrite>,
    write: &QueuedWrite,
) -> Result<()> {
    while shared.settings.buffer_retries && !buffer.is_empty() {
        let buffered = buffer.front().cloned().unwrap();
        attempt(shared, conn, &buffered).await?;
        buffer.pop_front();
        incr(&shared.metrics.writes.retried);
        incr(&shared.metrics.writes.succeeded);
        tracing::info!(
            buffer_depth = buffer.len(),
            key = %buffered.key,
            "replayed buffered write"
        );
        notify(shared, &buffered, WriteEvent::Success, None);
    }

    attempt(shared, conn, write).await?;
    incr(&shared.metrics.writes.succeeded);
    notify(shared, write, WriteEvent::Success, None);
    Ok(())
}

async fn attempt(shared: &WorkerShared, conn: &mut ConnState, write: &QueuedWrite) -> Result<()> {
    if conn.bp_enabled {
        let log = match conn.bp_log.as_mut() {
            Some(log) => log,
            None => fatal("backpressure enabled without an open log"),
        };
        log.append(
            &shared.settings.node_tag,
            &write.key,
            write.op,
            &write.data,
        )
        .await?;
        incr(&shared.metrics.persistence.records_persisted);
        return Ok(());
    }

    if conn.backend.is_none() {
        conn.backend = Some(shared.connector.connect(&conn.endpoint).await?);
    }
    conn.backend
        .as_mut()
        .unwrap()
        .execute(write.op, &write.key, &write.data)
        .await
}

async fn apply_connection_update(shared: &WorkerShared, endpoint: Endpoint) {
    let mut conn = shared.conn.lock().await;
    conn.endpoint = endpoint;
    match shared.connector.connect(&conn.endpoint).await {
        Ok(backend) => {
            conn.backend = Some(backend);
            tracing::info!(
                "updated connection for {} to {}",
                shared.settings.node_tag,
                conn.endpoint
            );
        }
        Err(e) => {
            // next write attempt reconnects and, failing that, buffers
            conn.backend = None;
            tracing::warn!(
                "connection update for {} failed, deferring to next write: {}",
                shared.settings.node_tag,
                e
            );
        }
    }
}

async fn enable_backpressure(shared: &WorkerShared) {
    let mut conn = shared.conn.lock().await;
    conn.bp_enabled = true;
    if conn.bp_log.is_none() {
        match BackpressureLog::open(&shared.settings.data_dir, &shared.settings.source_id).await {
            Ok(log) => conn.bp_log = Some(log),
            Err(e) => fatal(&format!(
                "cannot open backpressure log for {}: {}",
                shared.settings.source_id, e
            )),
        }
    }
    tracing::info!("backpressure enabled for shard {}", shared.settings.node_tag);
}

/// Replay everything parked for this shard before the next dequeue, so
/// replayed writes strictly precede any write submitted after the toggle
async fn disable_backpressure(shared: &WorkerShared) {
    let mut conn = shared.conn.lock().await;
    let mut buffer = shared.retry_buffer.lock().await;

    conn.bp_enabled = false;
    if let Some(mut log) = conn.bp_log.take() {
        if let Err(e) = log.close().await {
            tracing::error!("failed to close backpressure log: {}", e);
        }
    }

    let records = match BackpressureLog::read_and_consume(
        &shared.settings.data_dir,
        &shared.settings.source_id,
        &shared.settings.node_tag,
    )
    .await
    {
        Ok(records) => records,
        Err(e) => fatal(&format!(
            "cannot replay backpressure log for {}: {}",
            shared.settings.node_tag, e
        )),
    };

    let count = records.len();
    for record in records {
        incr(&shared.metrics.persistence.records_replayed);
        let write = QueuedWrite {
            op: record.op,
            key: record.key,
            data: record.data,
        };
        process_one(shared, &mut conn, &mut buffer, write).await;
    }
    tracing::info!(
        "restored {} writes from backpressure db for {}",
        count,
        shared.settings.node_tag
    );
}

fn notify(
    shared: &WorkerShared,
    write: &QueuedWrite,
    event: WriteEvent,
    error: Option<String>,
) {
    let _ = shared.notifications.send(WriteNotification {
        key: write.key.clone(),
        timestamp: Utc::now(),
        event,
        node_tag: shared.settings.node_tag.clone(),
        error,
        op: write.op,
        data: write.data.clone(),
    });
}

fn incr_replayed(metrics: &RouterMetrics, count: u64) {
    crate::metrics::incr_by(&metrics.persistence.records_replayed, count);
}

/// Synchronous-mode writer: direct backend calls, no queue and no retry
/// buffer. Failures are notified and ping-probed, then dropped.
pub struct DirectShardWriter {
    settings: WriterSettings,
    connector: Arc<dyn BackendConnector>,
    notifications: mpsc::UnboundedSender<WriteNotification>,
    metrics: Arc<RouterMetrics>,
    conn: Mutex<(Endpoint, Option<Box<dyn ShardBackend>>)>,
}

impl DirectShardWriter {
    pub fn new(
        endpoint: Endpoint,
        settings: WriterSettings,
        connector: Arc<dyn BackendConnector>,
        notifications: mpsc::UnboundedSender<WriteNotification>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            settings,
            connector,
            notifications,
            metrics,
            conn: Mutex::new((endpoint, None)),
        }
    }

    pub async fn submit(&self, op: WriteOp, key: &str, data: &[u8]) {
        incr(&self.metrics.writes.submitted);
        let write = QueuedWrite {
            op,
            key: key.to_string(),
            data: data.to_vec(),
        };

        let mut conn = self.conn.lock().await;
        let (endpoint, backend) = &mut *conn;
        let result = write_once(&*self.connector, endpoint, backend, op, key, data).await;

        match result {
            Ok(()) => {
                incr(&self.metrics.writes.succeeded);
                self.notify(&write, WriteEvent::Success, None);
            }
            Err(e) => {
                incr(&self.metrics.writes.failed);
                self.notify(&write, WriteEvent::Failed, Some(e.to_string()));
                let alive = match backend.as_mut() {
                    Some(backend) => backend.ping().await,
                    None => false,
                };
                if !alive {
                    tracing::error!(
                        "shard {} at {} did not answer ping",
                        self.settings.node_tag,
                        endpoint
                    );
                }
            }
        }
    }

    pub async fn update_connection(&self, endpoint: Endpoint) {
        let mut conn = self.conn.lock().await;
        conn.0 = endpoint;
        conn.1 = None;
    }

    fn notify(&self, write: &QueuedWrite, event: WriteEvent, error: Option<String>) {
        let _ = self.notifications.send(WriteNotification {
            key: write.key.clone(),
            timestamp: Utc::now(),
            event,
            node_tag: self.settings.node_tag.clone(),
            error,
            op: write.op,
            data: write.data.clone(),
        });
    }
}

async fn write_once(
    connector: &dyn BackendConnector,
    endpoint: &Endpoint,
    backend: &mut Option<Box<dyn ShardBackend>>,
    op: WriteOp,
    key: &str,
    data: &[u8],
) -> Result<()> {
    if backend.is_none() {
        *backend = Some(connector.connect(endpoint).await?);
    }
    backend.as_mut().unwrap().execute(op, key, data).await
}

/// Table-entry writer: queued in asynchronous mode, direct otherwise
pub enum ShardWriter {
    Queued(AsyncShardWriter),
    Direct(DirectShardWriter),
}

impl ShardWriter {
    pub async fn submit(&self, op: WriteOp, key: &str, data: &[u8]) {
        match self {
            ShardWriter::Queued(writer) => writer.submit(op, key, data),
            ShardWriter::Direct(writer) => writer.submit(op, key, data).await,
        }
    }

    pub async fn update_connection(&self, endpoint: Endpoint) {
        match self {
            ShardWriter::Queued(writer) => writer.update_connection(endpoint),
            ShardWriter::Direct(writer) => writer.update_connection(endpoint).await,
        }
    }

    pub fn enable_backpressure(&self) {
        match self {
            ShardWriter::Queued(writer) => writer.enable_backpressure(),
            ShardWriter::Direct(_) => {
                tracing::warn!("backpressure is not supported for direct writers");
            }
        }
    }

    pub fn disable_backpressure(&self) {
        match self {
            ShardWriter::Queued(writer) => writer.disable_backpressure(),
            ShardWriter::Direct(_) => {
                tracing::warn!("backpressure is not supported for direct writers");
            }
        }
    }
}
