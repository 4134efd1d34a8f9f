//! The routing controller
//!
//! Owns the routing table for one source, keeps it live through the
//! control channel, and exposes the producer-facing write entry points.
//! Producer calls never raise for backend-level failures: writes are
//! buffered, queued, retried or diverted to disk, but always accepted.

pub mod listener;
pub mod table;

use crate::actuation::{
    ActuationController, ActuationSink, RedisActuationSink, ShardMetadata,
};
use crate::backend::{BackendConnector, Endpoint, RedisConnector, WriteOp};
use crate::config::RouterConfig;
use crate::error::{fatal, Result, RouterError};
use crate::metrics::{incr, RouterMetrics};
use crate::notifier::{NotificationCallback, UpdateRequester};
use crate::persistence::{BackpressureLog, SOURCE_WIDE_TAG};
use crate::writer::{
    AsyncShardWriter, DirectShardWriter, ShardWriter, WriteNotification, WriterSettings,
};
use listener::{BpTarget, ControlMessage, MetaUpdate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use table::{RoutingTable, ShardDescriptor, ShardEntry, ShardView};
use tokio::sync::{mpsc, Mutex, RwLock};

/// Per-shard fan-out payload for [`Router::mapped_put`]
pub type MappedWrites = HashMap<String, HashMap<String, Vec<u8>>>;

enum BufferedWrite {
    Broadcast { key: String, data: Vec<u8> },
    Mapped(MappedWrites),
}

pub(crate) struct RouterInner {
    pub(crate) config: RouterConfig,
    connector: Arc<dyn BackendConnector>,
    table: RwLock<RoutingTable>,
    /// Source-wide recovery mode: every write goes to the backpressure log
    recovering: AtomicBool,
    /// Set while the source-wide backpressure log replays; puts buffer
    /// locally until the replay finishes
    temp_wait: AtomicBool,
    source_bp_log: Mutex<Option<BackpressureLog>>,
    local_buffer: Mutex<Vec<BufferedWrite>>,
    actuation: ActuationController,
    notifications: mpsc::UnboundedSender<WriteNotification>,
    listener: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    metrics: Arc<RouterMetrics>,
}

/// Routing controller for one source
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Connect with the production Redis backend and actuation sink
    pub async fn connect(config: RouterConfig) -> Result<Self> {
        Self::with_components(config, Arc::new(RedisConnector), None, None).await
    }

    /// Connect with injected components; tests and embedders use this to
    /// swap the backend connector, the actuation sink, or to observe write
    /// outcomes
    pub async fn with_components(
        config: RouterConfig,
        connector: Arc<dyn BackendConnector>,
        sink: Option<Box<dyn ActuationSink>>,
        callback: Option<NotificationCallback>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| RouterError::Configuration(errors.join("; ")))?;
        crate::log::log_startup(&config);

        let metrics = RouterMetrics::new();
        let (notifications, notification_rx) = mpsc::unbounded_channel();

        let routing_client = if config.routing_service.uri.is_empty() {
            None
        } else {
            Some(crate::discovery::RoutingServiceClient::new(
                &config.routing_service.uri,
                &config.routing_service.mapping_api,
                &config.routing_service.update_api,
            ))
        };

        UpdateRequester::new(
            &config.source_id,
            routing_client.clone(),
            config.reliability.enable_update_requests,
            config.reliability.min_backlog_writes,
            config.persistence.persist_failures,
            config.persistence.data_dir.clone(),
            callback,
            Arc::clone(&metrics),
        )
        .spawn(notification_rx);

        let sink = sink.unwrap_or_else(|| {
            Box::new(RedisActuationSink::new(
                Endpoint::new(config.actuation.host.clone(), config.actuation.port)
                    .with_auth(config.actuation.password.clone(), config.actuation.db),
            ))
        });
        let actuation =
            ActuationController::new(&config.source_id, sink, Arc::clone(&metrics));

        let inner = Arc::new(RouterInner {
            config,
            connector,
            table: RwLock::new(RoutingTable::new()),
            recovering: AtomicBool::new(false),
            temp_wait: AtomicBool::new(false),
            source_bp_log: Mutex::new(None),
            local_buffer: Mutex::new(Vec::new()),
            actuation,
            notifications,
            listener: StdMutex::new(None),
            metrics,
        });

        if let Some(client) = &routing_client {
            match client.fetch_mapping(&inner.config.source_id).await {
                Ok(descriptors) => inner.upsert_shards(descriptors).await,
                Err(e) => tracing::error!(
                    "Failed to get initial routing table, so it will be empty: {}",
                    e
                ),
            }
        }
        inner.refresh_actuation().await;

        if inner.config.control_channel.enabled {
            let handle = listener::spawn_listener(&inner);
            *inner.listener.lock().unwrap() = Some(handle);
        }

        Ok(Self { inner })
    }

    pub fn source_id(&self) -> &str {
        &self.inner.config.source_id
    }

    /// Broadcast one write to every routed shard. With an empty table or a
    /// replay in flight the write lands in the local buffer and is flushed,
    /// oldest first, by the next call that finds the table populated.
    pub async fn put(&self, key: &str, data: &[u8], op: WriteOp) -> Result<()> {
        let inner = &self.inner;
        let table_empty = inner.table.read().await.is_empty();

        if table_empty || inner.temp_wait.load(Ordering::SeqCst) {
            let mut buffer = inner.local_buffer.lock().await;
            buffer.push(BufferedWrite::Broadcast {
                key: key.to_string(),
                data: data.to_vec(),
            });
            incr(&inner.metrics.writes.buffered_local);
            tracing::warn!(
                "No destinations found in the routing table, saving in local buffer queue - length {}",
                buffer.len()
            );
            return Ok(());
        }

        inner.drain_local_buffer(op).await?;

        if inner.recovering.load(Ordering::SeqCst) {
            inner.append_source_backpressure(key, data, op).await;
        } else {
            inner.broadcast_write(key, data, op).await;
        }

        if inner.config.reliability.enable_health_check {
            inner.respawn_listener_if_dead();
        }
        Ok(())
    }

    /// Write to explicitly-addressed shards. Unknown shard tags are an
    /// invalid-argument error, never a silent skip.
    pub async fn mapped_put(&self, writes: MappedWrites, op: WriteOp) -> Result<()> {
        let inner = &self.inner;
        let table_empty = inner.table.read().await.is_empty();

        if table_empty {
            let mut buffer = inner.local_buffer.lock().await;
            buffer.push(BufferedWrite::Mapped(writes));
            incr(&inner.metrics.writes.buffered_local);
            tracing::warn!(
                "No destinations found in the routing table, saving in local buffer queue - length {}",
                buffer.len()
            );
            return Ok(());
        }

        inner.drain_local_buffer(op).await?;
        inner.write_mapped(&writes, op).await
    }

    /// Snapshot of the routing table; a copy, never a live reference
    pub async fn routing_table(&self) -> HashMap<String, ShardView> {
        self.inner.table.read().await.view()
    }

    /// First non-empty shard metadata in table insertion order
    pub async fn metadata(&self) -> Option<ShardMetadata> {
        self.inner.table.read().await.first_metadata()
    }

    /// The actuation controller for this source; producers drive
    /// `update(seq, key_prefix)` from their write loop
    pub fn actuation(&self) -> &ActuationController {
        &self.inner.actuation
    }

    pub fn metrics(&self) -> Arc<RouterMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Apply one control-channel command. The subscriber task funnels
    /// through here; embedders running their own bus can call it directly.
    pub async fn apply_control_message(&self, message: ControlMessage) {
        self.inner.apply_control_message(message).await;
    }
}

impl RouterInner {
    async fn make_writer(&self, descriptor: &ShardDescriptor) -> ShardWriter {
        let endpoint = descriptor.endpoint(&self.config.backend);
        let settings = WriterSettings {
            source_id: self.config.source_id.clone(),
            node_tag: descriptor.node_tag.clone(),
            data_dir: self.config.persistence.data_dir.clone(),
            persist_failures: self.config.persistence.persist_failures,
            buffer_retries: self.config.reliability.enable_local_buffering,
            health_check: self.config.reliability.enable_health_check,
        };

        if self.config.asynchronous {
            ShardWriter::Queued(
                AsyncShardWriter::start(
                    endpoint,
                    settings,
                    Arc::clone(&self.connector),
                    self.notifications.clone(),
                    Arc::clone(&self.metrics),
                )
                .await,
            )
        } else {
            ShardWriter::Direct(DirectShardWriter::new(
                endpoint,
                settings,
                Arc::clone(&self.connector),
                self.notifications.clone(),
                Arc::clone(&self.metrics),
            ))
        }
    }

    /// Add or update table entries. An existing tag keeps its writer (and
    /// with it the retry buffer and queued writes); only the connection is
    /// re-pointed and the descriptor replaced.
    async fn upsert_shards(&self, descriptors: Vec<ShardDescriptor>) {
        let mut table = self.table.write().await;
        for mut descriptor in descriptors {
            descriptor.backpressure_enabled = false;
            let endpoint = descriptor.endpoint(&self.config.backend);

            if let Some(entry) = table.get_mut(&descriptor.node_tag) {
                entry.writer.update_connection(endpoint).await;
                entry.descriptor = descriptor;
                tracing::info!("Updated routing table entry with existing writer");
            } else {
                let writer = self.make_writer(&descriptor).await;
                tracing::info!("Created writer for {}", descriptor.node_tag);
                table.insert(ShardEntry { descriptor, writer });
            }
        }
    }

    pub(crate) async fn apply_control_message(self: &Arc<Self>, message: ControlMessage) {
        let command = message.command.as_str();
        match command {
            "add" | "update" => {
                match serde_json::from_value::<Vec<ShardDescriptor>>(message.payload) {
                    Ok(descriptors) => {
                        self.upsert_shards(descriptors).await;
                        incr(&self.metrics.control.messages_applied);
                    }
                    Err(e) => {
                        tracing::error!("malformed {} payload: {}", command, e);
                        incr(&self.metrics.control.messages_ignored);
                    }
                }
            }
            "remove" => match serde_json::from_value::<Vec<String>>(message.payload) {
                Ok(node_tags) => {
                    let mut table = self.table.write().await;
                    for node_tag in node_tags {
                        table.remove(&node_tag);
                    }
                    incr(&self.metrics.control.messages_applied);
                }
                Err(e) => {
                    tracing::error!("malformed remove payload: {}", e);
                    incr(&self.metrics.control.messages_ignored);
                }
            },
            "bp_on" => self.toggle_shard_backpressure(message.payload, true).await,
            "bp_off" => self.toggle_shard_backpressure(message.payload, false).await,
            "bp_source_on" => {
                if !self.recovering.load(Ordering::SeqCst) {
                    self.enter_recovery().await;
                }
                incr(&self.metrics.control.messages_applied);
                tracing::info!(
                    "Turned on back pressure for source={}",
                    self.config.source_id
                );
            }
            "bp_source_off" => {
                if self.recovering.load(Ordering::SeqCst) {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.replay_source_backpressure().await });
                }
                incr(&self.metrics.control.messages_applied);
                tracing::info!(
                    "Turned off back pressure for source={}",
                    self.config.source_id
                );
            }
            "meta_update" => match serde_json::from_value::<MetaUpdate>(message.payload) {
                Ok(update) => {
                    let mut table = self.table.write().await;
                    if let Some(entry) = table.get_mut(&update.node_tag) {
                        entry.descriptor.metadata = update.metadata;
                    }
                    incr(&self.metrics.control.messages_applied);
                }
                Err(e) => {
                    tracing::error!("malformed meta_update payload: {}", e);
                    incr(&self.metrics.control.messages_ignored);
                }
            },
            other => {
                tracing::warn!("Unknown command {} received", other);
                incr(&self.metrics.control.messages_ignored);
            }
        }

        // keep the actuation batch size in step with the table
        self.refresh_actuation().await;
    }

    /// Flip one shard's backpressure state. Acts only when the payload's
    /// cluster matches the entry's, so a stale command for a re-assigned
    /// shard is ignored.
    async fn toggle_shard_backpressure(&self, payload: serde_json::Value, enable: bool) {
        let target: BpTarget = match serde_json::from_value(payload) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!("malformed backpressure payload: {}", e);
                incr(&self.metrics.control.messages_ignored);
                return;
            }
        };

        let mut table = self.table.write().await;
        if let Some(entry) = table.get_mut(&target.node_tag) {
            let cluster_matches = target
                .cluster_name
                .as_deref()
                .map_or(true, |cluster| cluster == entry.descriptor.cluster_name);

            if cluster_matches && entry.descriptor.backpressure_enabled != enable {
                if enable {
                    entry.writer.enable_backpressure();
                } else {
                    entry.writer.disable_backpressure();
                }
                entry.descriptor.backpressure_enabled = enable;
            }
        }
        incr(&self.metrics.control.messages_applied);
    }

    async fn enter_recovery(&self) {
        self.recovering.store(true, Ordering::SeqCst);
        match BackpressureLog::open(&self.config.persistence.data_dir, &self.config.source_id)
            .await
        {
            Ok(log) => {
                *self.source_bp_log.lock().await = Some(log);
                tracing::info!(
                    "Back pressure enabled for source={}",
                    self.config.source_id
                );
            }
            Err(e) => fatal(&format!(
                "cannot open source backpressure log for {}: {}",
                self.config.source_id, e
            )),
        }
    }

    /// Detached replay of the source-wide backpressure log. New puts buffer
    /// locally while it runs and flush once it completes.
    async fn replay_source_backpressure(self: Arc<Self>) {
        tracing::info!("Restoring from back pressure db");
        self.recovering.store(false, Ordering::SeqCst);

        if let Some(mut log) = self.source_bp_log.lock().await.take() {
            if let Err(e) = log.close().await {
                tracing::error!("failed to close source backpressure log: {}", e);
            }
        }

        self.temp_wait.store(true, Ordering::SeqCst);

        let records = match BackpressureLog::read_and_consume(
            &self.config.persistence.data_dir,
            &self.config.source_id,
            SOURCE_WIDE_TAG,
        )
        .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("cannot replay source backpressure log: {}", e);
                self.temp_wait.store(false, Ordering::SeqCst);
                return;
            }
        };

        let count = records.len();
        for record in records {
            incr(&self.metrics.persistence.records_replayed);
            self.broadcast_write(&record.key, &record.data, record.op)
                .await;
        }

        self.temp_wait.store(false, Ordering::SeqCst);
        tracing::info!("Restored {} frames", count);
    }

    async fn append_source_backpressure(&self, key: &str, data: &[u8], op: WriteOp) {
        let mut guard = self.source_bp_log.lock().await;
        if guard.is_none() {
            match BackpressureLog::open(&self.config.persistence.data_dir, &self.config.source_id)
                .await
            {
                Ok(log) => *guard = Some(log),
                Err(e) => fatal(&format!("cannot open source backpressure log: {}", e)),
            }
        }

        if let Err(e) = guard
            .as_mut()
            .unwrap()
            .append(SOURCE_WIDE_TAG, key, op, data)
            .await
        {
            // dropping the write here would be silent loss
            fatal(&format!("failed to divert write to disk: {}", e));
        }
        incr(&self.metrics.persistence.records_persisted);
    }

    async fn broadcast_write(&self, key: &str, data: &[u8], op: WriteOp) {
        let table = self.table.read().await;
        for (_, entry) in table.iter() {
            entry.writer.submit(op, key, data).await;
        }
    }

    async fn write_mapped(&self, writes: &MappedWrites, op: WriteOp) -> Result<()> {
        let table = self.table.read().await;
        for (node_tag, shard_writes) in writes {
            let entry = table
                .get(node_tag)
                .ok_or_else(|| RouterError::UnknownShard(node_tag.clone()))?;
            for (key, data) in shard_writes {
                entry.writer.submit(op, key, data).await;
            }
        }
        Ok(())
    }

    /// Flush buffered writes, oldest first, before any new write proceeds
    async fn drain_local_buffer(&self, op: WriteOp) -> Result<()> {
        loop {
            let buffered = {
                let mut buffer = self.local_buffer.lock().await;
                if buffer.is_empty() {
                    return Ok(());
                }
                buffer.remove(0)
            };

            match buffered {
                BufferedWrite::Broadcast { key, data } => {
                    self.broadcast_write(&key, &data, op).await;
                }
                BufferedWrite::Mapped(writes) => {
                    self.write_mapped(&writes, op).await?;
                }
            }
        }
    }

    async fn refresh_actuation(&self) {
        let metadata = self.table.read().await.first_metadata();
        self.actuation.reset_config(metadata.as_ref()).await;
    }

    fn respawn_listener_if_dead(self: &Arc<Self>) {
        if !self.config.control_channel.enabled {
            return;
        }
        let mut guard = self.listener.lock().unwrap();
        if let Some(handle) = guard.as_ref() {
            if handle.is_finished() {
                *guard = Some(listener::spawn_listener(self));
                incr(&self.metrics.control.listener_respawns);
                tracing::info!("pub-sub updater has failed, and it is respawned");
            }
        }
    }
}
