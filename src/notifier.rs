//! Failure notification handling
//!
//! The [`UpdateRequester`] drains the writers' notification channel. Failed
//! writes are persisted when failure persistence is on, counted per shard,
//! and after the configured number of consecutive failures a one-shot
//! re-assignment request goes to the central routing service. Every event is
//! forwarded to the optional user callback.

use crate::discovery::RoutingServiceClient;
use crate::error::fatal;
use crate::metrics::{incr, RouterMetrics};
use crate::persistence::FailureLog;
use crate::writer::{WriteEvent, WriteNotification};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// User-supplied observer for write outcomes
pub type NotificationCallback = Arc<dyn Fn(&WriteNotification) + Send + Sync>;

pub struct UpdateRequester {
    source_id: String,
    routing_service: Option<RoutingServiceClient>,
    request_updates: bool,
    min_backlog_writes: usize,
    backlog: HashMap<String, usize>,
    persist_failures: bool,
    data_dir: PathBuf,
    failure_log: Option<FailureLog>,
    callback: Option<NotificationCallback>,
    metrics: Arc<RouterMetrics>,
}

impl UpdateRequester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: &str,
        routing_service: Option<RoutingServiceClient>,
        request_updates: bool,
        min_backlog_writes: usize,
        persist_failures: bool,
        data_dir: PathBuf,
        callback: Option<NotificationCallback>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            routing_service,
            request_updates,
            min_backlog_writes,
            backlog: HashMap::new(),
            persist_failures,
            data_dir,
            failure_log: None,
            callback,
            metrics,
        }
    }

    /// Spawn the consumer task for the writers' notification channel
    pub fn spawn(mut self, mut rx: mpsc::UnboundedReceiver<WriteNotification>) {
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                self.on_notification(&notification).await;
            }
        });
    }

    pub async fn on_notification(&mut self, notification: &WriteNotification) {
        match notification.event {
            WriteEvent::Failed => self.on_failure(notification).await,
            WriteEvent::Success => {
                tracing::debug!(
                    "write with key {} completed at {} on {}",
                    notification.key,
                    notification.timestamp,
                    notification.node_tag
                );
            }
        }

        if let Some(callback) = &self.callback {
            callback(notification);
        }
    }

    async fn on_failure(&mut self, notification: &WriteNotification) {
        tracing::info!("handling failed write for key {}", notification.key);

        if self.persist_failures {
            self.persist(notification).await;
        }

        if !self.request_updates {
            return;
        }

        let count = self
            .backlog
            .entry(notification.node_tag.clone())
            .or_insert(0);
        *count += 1;

        if *count >= self.min_backlog_writes {
            *count = 0;
            // the counter resets whether or not the request lands
            if let Some(service) = &self.routing_service {
                match service
                    .request_reassignment(&self.source_id, &notification.node_tag)
                    .await
                {
                    Ok(()) => tracing::info!(
                        "requested re-assignment of {} for {}",
                        notification.node_tag,
                        self.source_id
                    ),
                    Err(e) => tracing::error!("re-assignment request failed: {}", e),
                }
            }
        }
    }

    async fn persist(&mut self, notification: &WriteNotification) {
        if self.failure_log.is_none() {
            match FailureLog::open(&self.data_dir, &self.source_id).await {
                Ok(log) => self.failure_log = Some(log),
                Err(e) => fatal(&format!(
                    "persistence enabled but the failure log cannot be opened: {}",
                    e
                )),
            }
        }

        let log = self.failure_log.as_mut().unwrap();
        if let Err(e) = log
            .append(
                &notification.node_tag,
                &notification.key,
                notification.op,
                &notification.data,
            )
            .await
        {
            // losing the write here would be silent data loss
            fatal(&format!("failed to persist write to disk: {}", e));
        }
        incr(&self.metrics.persistence.records_persisted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WriteOp;
    use crate::persistence::FailureLog;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    fn failed(key: &str, node_tag: &str) -> WriteNotification {
        WriteNotification {
            key: key.to_string(),
            timestamp: Utc::now(),
            event: WriteEvent::Failed,
            node_tag: node_tag.to_string(),
            error: Some("connection refused".to_string()),
            op: WriteOp::Set,
            data: b"payload".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_failed_writes_are_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut requester = UpdateRequester::new(
            "cam-1",
            None,
            false,
            10,
            true,
            tmp.path().to_path_buf(),
            None,
            RouterMetrics::new(),
        );

        requester.on_notification(&failed("k0", "framedb-0")).await;
        requester.on_notification(&failed("k1", "framedb-0")).await;
        drop(requester);

        let records = FailureLog::read_and_consume(tmp.path(), "cam-1", "framedb-0")
            .await
            .unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1"]);
    }

    #[tokio::test]
    async fn test_callback_sees_every_event() {
        let tmp = tempfile::tempdir().unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: NotificationCallback = Arc::new(move |n: &WriteNotification| {
            seen_clone.lock().unwrap().push((n.key.clone(), n.event));
        });

        let mut requester = UpdateRequester::new(
            "cam-1",
            None,
            false,
            10,
            false,
            tmp.path().to_path_buf(),
            Some(callback),
            RouterMetrics::new(),
        );

        requester.on_notification(&failed("k0", "framedb-0")).await;
        let mut success = failed("k1", "framedb-0");
        success.event = WriteEvent::Success;
        success.error = None;
        requester.on_notification(&success).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("k0".to_string(), WriteEvent::Failed));
        assert_eq!(seen[1], ("k1".to_string(), WriteEvent::Success));
    }
}
