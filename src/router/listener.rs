//! Control-channel subscriber
//!
//! A background task subscribed to `"{source}__{channel}"`. Messages are
//! applied strictly in delivery order; a processing error drops the message
//! and never exits the task. A broken subscription is re-established after
//! a short pause.

use crate::backend::Endpoint;
use crate::discovery::resolve_sentinel_master;
use crate::error::{fatal, Result};
use crate::router::RouterInner;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// One routing-table mutation command off the control channel
#[derive(Debug, Clone, Deserialize)]
pub struct ControlMessage {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

impl ControlMessage {
    pub fn new(command: &str, payload: Value) -> Self {
        Self {
            command: command.to_string(),
            payload,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `bp_on` / `bp_off` payload
#[derive(Debug, Deserialize)]
pub(crate) struct BpTarget {
    #[serde(rename = "nodeTag")]
    pub node_tag: String,
    #[serde(rename = "cluster_name", default)]
    pub cluster_name: Option<String>,
}

/// `meta_update` payload
#[derive(Debug, Deserialize)]
pub(crate) struct MetaUpdate {
    #[serde(rename = "nodeTag")]
    pub node_tag: String,
    #[serde(default)]
    pub metadata: crate::actuation::ShardMetadata,
}

pub(crate) fn spawn_listener(inner: &Arc<RouterInner>) -> tokio::task::JoinHandle<()> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move { run_listener(inner).await })
}

async fn run_listener(inner: Arc<RouterInner>) {
    let channel_config = &inner.config.control_channel;
    let channel = format!("{}__{}", inner.config.source_id, channel_config.channel);

    let mut endpoint = Endpoint::new(channel_config.host.clone(), channel_config.port)
        .with_auth(channel_config.password.clone(), channel_config.db);

    if let Some(master_name) = &channel_config.sentinel_master {
        tracing::info!("Sentinel info provided, discovering master for pub-sub");
        match resolve_sentinel_master(&endpoint, master_name).await {
            Ok((host, port)) => {
                endpoint.host = host;
                endpoint.port = port;
            }
            Err(e) => fatal(&format!(
                "no master found for {}:{}: {}",
                channel_config.host, channel_config.port, e
            )),
        }
    }

    loop {
        if let Err(e) = subscribe_and_listen(&inner, &endpoint, &channel).await {
            tracing::error!("control channel subscription failed: {}", e);
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn subscribe_and_listen(
    inner: &Arc<RouterInner>,
    endpoint: &Endpoint,
    channel: &str,
) -> Result<()> {
    let client = redis::Client::open(endpoint.url())?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!("Started routing table update channel on {}", channel);

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        if message.get_channel_name() != channel {
            continue;
        }

        let payload: Vec<u8> = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("unreadable control message payload: {}", e);
                continue;
            }
        };

        // wrapped per message: a bad message is dropped, the listener lives
        match ControlMessage::parse(&payload) {
            Ok(control) => inner.apply_control_message(control).await,
            Err(e) => tracing::error!("malformed control message: {}", e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_parse() {
        let raw = br#"{"command": "remove", "payload": ["framedb-0"]}"#;
        let message = ControlMessage::parse(raw).unwrap();
        assert_eq!(message.command, "remove");
        assert_eq!(message.payload, serde_json::json!(["framedb-0"]));
    }

    #[test]
    fn test_control_message_without_payload() {
        let raw = br#"{"command": "bp_source_on"}"#;
        let message = ControlMessage::parse(raw).unwrap();
        assert_eq!(message.command, "bp_source_on");
        assert!(message.payload.is_null());
    }

    #[test]
    fn test_bp_target_cluster_optional() {
        let target: BpTarget =
            serde_json::from_str(r#"{"nodeTag": "framedb-1"}"#).unwrap();
        assert_eq!(target.node_tag, "framedb-1");
        assert!(target.cluster_name.is_none());

        let target: BpTarget = serde_json::from_str(
            r#"{"nodeTag": "framedb-1", "cluster_name": "cluster-b"}"#,
        )
        .unwrap();
        assert_eq!(target.cluster_name.as_deref(), Some("cluster-b"));
    }
}
