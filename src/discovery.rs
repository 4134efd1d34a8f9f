//! Routing service client
//!
//! Two RPCs against the central routing service: the initial source→shard
//! mapping fetch and the re-assignment request fired after repeated write
//! failures. Also resolves the control-channel master through a sentinel
//! when the deployment fronts the bus with one.

use crate::backend::Endpoint;
use crate::error::{Result, RouterError};
use crate::router::table::ShardDescriptor;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct MappingResponse {
    success: bool,
    result: Option<MappingResult>,
}

#[derive(Debug, Deserialize)]
struct MappingResult {
    #[serde(rename = "framedbNodes")]
    framedb_nodes: Vec<ShardDescriptor>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    success: bool,
}

/// HTTP client for the central routing service
#[derive(Debug, Clone)]
pub struct RoutingServiceClient {
    client: reqwest::Client,
    base_uri: String,
    mapping_api: String,
    update_api: String,
}

impl RoutingServiceClient {
    pub fn new(base_uri: &str, mapping_api: &str, update_api: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_uri: base_uri.trim_end_matches('/').to_string(),
            mapping_api: mapping_api.to_string(),
            update_api: update_api.to_string(),
        }
    }

    /// Fetch the source's shard mapping
    pub async fn fetch_mapping(&self, source_id: &str) -> Result<Vec<ShardDescriptor>> {
        let uri = format!("{}{}", self.base_uri, self.mapping_api);
        let response = self
            .client
            .post(&uri)
            .json(&serde_json::json!({ "sourceId": source_id }))
            .send()
            .await?;

        let body: MappingResponse = response.json().await?;
        if !body.success {
            return Err(RouterError::Discovery(format!(
                "mapping request failed, maybe {} does not exist",
                source_id
            )));
        }

        body.result
            .map(|r| r.framedb_nodes)
            .ok_or_else(|| RouterError::Discovery("mapping response missing result".to_string()))
    }

    /// Ask the routing service to re-assign one shard for this source.
    /// Fire-and-forget from the router's perspective: the caller only logs
    /// a failure.
    pub async fn request_reassignment(&self, source_id: &str, node_tag: &str) -> Result<()> {
        let uri = format!("{}{}", self.base_uri, self.update_api);
        let response = self
            .client
            .post(&uri)
            .json(&serde_json::json!({ "sourceId": source_id, "nodeTag": node_tag }))
            .send()
            .await?;

        let body: UpdateResponse = response.json().await?;
        if !body.success {
            return Err(RouterError::Discovery(
                "re-assignment request rejected".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the current master behind a sentinel endpoint
pub async fn resolve_sentinel_master(
    sentinel: &Endpoint,
    master_name: &str,
) -> Result<(String, u16)> {
    let client = redis::Client::open(sentinel.url())?;
    let mut connection = client.get_multiplexed_async_connection().await?;

    let (host, port): (String, String) = redis::cmd("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(master_name)
        .query_async(&mut connection)
        .await?;

    let port = port
        .parse::<u16>()
        .map_err(|_| RouterError::Discovery(format!("sentinel returned bad port {}", port)))?;
    Ok((host, port))
}
