//! Backpressure log
//!
//! Semantically identical to the failure log but activated deliberately:
//! an operator or policy diverts a shard (or the whole source) here to shed
//! load, and disabling backpressure replays the records in append order.

use crate::backend::WriteOp;
use crate::error::Result;
use crate::persistence::disk::{DiskLog, StoredWrite};
use std::path::Path;

const SUFFIX: &str = "-bp";

/// Shard tag used when the whole source is diverted
pub const SOURCE_WIDE_TAG: &str = "source_all";

fn store_name(source_id: &str) -> String {
    format!("{}{}", source_id, SUFFIX)
}

/// Append handle for one source's deliberately-diverted writes
pub struct BackpressureLog {
    inner: DiskLog,
}

impl BackpressureLog {
    pub async fn open(base: &Path, source_id: &str) -> Result<Self> {
        let inner = DiskLog::open(base, &store_name(source_id)).await?;
        Ok(Self { inner })
    }

    pub async fn append(&mut self, shard: &str, key: &str, op: WriteOp, data: &[u8]) -> Result<()> {
        tracing::info!(
            key = key,
            shard = shard,
            op = %op,
            "backpressure enabled, writing data to disk"
        );
        self.inner.append(shard, key, op, data).await
    }

    /// Drain every diverted record for `(source, shard)`, oldest first
    pub async fn read_and_consume(
        base: &Path,
        source_id: &str,
        shard: &str,
    ) -> Result<Vec<StoredWrite>> {
        DiskLog::read_and_consume(base, &store_name(source_id), shard).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
