//! Failure-persistence log
//!
//! Activated on delivery failure: writes that could not reach an unreachable
//! shard land here and are reloaded onto the shard writer's queue at the
//! next startup.

use crate::backend::WriteOp;
use crate::error::Result;
use crate::persistence::disk::{DiskLog, StoredWrite};
use std::path::Path;

const SUFFIX: &str = "-failure";

fn store_name(source_id: &str) -> String {
    format!("{}{}", source_id, SUFFIX)
}

/// Append handle for one source's failed writes, keyed by shard tag
pub struct FailureLog {
    inner: DiskLog,
}

impl FailureLog {
    pub async fn open(base: &Path, source_id: &str) -> Result<Self> {
        let inner = DiskLog::open(base, &store_name(source_id)).await?;
        Ok(Self { inner })
    }

    pub async fn append(&mut self, shard: &str, key: &str, op: WriteOp, data: &[u8]) -> Result<()> {
        self.inner.append(shard, key, op, data).await
    }

    /// Drain every leftover record for `(source, shard)`, oldest first
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
