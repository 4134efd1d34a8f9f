//! Append-only disk log with per-shard files and consume-on-read replay

use crate::backend::WriteOp;
use crate::error::{Result, RouterError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// One persisted write, in original append order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWrite {
    pub key: String,
    pub op: WriteOp,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    seq: u64,
    key: String,
    op: WriteOp,
    data: Vec<u8>,
}

struct ShardFile {
    file: File,
    next_seq: u64,
}

/// Handle to one `(source, purpose)` store
///
/// Not shared across writers: each shard writer owns the handle for its own
/// store directory.
pub struct DiskLog {
    dir: PathBuf,
    files: HashMap<String, ShardFile>,
    closed: bool,
}

impl DiskLog {
    /// Open (creating if missing) the store directory `base/name`
    pub async fn open(base: &Path, name: &str) -> Result<Self> {
        let dir = base.join(name);
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            files: HashMap::new(),
            closed: false,
        })
    }

    /// Append one record under the shard's file; sequence is monotonic per
    /// shard for the lifetime of this handle
    pub async fn append(&mut self, shard: &str, key: &str, op: WriteOp, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RouterError::Configuration(
                "append on a closed disk log".to_string(),
            ));
        }

        if !self.files.contains_key(shard) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(shard_path(&self.dir, shard))
                .await?;
            self.files
                .insert(shard.to_string(), ShardFile { file, next_seq: 0 });
        }
        let entry = self.files.get_mut(shard).unwrap();

        let record = LogRecord {
            seq: entry.next_seq,
            key: key.to_string(),
            op,
            data: data.to_vec(),
        };
        append_frame(&mut entry.file, &record).await?;
        entry.next_seq += 1;
        Ok(())
    }

    /// Read every record for `(name, shard)` in append order, consuming the
    /// underlying file. A crash between the read and downstream replay
    /// re-delivers the whole file: replay is at-least-once.
    pub async fn read_and_consume(
        base: &Path,
        name: &str,
        shard: &str,
    ) -> Result<Vec<StoredWrite>> {
        let path = shard_path(&base.join(name), shard);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let records: Vec<LogRecord> = read_frames(&path).await?;
        fs::remove_file(&path).await?;

        Ok(records
            .into_iter()
            .map(|r| StoredWrite {
                key: r.key,
                op: r.op,
                data: r.data,
            })
            .collect())
    }

    /// Flush and release all shard files; safe to call more than once
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for (_, shard_file) in self.files.iter_mut() {
            shard_file.file.flush().await?;
            shard_file.file.sync_all().await?;
        }
        self.files.clear();
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn shard_path(dir: &Path, shard: &str) -> PathBuf {
    dir.join(format!("{}.log", shard))
}

/// Write one length-prefixed bincode frame and flush it to disk
pub(crate) async fn append_frame<T: Serialize>(file: &mut File, record: &T) -> Result<()> {
    let encoded = bincode::serialize(record)?;
    file.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
    file.write_all(&encoded).await?;
    file.flush().await?;
    Ok(())
}

/// Decode every complete frame in the file, tolerating a truncated tail
/// (a crash mid-append leaves one partial frame, which is dropped)
pub(crate) async fn read_frames<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let bytes = fs::read(path).await?;
    let mut records = Vec::new();
    let mut rest = &bytes[..];

    loop {
        if rest.len() < 4 {
            if !rest.is_empty() {
                tracing::warn!("truncated frame header in {}, dropping tail", path.display());
            }
            break;
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            tracing::warn!("truncated frame body in {}, dropping tail", path.display());
            break;
        }
        let record: T = bincode::deserialize(&rest[4..4 + len])?;
        records.push(record);
        rest = &rest[4 + len..];
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_consume_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = DiskLog::open(tmp.path(), "src-1-failure").await.unwrap();

        for i in 0..5 {
            log.append("framedb-0", &format!("k{}", i), WriteOp::Set, b"payload")
                .await
                .unwrap();
        }
        log.append("framedb-1", "other", WriteOp::Lpush, b"x")
            .await
            .unwrap();
        log.close().await.unwrap();

        let records = DiskLog::read_and_consume(tmp.path(), "src-1-failure", "framedb-0")
            .await
            .unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.key, format!("k{}", i));
            assert_eq!(record.op, WriteOp::Set);
        }

        // consumed: a second read finds nothing
        let records = DiskLog::read_and_consume(tmp.path(), "src-1-failure", "framedb-0")
            .await
            .unwrap();
        assert!(records.is_empty());

        // the other shard's file is untouched
        let records = DiskLog::read_and_consume(tmp.path(), "src-1-failure", "framedb-1")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, WriteOp::Lpush);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = DiskLog::open(tmp.path(), "src-1-bp").await.unwrap();
        log.append("framedb-0", "k", WriteOp::Set, b"v").await.unwrap();

        log.close().await.unwrap();
        log.close().await.unwrap();
        assert!(log.is_closed());

        let err = log.append("framedb-0", "k2", WriteOp::Set, b"v").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_truncated_tail_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = DiskLog::open(tmp.path(), "src-1-failure").await.unwrap();
        log.append("framedb-0", "whole", WriteOp::Set, b"v").await.unwrap();
        log.close().await.unwrap();

        // simulate a crash mid-append
        let path = tmp.path().join("src-1-failure").join("framedb-0.log");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 200, 1, 2, 3]);
        std::fs::write(&path, bytes).unwrap();

        let records = DiskLog::read_and_consume(tmp.path(), "src-1-failure", "framedb-0")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "whole");
    }
}
