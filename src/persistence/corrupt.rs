//! Corrupt-frame log
//!
//! Frames rejected by the validator are parked here for offline inspection.
//! Same layout as the other stores, but records carry no write op.

use crate::error::{Result, RouterError};
use crate::persistence::disk::{append_frame, read_frames};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

const SUFFIX: &str = "-corrupt";
const FILE_NAME: &str = "frames.log";

#[derive(Debug, Serialize, Deserialize)]
struct CorruptRecord {
    seq: u64,
    key: String,
    data: Vec<u8>,
}

fn store_dir(base: &Path, source_id: &str) -> PathBuf {
    base.join(format!("{}{}", source_id, SUFFIX))
}

/// Append handle for one source's rejected frames
pub struct CorruptFrameLog {
    path: PathBuf,
    file: Option<File>,
    next_seq: u64,
}

impl CorruptFrameLog {
    pub async fn open(base: &Path, source_id: &str) -> Result<Self> {
        let dir = store_dir(base, source_id);
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            path: dir.join(FILE_NAME),
            file: None,
            next_seq: 0,
        })
    }

    pub async fn append(&mut self, key: &str, data: &[u8]) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| RouterError::Configuration("corrupt log not open".to_string()))?;

        let record = CorruptRecord {
            seq: self.next_seq,
            key: key.to_string(),
            data: data.to_vec(),
        };
        append_frame(file, &record).await?;
        self.next_seq += 1;
        Ok(())
    }

    /// Drain every rejected frame for the source, oldest first
    pub async fn read_and_consume(base: &Path, source_id: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let path = store_dir(base, source_id).join(FILE_NAME);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let records: Vec<CorruptRecord> = read_frames(&path).await?;
        fs::remove_file(&path).await?;
        Ok(records.into_iter().map(|r| (r.key, r.data)).collect())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_corrupt_frames_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = CorruptFrameLog::open(tmp.path(), "cam-3").await.unwrap();
        log.append("0__frame", b"bad").await.unwrap();
        log.append("1__frame", b"worse").await.unwrap();
        log.close().await.unwrap();

        let frames = CorruptFrameLog::read_and_consume(tmp.path(), "cam-3")
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, "0__frame");
        assert_eq!(frames[1].1, b"worse".to_vec());

        let frames = CorruptFrameLog::read_and_consume(tmp.path(), "cam-3")
            .await
            .unwrap();
        assert!(frames.is_empty());
    }
}
