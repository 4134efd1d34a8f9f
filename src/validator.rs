//! Frame validation
//!
//! Producers run incoming frames through a rule check before handing them
//! to the router. Rules come from a JSON file, from the router's live shard
//! metadata, or from a caller-supplied function; rejected frames can be
//! parked in the corrupt-frame log for offline inspection.

use crate::actuation::ShardMetadata;
use crate::error::{Result, RouterError};
use crate::persistence::CorruptFrameLog;
use std::path::Path;

/// Caller-supplied rule: `(rules, frame_caps) -> valid`
pub type RuleFn = Box<dyn Fn(&ShardMetadata, &ShardMetadata) -> bool + Send + Sync>;

/// Per-frame validator for one source
pub struct FrameValidator {
    source_id: String,
    rule_fn: Option<RuleFn>,
    custom_rules: Option<ShardMetadata>,
    corrupt_log: Option<CorruptFrameLog>,
    use_own_keys: bool,
    last_known_idx: u64,
}

impl FrameValidator {
    pub fn new(source_id: &str, rule_fn: Option<RuleFn>, use_own_keys: bool) -> Self {
        Self {
            source_id: source_id.to_string(),
            rule_fn,
            custom_rules: None,
            corrupt_log: None,
            use_own_keys,
            last_known_idx: 0,
        }
    }

    /// Load a fixed rule map from a JSON file; validation then ignores the
    /// router metadata passed per frame
    pub fn with_rules_file(mut self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|_| {
            RouterError::Configuration(format!("rules file {} not found", path.display()))
        })?;
        let rules: ShardMetadata = serde_json::from_str(&content)?;
        tracing::info!("Loaded rule file {}", path.display());
        self.custom_rules = Some(rules);
        Ok(self)
    }

    /// Persist rejected frames to the corrupt-frame log
    pub async fn with_corrupt_persistence(mut self, data_dir: &Path) -> Result<Self> {
        self.corrupt_log = Some(CorruptFrameLog::open(data_dir, &self.source_id).await?);
        Ok(self)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Check one frame's caps against the active rules. `live_metadata` is
    /// the router's current shard metadata, consulted when no rules file is
    /// loaded.
    pub async fn is_valid_frame(
        &mut self,
        key: Option<&str>,
        data: &[u8],
        live_metadata: Option<&ShardMetadata>,
        frame_caps: &ShardMetadata,
    ) -> bool {
        let empty = ShardMetadata::new();
        let rules = match (&self.custom_rules, live_metadata) {
            (Some(rules), _) => rules,
            (None, Some(metadata)) => metadata,
            (None, None) => &empty,
        };

        let valid = match &self.rule_fn {
            Some(rule_fn) => rule_fn(rules, frame_caps),
            None => rules_match(rules, frame_caps),
        };

        if valid {
            return true;
        }

        let own_key;
        let key = if self.use_own_keys {
            own_key = format!("{}__frame", self.last_known_idx);
            self.last_known_idx += 1;
            own_key.as_str()
        } else {
            key.unwrap_or("")
        };

        if let Some(log) = self.corrupt_log.as_mut() {
            if let Err(e) = log.append(key, data).await {
                tracing::error!("failed to persist corrupt frame: {}", e);
            }
        }
        tracing::info!("Invalid frame with key={} detected", key);
        false
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(log) = self.corrupt_log.as_mut() {
            log.close().await?;
        }
        Ok(())
    }
}

/// Every rule key must be present in the frame caps with an equal value
fn rules_match(rules: &ShardMetadata, frame_caps: &ShardMetadata) -> bool {
    rules
        .iter()
        .all(|(name, expected)| frame_caps.get(name) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps(width: u64, height: u64) -> ShardMetadata {
        let mut caps = ShardMetadata::new();
        caps.insert("width".to_string(), json!(width));
        caps.insert("height".to_string(), json!(height));
        caps
    }

    #[tokio::test]
    async fn test_rules_match_against_live_metadata() {
        let mut validator = FrameValidator::new("cam-1", None, false);
        let rules = caps(1920, 1080);

        assert!(
            validator
                .is_valid_frame(Some("k0"), b"frame", Some(&rules), &caps(1920, 1080))
                .await
        );
        assert!(
            !validator
                .is_valid_frame(Some("k1"), b"frame", Some(&rules), &caps(416, 416))
                .await
        );
    }

    #[tokio::test]
    async fn test_custom_rule_fn_wins() {
        let rule_fn: RuleFn = Box::new(|_rules, caps| caps.contains_key("width"));
        let mut validator = FrameValidator::new("cam-1", Some(rule_fn), false);

        assert!(
            validator
                .is_valid_frame(Some("k0"), b"frame", None, &caps(1, 1))
                .await
        );
        assert!(
            !validator
                .is_valid_frame(Some("k1"), b"frame", None, &ShardMetadata::new())
                .await
        );
    }

    #[tokio::test]
    async fn test_rejected_frames_are_persisted_with_own_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut validator = FrameValidator::new("cam-1", None, true)
            .with_corrupt_persistence(tmp.path())
            .await
            .unwrap();

        let rules = caps(1920, 1080);
        assert!(
            !validator
                .is_valid_frame(None, b"bad0", Some(&rules), &caps(1, 1))
                .await
        );
        assert!(
            !validator
                .is_valid_frame(None, b"bad1", Some(&rules), &caps(2, 2))
                .await
        );
        validator.close().await.unwrap();

        let frames = CorruptFrameLog::read_and_consume(tmp.path(), "cam-1")
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, "0__frame");
        assert_eq!(frames[1].0, "1__frame");
        assert_eq!(frames[1].1, b"bad1".to_vec());
    }

    #[tokio::test]
    async fn test_rules_file() {
        let tmp = tempfile::tempdir().unwrap();
        let rules_path = tmp.path().join("rules.json");
        std::fs::write(&rules_path, r#"{"codec": "h264"}"#).unwrap();

        let mut validator = FrameValidator::new("cam-1", None, false)
            .with_rules_file(&rules_path)
            .unwrap();

        let mut good = ShardMetadata::new();
        good.insert("codec".to_string(), json!("h264"));
        // live metadata is ignored once a rules file is loaded
        let live = caps(9, 9);
        assert!(
            validator
                .is_valid_frame(Some("k"), b"f", Some(&live), &good)
                .await
        );

        let mut bad = ShardMetadata::new();
        bad.insert("codec".to_string(), json!("vp9"));
        assert!(
            !validator
                .is_valid_frame(Some("k"), b"f", Some(&live), &bad)
                .await
        );

        assert!(FrameValidator::new("cam-2", None, false)
            .with_rules_file(tmp.path().join("missing.json").as_path())
            .is_err());
    }
}
