//! Configuration for rill
//!
//! Configuration *loading* (files, environment, flags) is the embedder's
//! concern; these structs are the validated, programmatic form the storage
//! and cluster layers consume.

use std::path::PathBuf;

use crate::error::{Result, RillError};
use crate::storage::index::ENTRY_WIDTH;

/// Default maximum segment size before rolling (256 MB)
pub const DEFAULT_SEGMENT_MAX_BYTES: i64 = 256 * 1024 * 1024;

/// Default preallocated index file size (10 MB)
pub const DEFAULT_INDEX_MAX_BYTES: i64 = 10 * 1024 * 1024;

/// Default interval between high-watermark checkpoint writes (5 seconds)
pub const DEFAULT_HW_CHECKPOINT_INTERVAL_MS: u64 = 5_000;

/// Configuration for a single partition's commit log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum size of a segment in bytes before it is sealed and a new
    /// segment is rolled.
    pub segment_max_bytes: i64,

    /// Roll a new segment once this much time has passed since the first
    /// write to the active segment, regardless of size. 0 disables
    /// time-based rolling.
    pub segment_roll_interval_ms: i64,

    /// Preallocated size of each segment's index file. Bounds the number
    /// of messages a segment can hold to `index_max_bytes / 16`.
    pub index_max_bytes: i64,

    /// Delete the oldest sealed segments once the log exceeds this many
    /// bytes. -1 disables size-based retention.
    pub retention_max_bytes: i64,

    /// Delete sealed segments whose newest message is older than this.
    /// -1 disables age-based retention.
    pub retention_max_age_ms: i64,

    /// Enable key-based compaction of sealed segments during clean.
    pub compact: bool,

    /// Interval between background high-watermark checkpoint writes.
    pub hw_checkpoint_interval_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            segment_roll_interval_ms: 0,
            index_max_bytes: DEFAULT_INDEX_MAX_BYTES,
            retention_max_bytes: -1,
            retention_max_age_ms: -1,
            compact: false,
            hw_checkpoint_interval_ms: DEFAULT_HW_CHECKPOINT_INTERVAL_MS,
        }
    }
}

impl LogConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.segment_max_bytes <= 0 {
            return Err(RillError::Config(format!(
                "segment_max_bytes must be positive, got {}",
                self.segment_max_bytes
            )));
        }
        if self.index_max_bytes < ENTRY_WIDTH as i64 {
            return Err(RillError::Config(format!(
                "index_max_bytes must hold at least one entry ({} bytes), got {}",
                ENTRY_WIDTH, self.index_max_bytes
            )));
        }
        if self.segment_roll_interval_ms < 0 {
            return Err(RillError::Config(
                "segment_roll_interval_ms must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Node-level configuration shared by the metadata store and the FSM
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's cluster-unique identifier.
    pub node_id: String,

    /// Root directory for partition data. Each partition's commit log
    /// lives under `<data_dir>/streams/<stream>/<partition>`.
    pub data_dir: PathBuf,

    /// Emit per-operation logs while replaying the consensus log during
    /// startup recovery. Off by default: replay is not new activity.
    pub log_recovery: bool,

    /// Commit log configuration applied to every partition on this node.
    pub log: LogConfig,
}

impl ServerConfig {
    /// Create a config with defaults for the given node id and data
    /// directory.
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: data_dir.into(),
            log_recovery: false,
            log: LogConfig::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(RillError::Config("node_id must not be empty".to_string()));
        }
        self.log.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_config_is_valid() {
        LogConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_segment_size() {
        let config = LogConfig {
            segment_max_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RillError::Config(_))));
    }

    #[test]
    fn test_rejects_tiny_index() {
        let config = LogConfig {
            index_max_bytes: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RillError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_node_id() {
        let config = ServerConfig::new("", "/tmp/rill");
        assert!(matches!(config.validate(), Err(RillError::Config(_))));
    }
}
