//! Error types for rill
//!
//! A single error enum is shared across the storage and cluster layers.
//! The variants that callers are expected to match on (for retry or
//! idempotency decisions) are distinct unit variants rather than stringly
//! errors: a reader seeing [`RillError::SegmentReplaced`] retries against
//! the log's current segment, and the metadata FSM returns
//! [`RillError::PartitionExists`] / [`RillError::StreamNotFound`] /
//! [`RillError::PartitionNotFound`] to the proposer instead of treating
//! them as fatal.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for rill operations
pub type Result<T> = std::result::Result<T, RillError>;

/// Errors produced by the commit log and the metadata state machine
#[derive(Debug, Error)]
pub enum RillError {
    /// The partition already exists in the metadata store.
    #[error("partition already exists")]
    PartitionExists,

    /// No partition with the given stream name and id is known.
    #[error("no such partition")]
    PartitionNotFound,

    /// No stream with the given name is known.
    #[error("no such stream")]
    StreamNotFound,

    /// The replica is not a member of the partition's replica set.
    #[error("no such replica")]
    ReplicaNotFound,

    /// The log is in readonly mode and cannot accept new appends.
    #[error("commit log is in readonly mode")]
    CommitLogReadonly,

    /// The commit log has been closed.
    #[error("commit log was closed")]
    CommitLogClosed,

    /// The commit log has been deleted from the filesystem.
    #[error("commit log was deleted")]
    CommitLogDeleted,

    /// Read or write against a segment that has been closed.
    #[error("segment has been closed")]
    SegmentClosed,

    /// The segment was superseded by compaction or truncation. Callers
    /// should re-resolve the segment through the log and retry.
    #[error("segment was replaced")]
    SegmentReplaced,

    /// Attempted to create a segment whose log file already exists.
    #[error("segment already exists")]
    SegmentExists,

    /// An index search did not find a matching entry.
    #[error("entry not found")]
    EntryNotFound,

    /// On-disk data failed validation (bad framing, CRC mismatch,
    /// misaligned index).
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed consensus log entry or snapshot.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O failure with the operation and path that produced it.
    #[error("{op} failed on {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure without path context.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl RillError {
    /// Attach operation and path context to an I/O error.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Whether this error is one of the recognized FSM sentinels that are
    /// returned to the proposer as an apply result instead of aborting the
    /// state machine.
    pub fn is_apply_sentinel(&self) -> bool {
        matches!(
            self,
            Self::PartitionExists | Self::StreamNotFound | Self::PartitionNotFound
        )
    }
}
