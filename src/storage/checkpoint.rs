//! High-watermark and leader-epoch checkpoints
//!
//! Two small files live beside a partition's segments:
//!
//! - `high_watermark` — a plain-text integer recording the last
//!   checkpointed high watermark. On recovery it bounds the HW from
//!   below; the HW is additionally clamped so it never exceeds the log
//!   end offset.
//! - `leader_epochs` — a JSON list of `(epoch, start_offset)` pairs, one
//!   per leadership term, recording the offset at which each term began.
//!
//! Both are written with the same ceremony: write a temp file, fsync it,
//! rename it over the target, fsync the parent directory. A crash leaves
//! either the old or the new file, never a torn one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RillError};
use crate::storage::segment::sync_dir;

/// File name of the high-watermark checkpoint.
pub const HW_CHECKPOINT_FILE: &str = "high_watermark";

/// File name of the leader-epoch checkpoint.
pub const LEADER_EPOCH_FILE: &str = "leader_epochs";

/// Write `data` to `path` atomically: temp file, fsync, rename, dir fsync.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| RillError::io("create", &tmp, e))?;
        file.write_all(data)
            .map_err(|e| RillError::io("write", &tmp, e))?;
        file.sync_all().map_err(|e| RillError::io("fsync", &tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| RillError::io("rename", &tmp, e))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// Plain-text integer checkpoint of the high watermark.
#[derive(Debug)]
pub(crate) struct HighWatermarkCheckpoint {
    path: PathBuf,
}

impl HighWatermarkCheckpoint {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(HW_CHECKPOINT_FILE),
        }
    }

    /// Load the checkpointed value, or `None` when no checkpoint exists.
    pub fn load(&self) -> Result<Option<i64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path).map_err(|e| RillError::io("read", &self.path, e))?;
        let hw = text.trim().parse::<i64>().map_err(|_| {
            RillError::Corrupted(format!(
                "high watermark checkpoint {} is not an integer: {:?}",
                self.path.display(),
                text
            ))
        })?;
        Ok(Some(hw))
    }

    /// Persist the given value.
    pub fn save(&self, hw: i64) -> Result<()> {
        write_atomic(&self.path, format!("{hw}\n").as_bytes())?;
        debug!(path = %self.path.display(), hw, "High watermark checkpointed");
        Ok(())
    }
}

/// One leadership term: the epoch and the offset at which it began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochOffset {
    /// Leader epoch.
    pub epoch: u64,
    /// First offset written under this epoch.
    pub start_offset: i64,
}

/// In-memory leader-epoch history backed by the `leader_epochs` file.
///
/// Entries have strictly increasing epochs and strictly increasing start
/// offsets; both invariants are enforced on assignment.
#[derive(Debug)]
pub(crate) struct LeaderEpochCache {
    path: PathBuf,
    entries: Vec<EpochOffset>,
}

impl LeaderEpochCache {
    /// Load the cache from `dir`, starting empty when no checkpoint
    /// exists.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(LEADER_EPOCH_FILE);
        let entries = if path.exists() {
            let data = fs::read(&path).map_err(|e| RillError::io("read", &path, e))?;
            serde_json::from_slice(&data).map_err(|e| {
                RillError::Corrupted(format!(
                    "leader epoch checkpoint {} failed to decode: {e}",
                    path.display()
                ))
            })?
        } else {
            Vec::new()
        };
        Ok(Self { path, entries })
    }

    /// Record the start of a new leader epoch at `start_offset`. Epochs
    /// at or below the last recorded one are ignored.
    pub fn assign(&mut self, epoch: u64, start_offset: i64) -> Result<()> {
        if let Some(last) = self.entries.last() {
            if epoch <= last.epoch {
                return Ok(());
            }
        }
        self.entries.push(EpochOffset {
            epoch,
            start_offset,
        });
        self.persist()?;
        debug!(epoch, start_offset, "New leader epoch recorded");
        Ok(())
    }

    /// Latest recorded epoch, or 0 when none has been recorded.
    pub fn last_epoch(&self) -> u64 {
        self.entries.last().map(|e| e.epoch).unwrap_or(0)
    }

    /// The end offset of the given epoch: `leo` when `epoch` is the
    /// current (or an unknown, newer) epoch, otherwise the start offset
    /// of the first recorded epoch greater than `epoch`. An epoch older
    /// than every recorded one maps to the first recorded start offset.
    pub fn last_offset_for(&self, epoch: u64, leo: i64) -> i64 {
        match self.entries.last() {
            None => leo,
            Some(last) if epoch >= last.epoch => leo,
            _ => self
                .entries
                .iter()
                .find(|e| e.epoch > epoch)
                .map(|e| e.start_offset)
                .unwrap_or(leo),
        }
    }

    /// Drop every epoch that began at or beyond `offset`. Used when the
    /// log is truncated.
    pub fn truncate_from_end(&mut self, offset: i64) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.start_offset < offset);
        if self.entries.len() != before {
            self.persist()?;
        }
        Ok(())
    }

    /// Recorded entries, oldest first.
    #[cfg(test)]
    pub fn entries(&self) -> &[EpochOffset] {
        &self.entries
    }

    fn persist(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| RillError::Corrupted(format!("leader epoch encode failed: {e}")))?;
        write_atomic(&self.path, &data)
    }
}
