//! Memory-mapped offset index for segments
//!
//! Each segment carries a fixed-width index mapping message offsets to
//! byte positions in the segment's log file. Entries are 16 bytes
//! (big-endian):
//!
//! ```text
//! rel_offset: u32 | position: u32 | timestamp: i64
//! ```
//!
//! where the absolute offset is `base_offset + rel_offset`. The file is
//! preallocated and memory-mapped; the unused tail is zero-filled. On open,
//! the write position is recovered by scanning backwards from the end of
//! the file for the last non-zero entry. Entries are ordered by offset
//! (append order), and timestamps are non-decreasing, so both offset and
//! timestamp lookups are binary searches over `position / ENTRY_WIDTH`
//! entries.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Result, RillError};

/// Width of one index entry in bytes.
pub const ENTRY_WIDTH: usize = 4 + 4 + 8;

/// A single index entry with the absolute offset resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Absolute message offset.
    pub offset: i64,
    /// Byte position of the message frame in the segment's log file.
    pub position: i64,
    /// Message timestamp in milliseconds.
    pub timestamp: i64,
}

/// Memory-mapped index over a segment's log file.
#[derive(Debug)]
pub(crate) struct Index {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    base_offset: i64,
    /// Number of bytes in use (entries * ENTRY_WIDTH).
    position: i64,
}

impl Index {
    /// Open or create the index file at `path`. New files are
    /// preallocated to `max_bytes` rounded down to the entry width;
    /// existing files keep their size (a sealed segment's index has been
    /// shrunk to its used size).
    pub fn open(path: &Path, base_offset: i64, max_bytes: i64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| RillError::io("open", path, e))?;
        let meta = file
            .metadata()
            .map_err(|e| RillError::io("stat", path, e))?;

        let mut size = meta.len() as i64;
        if size == 0 {
            size = round_down(max_bytes, ENTRY_WIDTH as i64).max(ENTRY_WIDTH as i64);
            file.set_len(size as u64)
                .map_err(|e| RillError::io("truncate", path, e))?;
        } else if size % ENTRY_WIDTH as i64 != 0 {
            return Err(RillError::Corrupted(format!(
                "index file {} has misaligned size {}",
                path.display(),
                size
            )));
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| RillError::io("mmap", path, e))?;

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            base_offset,
            position: 0,
        })
    }

    /// Locate the end of the written entries by scanning backwards from
    /// the end of the file for the last non-zero entry, and return that
    /// entry. Freshly allocated files are sparse-zero, so an all-zero
    /// entry marks unused space. Returns `None` for an empty index.
    pub fn initialize_position(&mut self) -> Result<Option<Entry>> {
        let total = self.mmap.len() / ENTRY_WIDTH;
        for i in (0..total).rev() {
            let start = i * ENTRY_WIDTH;
            let raw = &self.mmap[start..start + ENTRY_WIDTH];
            if raw.iter().any(|&b| b != 0) {
                self.position = ((i + 1) * ENTRY_WIDTH) as i64;
                return Ok(Some(self.decode_entry(start)));
            }
        }
        self.position = 0;
        Ok(None)
    }

    /// Append entries at the current position.
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let needed = self.position as usize + entries.len() * ENTRY_WIDTH;
        if needed > self.mmap.len() {
            self.grow(needed)?;
        }
        for entry in entries {
            let start = self.position as usize;
            let rel = (entry.offset - self.base_offset) as u32;
            self.mmap[start..start + 4].copy_from_slice(&rel.to_be_bytes());
            self.mmap[start + 4..start + 8].copy_from_slice(&(entry.position as u32).to_be_bytes());
            self.mmap[start + 8..start + 16].copy_from_slice(&entry.timestamp.to_be_bytes());
            self.position += ENTRY_WIDTH as i64;
        }
        Ok(())
    }

    fn grow(&mut self, needed: usize) -> Result<()> {
        let new_len = (self.mmap.len() * 2).max(needed);
        let new_len = round_down(new_len as i64, ENTRY_WIDTH as i64)
            + if new_len as i64 % ENTRY_WIDTH as i64 != 0 {
                ENTRY_WIDTH as i64
            } else {
                0
            };
        self.mmap
            .flush()
            .map_err(|e| RillError::io("flush", &self.path, e))?;
        self.file
            .set_len(new_len as u64)
            .map_err(|e| RillError::io("truncate", &self.path, e))?;
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| RillError::io("mmap", &self.path, e))?;
        Ok(())
    }

    /// Read the entry stored at the given file offset.
    pub fn read_entry(&self, file_offset: i64) -> Result<Entry> {
        if file_offset < 0
            || file_offset % ENTRY_WIDTH as i64 != 0
            || file_offset + ENTRY_WIDTH as i64 > self.position
        {
            return Err(RillError::EntryNotFound);
        }
        Ok(self.decode_entry(file_offset as usize))
    }

    fn decode_entry(&self, start: usize) -> Entry {
        let raw = &self.mmap[start..start + ENTRY_WIDTH];
        let rel = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let position = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let timestamp = i64::from_be_bytes([
            raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
        ]);
        Entry {
            offset: self.base_offset + rel as i64,
            position: position as i64,
            timestamp,
        }
    }

    /// Number of entries written.
    pub fn count_entries(&self) -> i64 {
        self.position / ENTRY_WIDTH as i64
    }

    /// Bytes in use.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Find the first entry whose offset is greater than or equal to the
    /// given offset.
    pub fn find_entry(&self, offset: i64) -> Result<Entry> {
        let idx = self.partition_point(|e| e.offset < offset);
        self.read_entry(idx * ENTRY_WIDTH as i64)
    }

    /// Find the first entry whose timestamp is greater than or equal to
    /// the given timestamp.
    pub fn find_entry_by_timestamp(&self, timestamp: i64) -> Result<Entry> {
        let idx = self.partition_point(|e| e.timestamp < timestamp);
        self.read_entry(idx * ENTRY_WIDTH as i64)
    }

    /// Find the last entry whose timestamp is less than or equal to the
    /// given timestamp.
    pub fn find_entry_before_timestamp(&self, timestamp: i64) -> Result<Entry> {
        let idx = self.partition_point(|e| e.timestamp <= timestamp);
        if idx == 0 {
            return Err(RillError::EntryNotFound);
        }
        self.read_entry((idx - 1) * ENTRY_WIDTH as i64)
    }

    /// Binary search: index of the first entry for which `pred` is false.
    fn partition_point(&self, pred: impl Fn(&Entry) -> bool) -> i64 {
        let mut lo = 0i64;
        let mut hi = self.count_entries();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.decode_entry((mid * ENTRY_WIDTH as i64) as usize);
            if pred(&entry) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Flush dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| RillError::io("flush", &self.path, e))
    }

    /// Truncate the file to its used size, freeing the preallocated tail.
    /// Called when a segment is sealed.
    pub fn shrink(&mut self) -> Result<()> {
        self.flush()?;
        let used = self.position.max(0) as u64;
        self.file
            .set_len(used)
            .map_err(|e| RillError::io("truncate", &self.path, e))?;
        if used > 0 {
            self.mmap = unsafe { MmapMut::map_mut(&self.file) }
                .map_err(|e| RillError::io("mmap", &self.path, e))?;
        }
        Ok(())
    }

    /// Flush and release the preallocated tail.
    pub fn close(&mut self) -> Result<()> {
        self.shrink()
    }
}

fn round_down(value: i64, multiple: i64) -> i64 {
    value - value % multiple
}
