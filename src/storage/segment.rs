//! Log segments
//!
//! A segment is one contiguous slice of a partition's commit log, backed
//! by a pair of files named by the segment's 20-digit zero-padded base
//! offset: `<base>.log` holds raw message-set bytes, `<base>.index` holds
//! fixed-width offset index entries. Exactly one segment per log is
//! active (writable); all others are sealed.
//!
//! Compaction and truncation never rewrite a segment in place. They build
//! a shadow segment at the same base offset with a transient suffix
//! (`.cleaned` / `.truncated`) and atomically rename it over the original
//! ([`Segment::replace`]). A reader still holding the old segment gets
//! [`RillError::SegmentReplaced`] and re-resolves through the log.
//!
//! Readers that catch up to the end of the active segment park on a
//! waiter channel; writes, sealing, and readonly transitions close those
//! channels to wake them.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::error::{Result, RillError};
use crate::storage::index::{Entry, Index};
use crate::storage::message::{FrameHeader, FRAME_HEADER_LEN};

/// Extension of segment log files.
pub const LOG_SUFFIX: &str = ".log";

/// Extension of segment index files.
pub const INDEX_SUFFIX: &str = ".index";

/// Transient suffix for compacted shadow segments.
pub const CLEANED_SUFFIX: &str = ".cleaned";

/// Transient suffix for truncated shadow segments.
pub const TRUNCATED_SUFFIX: &str = ".truncated";

/// Parse the base offset out of a segment log file name.
pub(crate) fn parse_log_filename(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(LOG_SUFFIX)?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

/// Opaque identity of a blocked reader, used to register and deregister
/// waiter channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

impl WaiterId {
    /// Allocate a process-unique waiter id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Return a channel that is already closed, signalling "no need to wait".
pub(crate) fn closed_channel() -> Receiver<()> {
    let (tx, rx) = bounded::<()>(1);
    drop(tx);
    rx
}

struct SegmentInner {
    log: Option<File>,
    index: Index,
    suffix: &'static str,
    first_offset: i64,
    last_offset: i64,
    first_write_time: i64,
    last_write_time: i64,
    position: i64,
    sealed: bool,
    closed: bool,
    replaced: bool,
    waiters: HashMap<WaiterId, (Sender<()>, Receiver<()>)>,
}

/// One log + index file pair covering a contiguous offset range.
pub struct Segment {
    dir: PathBuf,
    base_offset: i64,
    max_bytes: i64,
    index_max_bytes: i64,
    inner: RwLock<SegmentInner>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("first_offset", &inner.first_offset)
            .field("last_offset", &inner.last_offset)
            .field("position", &inner.position)
            .field("sealed", &inner.sealed)
            .field("closed", &inner.closed)
            .field("replaced", &inner.replaced)
            .finish()
    }
}

impl Segment {
    /// Open or create a segment in `dir` at the given base offset.
    /// When `is_new` is set, an existing log file is an error.
    pub(crate) fn new(
        dir: &Path,
        base_offset: i64,
        max_bytes: i64,
        index_max_bytes: i64,
        is_new: bool,
        suffix: &'static str,
    ) -> Result<Self> {
        let log_path = path_for(dir, base_offset, LOG_SUFFIX, suffix);
        if is_new && log_path.exists() {
            return Err(RillError::SegmentExists);
        }

        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(|e| RillError::io("open", &log_path, e))?;
        let position = log
            .metadata()
            .map_err(|e| RillError::io("stat", &log_path, e))?
            .len() as i64;

        let index_path = path_for(dir, base_offset, INDEX_SUFFIX, suffix);
        let index = Index::open(&index_path, base_offset, index_max_bytes)?;

        let mut inner = SegmentInner {
            log: Some(log),
            index,
            suffix,
            first_offset: -1,
            last_offset: -1,
            first_write_time: 0,
            last_write_time: 0,
            position,
            sealed: false,
            closed: false,
            replaced: false,
            waiters: HashMap::new(),
        };
        setup_index(&mut inner)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            base_offset,
            max_bytes,
            index_max_bytes,
            inner: RwLock::new(inner),
        })
    }

    /// Base offset of this segment.
    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Offset of the first message, or -1 if the segment is empty.
    pub fn first_offset(&self) -> i64 {
        self.inner.read().first_offset
    }

    /// Offset of the last message, or -1 if the segment is empty.
    pub fn last_offset(&self) -> i64 {
        self.inner.read().last_offset
    }

    /// Timestamp of the first write, or 0 if the segment is empty.
    pub fn first_write_time(&self) -> i64 {
        self.inner.read().first_write_time
    }

    /// Timestamp of the last write, or 0 if the segment is empty.
    pub fn last_write_time(&self) -> i64 {
        self.inner.read().last_write_time
    }

    /// Offset the next appended message would receive.
    pub fn next_offset(&self) -> i64 {
        let inner = self.inner.read();
        if inner.last_offset == -1 {
            self.base_offset
        } else {
            inner.last_offset + 1
        }
    }

    /// Physical size of the log file in bytes.
    pub fn position(&self) -> i64 {
        self.inner.read().position
    }

    /// Whether the segment holds no messages.
    pub fn is_empty(&self) -> bool {
        self.inner.read().first_offset == -1
    }

    /// Number of messages in the segment.
    pub fn message_count(&self) -> i64 {
        self.inner.read().index.count_entries()
    }

    /// Whether the segment has been sealed against writes.
    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    /// Whether the segment has been superseded by a compacted or
    /// truncated replacement.
    pub fn is_replaced(&self) -> bool {
        self.inner.read().replaced
    }

    /// Path of the segment's log file.
    pub fn log_path(&self) -> PathBuf {
        path_for(&self.dir, self.base_offset, LOG_SUFFIX, self.inner.read().suffix)
    }

    /// Path of the segment's index file.
    pub fn index_path(&self) -> PathBuf {
        path_for(&self.dir, self.base_offset, INDEX_SUFFIX, self.inner.read().suffix)
    }

    /// Whether a new segment should be rolled: the segment is full, or
    /// `roll_interval_ms` has passed since its first write.
    pub fn check_split(&self, roll_interval_ms: i64) -> bool {
        let inner = self.inner.read();
        if inner.position >= self.max_bytes {
            return true;
        }
        if roll_interval_ms == 0 || inner.first_write_time == 0 {
            return false;
        }
        chrono::Utc::now().timestamp_millis() - inner.first_write_time >= roll_interval_ms
    }

    /// Seal the segment against further writes, wake any waiting readers,
    /// and shrink the index to its used size. Idempotent.
    pub fn seal(&self) {
        let mut inner = self.inner.write();
        if inner.sealed {
            return;
        }
        inner.sealed = true;
        if let Some(log) = inner.log.as_ref() {
            if let Err(e) = log.sync_all() {
                let path = self.log_path_locked(&inner);
                warn!(path = %path.display(), error = %e, "Log fsync on seal failed");
            }
        }
        notify_waiters(&mut inner);
        if let Err(e) = inner.index.shrink() {
            warn!(base_offset = self.base_offset, error = %e, "Index shrink on seal failed");
        }
    }

    /// Append a message set and its index entries. The caller has already
    /// assigned offsets and computed entry positions; a commit log only
    /// ever has one writer at a time.
    pub(crate) fn write_message_set(&self, ms: &[u8], entries: &[Entry]) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(RillError::SegmentClosed);
        }
        let log = inner.log.as_ref().ok_or(RillError::SegmentClosed)?;
        let mut writer = log;
        writer
            .write_all(ms)
            .map_err(|e| RillError::io("write", self.log_path_locked(&inner), e))?;
        inner.position += ms.len() as i64;
        if let (0, Some(first)) = (inner.first_write_time, entries.first()) {
            inner.first_offset = first.offset;
            inner.first_write_time = first.timestamp;
        }
        if let Some(last) = entries.last() {
            inner.last_offset = last.offset;
            inner.last_write_time = last.timestamp;
        }
        inner.index.append(entries)?;
        notify_waiters(&mut inner);
        Ok(())
    }

    /// Random read at a byte position in the log file. Fails with
    /// [`RillError::SegmentReplaced`] if this segment has been replaced
    /// (retry against the log's current segment) or
    /// [`RillError::SegmentClosed`] otherwise.
    pub fn read_at(&self, buf: &mut [u8], position: i64) -> Result<()> {
        let inner = self.inner.read();
        if inner.closed {
            if inner.replaced {
                return Err(RillError::SegmentReplaced);
            }
            return Err(RillError::SegmentClosed);
        }
        let log = inner.log.as_ref().ok_or(RillError::SegmentClosed)?;
        log.read_exact_at(buf, position as u64)
            .map_err(|e| RillError::io("read", self.log_path_locked(&inner), e))
    }

    /// Register for notification once the segment's end moves past `leo`.
    /// Returns an already-closed channel if the observed LEO has already
    /// advanced.
    pub fn wait_for_leo(&self, waiter: WaiterId, leo: i64) -> Receiver<()> {
        let mut inner = self.inner.write();
        let next = if inner.last_offset == -1 {
            self.base_offset
        } else {
            inner.last_offset + 1
        };
        if next != leo {
            return closed_channel();
        }
        let position = inner.position;
        wait_for_data(&mut inner, self.max_bytes, waiter, position)
    }

    /// Register for notification once data past byte position `pos`
    /// exists. Returns an already-closed channel if data is already there
    /// or the segment is full.
    pub fn wait_for_data(&self, waiter: WaiterId, pos: i64) -> Receiver<()> {
        let mut inner = self.inner.write();
        wait_for_data(&mut inner, self.max_bytes, waiter, pos)
    }

    /// Deregister a waiter. Safe to call at any time, including after the
    /// waiter has been notified.
    pub fn remove_waiter(&self, waiter: WaiterId) {
        self.inner.write().waiters.remove(&waiter);
    }

    /// Wake every registered waiter.
    pub(crate) fn notify_waiters(&self) {
        notify_waiters(&mut self.inner.write());
    }

    /// Find the first index entry with offset >= `offset`.
    pub(crate) fn find_entry(&self, offset: i64) -> Result<Entry> {
        self.inner.read().index.find_entry(offset)
    }

    /// Find the first index entry with timestamp >= `timestamp`.
    pub(crate) fn find_entry_by_timestamp(&self, timestamp: i64) -> Result<Entry> {
        self.inner.read().index.find_entry_by_timestamp(timestamp)
    }

    /// Find the last index entry with timestamp <= `timestamp`.
    pub(crate) fn find_entry_before_timestamp(&self, timestamp: i64) -> Result<Entry> {
        self.inner.read().index.find_entry_before_timestamp(timestamp)
    }

    /// Read the index entry at ordinal `i`.
    pub(crate) fn entry_at(&self, i: i64) -> Result<Entry> {
        self.inner
            .read()
            .index
            .read_entry(i * crate::storage::index::ENTRY_WIDTH as i64)
    }

    /// Build a shadow segment with the `.cleaned` suffix at the same base
    /// offset, for compaction.
    pub(crate) fn cleaned(&self) -> Result<Segment> {
        self.shadow(CLEANED_SUFFIX)
    }

    /// Build a shadow segment with the `.truncated` suffix at the same
    /// base offset, for truncation.
    pub(crate) fn truncated(&self) -> Result<Segment> {
        self.shadow(TRUNCATED_SUFFIX)
    }

    fn shadow(&self, suffix: &'static str) -> Result<Segment> {
        // Discard leftovers from an interrupted ceremony; the shadow must
        // start empty.
        for ext in [LOG_SUFFIX, INDEX_SUFFIX] {
            let stale = path_for(&self.dir, self.base_offset, ext, suffix);
            if stale.exists() {
                fs::remove_file(&stale).map_err(|e| RillError::io("remove", &stale, e))?;
            }
        }
        Segment::new(
            &self.dir,
            self.base_offset,
            self.max_bytes,
            self.index_max_bytes,
            false,
            suffix,
        )
    }

    /// Atomically install this shadow segment over `old`: close both,
    /// rename `.log<suffix>` -> `.log` and `.index<suffix>` -> `.index`,
    /// reopen this segment without the suffix, and mark `old` replaced so
    /// concurrent readers holding it retry against the log.
    pub(crate) fn replace(self: &Arc<Self>, old: &Arc<Segment>) -> Result<()> {
        // Lock both segments in a canonical order so concurrent replaces
        // cannot deadlock, regardless of which side each caller passes.
        let (mut first, mut second) = lock_pair(self, old);
        let (inner, old_inner) = if Arc::as_ptr(self) < Arc::as_ptr(old) {
            (&mut first, &mut second)
        } else {
            (&mut second, &mut first)
        };

        close_locked(old_inner)?;
        close_locked(inner)?;

        let from_log = path_for(&self.dir, self.base_offset, LOG_SUFFIX, inner.suffix);
        let to_log = path_for(&old.dir, old.base_offset, LOG_SUFFIX, old_inner.suffix);
        fs::rename(&from_log, &to_log).map_err(|e| RillError::io("rename", &from_log, e))?;
        let from_index = path_for(&self.dir, self.base_offset, INDEX_SUFFIX, inner.suffix);
        let to_index = path_for(&old.dir, old.base_offset, INDEX_SUFFIX, old_inner.suffix);
        fs::rename(&from_index, &to_index).map_err(|e| RillError::io("rename", &from_index, e))?;
        sync_dir(&self.dir);

        inner.suffix = "";
        let log_path = path_for(&self.dir, self.base_offset, LOG_SUFFIX, "");
        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(|e| RillError::io("open", &log_path, e))?;
        inner.position = log
            .metadata()
            .map_err(|e| RillError::io("stat", &log_path, e))?
            .len() as i64;
        inner.log = Some(log);
        inner.closed = false;
        let index_path = path_for(&self.dir, self.base_offset, INDEX_SUFFIX, "");
        inner.index = Index::open(&index_path, self.base_offset, self.index_max_bytes)?;
        setup_index(inner)?;

        old_inner.replaced = true;
        debug!(
            base_offset = self.base_offset,
            path = %to_log.display(),
            "Segment replaced"
        );
        Ok(())
    }

    /// Close the segment. Subsequent reads and writes fail. Idempotent.
    pub(crate) fn close(&self) -> Result<()> {
        close_locked(&mut self.inner.write())
    }

    /// Close the segment and remove its files.
    pub(crate) fn delete(&self) -> Result<()> {
        let log_path = self.log_path();
        let index_path = self.index_path();
        self.close()?;
        for path in [&log_path, &index_path] {
            if path.exists() {
                fs::remove_file(path).map_err(|e| RillError::io("remove", path, e))?;
            }
        }
        debug!(base_offset = self.base_offset, "Segment deleted");
        Ok(())
    }

    fn log_path_locked(&self, inner: &SegmentInner) -> PathBuf {
        path_for(&self.dir, self.base_offset, LOG_SUFFIX, inner.suffix)
    }
}

/// Sequential scanner over a segment's messages, yielding each raw frame
/// with its index entry. Used by compaction and truncation to copy frames
/// verbatim into shadow segments.
pub(crate) struct SegmentScanner {
    segment: Arc<Segment>,
    next: i64,
}

impl SegmentScanner {
    pub fn new(segment: Arc<Segment>) -> Self {
        Self { segment, next: 0 }
    }

    /// Read the next frame, or `None` at the end of the segment.
    pub fn scan(&mut self) -> Result<Option<(Vec<u8>, Entry)>> {
        if self.next >= self.segment.message_count() {
            return Ok(None);
        }
        let entry = self.segment.entry_at(self.next)?;
        self.next += 1;

        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        self.segment.read_at(&mut header_buf, entry.position)?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut frame = vec![0u8; header.frame_len()];
        frame[..FRAME_HEADER_LEN].copy_from_slice(&header_buf);
        self.segment
            .read_at(&mut frame[FRAME_HEADER_LEN..], entry.position + FRAME_HEADER_LEN as i64)?;
        Ok(Some((frame, entry)))
    }
}

fn setup_index(inner: &mut SegmentInner) -> Result<()> {
    if let Some(last) = inner.index.initialize_position()? {
        inner.last_offset = last.offset;
        inner.last_write_time = last.timestamp;
        let first = inner.index.read_entry(0)?;
        inner.first_offset = first.offset;
        inner.first_write_time = first.timestamp;
    }
    Ok(())
}

fn wait_for_data(
    inner: &mut SegmentInner,
    max_bytes: i64,
    waiter: WaiterId,
    pos: i64,
) -> Receiver<()> {
    if let Some((_, rx)) = inner.waiters.get(&waiter) {
        return rx.clone();
    }
    // Re-check under the write lock: a writer may have appended between
    // the caller's observation and registration.
    if inner.position > pos || inner.position >= max_bytes || inner.sealed {
        return closed_channel();
    }
    let (tx, rx) = bounded(1);
    inner.waiters.insert(waiter, (tx, rx.clone()));
    rx
}

fn notify_waiters(inner: &mut SegmentInner) {
    // Dropping the sender closes each waiter's channel exactly once; the
    // entry is removed so a second notification cannot double-close.
    inner.waiters.clear();
}

fn close_locked(inner: &mut SegmentInner) -> Result<()> {
    if inner.closed {
        return Ok(());
    }
    inner.log = None;
    inner.index.close()?;
    inner.closed = true;
    notify_waiters(inner);
    Ok(())
}

/// Acquire write locks on both segments ordered by identity.
fn lock_pair<'a>(
    a: &'a Arc<Segment>,
    b: &'a Arc<Segment>,
) -> (
    RwLockWriteGuard<'a, SegmentInner>,
    RwLockWriteGuard<'a, SegmentInner>,
) {
    if Arc::as_ptr(a) < Arc::as_ptr(b) {
        let ga = a.inner.write();
        let gb = b.inner.write();
        (ga, gb)
    } else {
        let gb = b.inner.write();
        let ga = a.inner.write();
        (gb, ga)
    }
}

fn path_for(dir: &Path, base_offset: i64, ext: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{base_offset:020}{ext}{suffix}"))
}

/// Fsync a directory so a completed rename survives power loss.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            warn!(path = %dir.display(), error = %e, "Directory fsync failed");
        }
    }
}
