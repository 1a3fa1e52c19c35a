//! Per-partition commit log
//!
//! A [`CommitLog`] is one durable, ordered message log: a sequence of
//! segments of which exactly one (the newest) is active. Appends assign
//! contiguous offsets starting at 0, roll the active segment when it
//! fills, and wake blocked readers. The log tracks two watermarks:
//!
//! - **LEO** (log end offset): the offset the next append will receive.
//! - **HW** (high watermark): the number of committed messages. Readers
//!   in committed mode only see offsets below the HW. The HW only moves
//!   forward (a test-only override exists) and is checkpointed to disk by
//!   a background thread; on recovery the checkpoint bounds it from
//!   below, clamped to never exceed the LEO.
//!
//! The log also records the leader-epoch history — at which offset each
//! leadership term began — which followers use to detect divergence
//! after a leader change, and applies retention and key-compaction
//! through [`CommitLog::clean`].
//!
//! Concurrency: a single log-level mutex serializes every mutation of
//! the segment list (append, roll, truncate, clean, readonly and
//! lifecycle transitions). Readers never take it; they work against a
//! snapshot of the segment list and per-segment read locks, and
//! [`CommitLog::high_watermark`] is a plain atomic load.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::{Result, RillError};
use crate::storage::checkpoint::{HighWatermarkCheckpoint, LeaderEpochCache};
use crate::storage::compaction::Compactor;
use crate::storage::index::Entry;
use crate::storage::message::{encode_message_set, scan_message_set, FrameInfo, Message};
use crate::storage::reader::Reader;
use crate::storage::retention::RetentionPolicy;
use crate::storage::segment::{
    closed_channel, parse_log_filename, sync_dir, Segment, WaiterId, CLEANED_SUFFIX,
    TRUNCATED_SUFFIX,
};

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;
const STATE_DELETED: u8 = 2;

struct CheckpointerHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// A partition's segmented, append-only message log.
pub struct CommitLog {
    path: PathBuf,
    config: LogConfig,
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Serializes append, roll, truncate, clean, readonly and lifecycle
    /// transitions. Readers do not take this.
    write_lock: Mutex<()>,
    high_watermark: Arc<AtomicI64>,
    readonly: AtomicBool,
    state: AtomicU8,
    hw_waiters: Mutex<HashMap<WaiterId, (Sender<()>, Receiver<()>)>>,
    epochs: Mutex<LeaderEpochCache>,
    checkpointer: Mutex<Option<CheckpointerHandle>>,
}

impl CommitLog {
    /// Open the log in `path`, creating the directory and an initial
    /// segment when empty, and recovering segments, the high-watermark
    /// checkpoint, and the leader-epoch history otherwise.
    pub fn open(path: impl Into<PathBuf>, config: LogConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let path = path.into();
        fs::create_dir_all(&path).map_err(|e| RillError::io("create_dir_all", &path, e))?;
        discard_interrupted_replacements(&path)?;

        let mut base_offsets = Vec::new();
        for dir_entry in fs::read_dir(&path).map_err(|e| RillError::io("read_dir", &path, e))? {
            let dir_entry = dir_entry.map_err(|e| RillError::io("read_dir", &path, e))?;
            if let Some(name) = dir_entry.file_name().to_str() {
                if let Some(base) = parse_log_filename(name) {
                    base_offsets.push(base);
                }
            }
        }
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        if base_offsets.is_empty() {
            segments.push(Arc::new(Segment::new(
                &path,
                0,
                config.segment_max_bytes,
                config.index_max_bytes,
                true,
                "",
            )?));
        } else {
            let last = *base_offsets.last().unwrap_or(&0);
            for base in base_offsets {
                let segment = Arc::new(Segment::new(
                    &path,
                    base,
                    config.segment_max_bytes,
                    config.index_max_bytes,
                    false,
                    "",
                )?);
                if base != last {
                    segment.seal();
                }
                segments.push(segment);
            }
        }

        let leo = segments
            .last()
            .map(|s| s.next_offset())
            .unwrap_or(0);
        let checkpoint = HighWatermarkCheckpoint::new(&path);
        let hw = checkpoint.load()?.unwrap_or(0).clamp(0, leo);
        let epochs = LeaderEpochCache::load(&path)?;

        let log = Arc::new(Self {
            path: path.clone(),
            config,
            segments: RwLock::new(segments),
            write_lock: Mutex::new(()),
            high_watermark: Arc::new(AtomicI64::new(hw)),
            readonly: AtomicBool::new(false),
            state: AtomicU8::new(STATE_OPEN),
            hw_waiters: Mutex::new(HashMap::new()),
            epochs: Mutex::new(epochs),
            checkpointer: Mutex::new(None),
        });
        log.start_checkpointer();

        info!(
            path = %path.display(),
            leo,
            hw,
            segments = log.segments.read().len(),
            "Commit log opened"
        );
        Ok(log)
    }

    /// Directory holding this log's files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset the next appended message will receive.
    pub fn leo(&self) -> i64 {
        self.segments
            .read()
            .last()
            .map(|s| s.next_offset())
            .unwrap_or(0)
    }

    /// Offset of the last message in the log, or -1 when empty.
    pub fn newest_offset(&self) -> i64 {
        self.leo() - 1
    }

    /// Offset of the first message in the log, or -1 when empty.
    pub fn oldest_offset(&self) -> i64 {
        self.segments
            .read()
            .iter()
            .find(|s| !s.is_empty())
            .map(|s| s.first_offset())
            .unwrap_or(-1)
    }

    /// Current high watermark: the count of committed messages.
    pub fn high_watermark(&self) -> i64 {
        self.high_watermark.load(Ordering::Acquire)
    }

    /// Number of segments currently backing the log.
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Advance the high watermark and wake committed readers. Values at
    /// or below the current HW are ignored; the HW never exceeds the LEO.
    pub fn set_high_watermark(&self, hw: i64) {
        loop {
            let current = self.high_watermark.load(Ordering::Acquire);
            if hw <= current {
                return;
            }
            let clamped = hw.min(self.leo());
            if clamped <= current {
                return;
            }
            if self
                .high_watermark
                .compare_exchange_weak(current, clamped, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.notify_hw_waiters();
                return;
            }
        }
    }

    /// Force the high watermark to an arbitrary value, even a lower one.
    /// This exists for tests only; production code must go through
    /// [`CommitLog::set_high_watermark`].
    pub fn override_high_watermark(&self, hw: i64) {
        self.high_watermark.store(hw, Ordering::Release);
        self.notify_hw_waiters();
    }

    /// Whether the log is in readonly mode.
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    /// Toggle readonly mode. Entering it rejects future [`CommitLog::append`]
    /// calls and wakes committed readers waiting at the LEO so they
    /// observe [`RillError::CommitLogReadonly`]. Readers whose offset is
    /// still below the LEO keep blocking until the HW catches up, and
    /// [`CommitLog::append_message_set`] stays available for replication
    /// reconciliation.
    pub fn set_readonly(&self, readonly: bool) {
        let _guard = self.write_lock.lock();
        self.readonly.store(readonly, Ordering::Release);
        if readonly {
            if let Some(active) = self.segments.read().last() {
                active.notify_waiters();
            }
            self.notify_hw_waiters();
        }
    }

    /// Append messages, assigning sequential offsets starting at the LEO
    /// and stamping messages that carry no timestamp. Returns the
    /// assigned offsets. Fails with [`RillError::CommitLogReadonly`] in
    /// readonly mode.
    pub fn append(&self, messages: Vec<Message>) -> Result<Vec<i64>> {
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        if self.is_readonly() {
            return Err(RillError::CommitLogReadonly);
        }
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let active = self.maybe_roll()?;
        let mut next = active.next_offset();
        let now = chrono::Utc::now().timestamp_millis();
        let mut messages = messages;
        for message in &mut messages {
            message.offset = next;
            next += 1;
            if message.timestamp == 0 {
                message.timestamp = now;
            }
        }

        let mut buf = BytesMut::new();
        let frames = encode_message_set(&messages, &mut buf);
        self.write_frames(&active, &buf, &frames)
    }

    /// Append a raw message set replicated from a leader, preserving the
    /// leader-assigned offsets. Permitted in readonly mode. The set's
    /// first offset must line up with the LEO.
    pub fn append_message_set(&self, ms: &[u8]) -> Result<Vec<i64>> {
        let frames = scan_message_set(ms)?;
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let active = self.maybe_roll()?;
        let leo = active.next_offset();
        if frames[0].offset != leo {
            return Err(RillError::Protocol(format!(
                "message set starts at offset {} but log end offset is {leo}",
                frames[0].offset
            )));
        }
        self.write_frames(&active, ms, &frames)
    }

    fn write_frames(
        &self,
        active: &Arc<Segment>,
        data: &[u8],
        frames: &[FrameInfo],
    ) -> Result<Vec<i64>> {
        let mut entries = Vec::with_capacity(frames.len());
        let mut offsets = Vec::with_capacity(frames.len());
        let mut position = active.position();
        for frame in frames {
            entries.push(Entry {
                offset: frame.offset,
                position,
                timestamp: frame.timestamp,
            });
            offsets.push(frame.offset);
            position += frame.len as i64;
        }
        active.write_message_set(data, &entries)?;
        Ok(offsets)
    }

    /// Seal the active segment and open a new one at the LEO when the
    /// active segment is due to roll.
    fn maybe_roll(&self) -> Result<Arc<Segment>> {
        let active = self.active_segment();
        if !active.check_split(self.config.segment_roll_interval_ms) {
            return Ok(active);
        }
        active.seal();
        let base = active.next_offset();
        let segment = Arc::new(Segment::new(
            &self.path,
            base,
            self.config.segment_max_bytes,
            self.config.index_max_bytes,
            true,
            "",
        )?);
        self.segments.write().push(Arc::clone(&segment));
        debug!(
            path = %self.path.display(),
            base_offset = base,
            "Rolled new segment"
        );
        Ok(segment)
    }

    /// Remove all messages at and beyond `offset`. The segment containing
    /// `offset` is rewritten through a `.truncated` shadow; later
    /// segments are deleted. The HW is clamped to `offset` and leader
    /// epochs that began at or beyond it are dropped.
    pub fn truncate(&self, offset: i64) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        if offset >= self.leo() || offset < 0 {
            return Ok(());
        }

        let segments = self.segments.read().clone();
        let idx = segments
            .iter()
            .rposition(|s| s.base_offset() <= offset)
            .unwrap_or(0);
        let target = &segments[idx];

        let shadow = Arc::new(target.truncated()?);
        let mut scanner = crate::storage::segment::SegmentScanner::new(Arc::clone(target));
        while let Some((frame, entry)) = scanner.scan()? {
            if entry.offset >= offset {
                break;
            }
            let position = shadow.position();
            shadow.write_message_set(
                &frame,
                &[Entry {
                    offset: entry.offset,
                    position,
                    timestamp: entry.timestamp,
                }],
            )?;
        }
        shadow.replace(target)?;

        for segment in &segments[idx + 1..] {
            segment.delete()?;
        }
        {
            let mut list = self.segments.write();
            list.truncate(idx + 1);
            list[idx] = Arc::clone(&shadow);
        }

        let hw = self.high_watermark.load(Ordering::Acquire);
        if hw > offset {
            self.high_watermark.store(offset, Ordering::Release);
        }
        self.epochs.lock().truncate_from_end(offset)?;

        info!(path = %self.path.display(), offset, "Log truncated");
        Ok(())
    }

    /// Record that the log is entering leader epoch `epoch`, starting at
    /// the current LEO. Epochs at or below the last recorded one are
    /// ignored.
    pub fn new_leader_epoch(&self, epoch: u64) -> Result<()> {
        let leo = self.leo();
        self.epochs.lock().assign(epoch, leo)
    }

    /// Latest recorded leader epoch.
    pub fn last_leader_epoch(&self) -> u64 {
        self.epochs.lock().last_epoch()
    }

    /// End offset of the given leader epoch: the start offset of the
    /// first recorded epoch greater than `epoch`, or the LEO when
    /// `epoch` is the current (or an unknown newer) epoch.
    pub fn last_offset_for_leader_epoch(&self, epoch: u64) -> i64 {
        let leo = self.leo();
        self.epochs.lock().last_offset_for(epoch, leo)
    }

    /// Earliest offset whose timestamp is at or after `timestamp`, or -1
    /// when no such message exists.
    pub fn earliest_offset_after_timestamp(&self, timestamp: i64) -> Result<i64> {
        let segments = self.segments.read().clone();
        for segment in &segments {
            if segment.is_empty() || segment.last_write_time() < timestamp {
                continue;
            }
            return match segment.find_entry_by_timestamp(timestamp) {
                Ok(entry) => Ok(entry.offset),
                Err(RillError::EntryNotFound) => continue,
                Err(e) => Err(e),
            };
        }
        Ok(-1)
    }

    /// Latest offset whose timestamp is at or before `timestamp`, or -1
    /// when no such message exists.
    pub fn latest_offset_before_timestamp(&self, timestamp: i64) -> Result<i64> {
        let segments = self.segments.read().clone();
        for segment in segments.iter().rev() {
            if segment.is_empty() || segment.first_write_time() > timestamp {
                continue;
            }
            return match segment.find_entry_before_timestamp(timestamp) {
                Ok(entry) => Ok(entry.offset),
                Err(RillError::EntryNotFound) => continue,
                Err(e) => Err(e),
            };
        }
        Ok(-1)
    }

    /// Register for notification once the log advances past `leo` or
    /// becomes readonly. Returns an already-closed channel when `leo` is
    /// no longer the log end offset.
    pub fn notify_leo(&self, waiter: WaiterId, leo: i64) -> Receiver<()> {
        // Serialized with readonly/lifecycle transitions so a waiter
        // cannot register between the flag flipping and the wakeup sweep.
        let _guard = self.write_lock.lock();
        if self.state.load(Ordering::Acquire) != STATE_OPEN || self.is_readonly() {
            return closed_channel();
        }
        self.active_segment().wait_for_leo(waiter, leo)
    }

    /// Deregister a waiter registered through [`CommitLog::notify_leo`].
    /// Safe to call at any time.
    pub fn remove_leo_waiter(&self, waiter: WaiterId) {
        for segment in self.segments.read().iter() {
            segment.remove_waiter(waiter);
        }
    }

    /// Register the reader at `offset` for notification once the HW
    /// advances past the observed value. Readonly mode does not park the
    /// channel closed for readers below the LEO — they keep waiting for
    /// the HW — but a reader already at the LEO of a readonly log gets a
    /// closed channel so it can observe [`RillError::CommitLogReadonly`].
    pub(crate) fn wait_for_hw(&self, waiter: WaiterId, observed_hw: i64, offset: i64) -> Receiver<()> {
        let mut waiters = self.hw_waiters.lock();
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return closed_channel();
        }
        if self.high_watermark.load(Ordering::Acquire) > observed_hw {
            return closed_channel();
        }
        if self.is_readonly() && offset >= self.leo() {
            return closed_channel();
        }
        if let Some((_, rx)) = waiters.get(&waiter) {
            return rx.clone();
        }
        let (tx, rx) = bounded(1);
        waiters.insert(waiter, (tx, rx.clone()));
        rx
    }

    /// Deregister a committed-mode waiter.
    pub(crate) fn remove_hw_waiter(&self, waiter: WaiterId) {
        self.hw_waiters.lock().remove(&waiter);
    }

    fn notify_hw_waiters(&self) {
        // Dropping the senders closes each channel exactly once.
        self.hw_waiters.lock().clear();
    }

    /// Create a reader starting at `offset` (clamped to the oldest
    /// retained offset). Committed readers only observe offsets below the
    /// HW; uncommitted readers stream everything up to the LEO.
    pub fn new_reader(self: &Arc<Self>, offset: i64, uncommitted: bool) -> Result<Reader> {
        self.ensure_open()?;
        Reader::new(Arc::clone(self), offset, uncommitted)
    }

    /// Apply retention and, when enabled, key-compaction.
    pub fn clean(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.ensure_open()?;

        let policy = RetentionPolicy::from_config(&self.config);
        if policy.is_enabled() {
            let segments = self.segments.read().clone();
            let expired = policy.expired_prefix(&segments, chrono::Utc::now().timestamp_millis());
            if expired > 0 {
                for segment in &segments[..expired] {
                    segment.delete()?;
                }
                self.segments.write().drain(..expired);
                info!(
                    path = %self.path.display(),
                    deleted = expired,
                    "Retention removed expired segments"
                );
            }
        }

        if self.config.compact {
            let segments = self.segments.read().clone();
            if segments.len() > 1 {
                let sealed = &segments[..segments.len() - 1];
                let replacements = Compactor.compact(sealed, self.high_watermark())?;
                let mut list = self.segments.write();
                for (i, replacement) in replacements.into_iter().enumerate() {
                    list[i] = replacement;
                }
            }
        }
        Ok(())
    }

    /// Seal the active segment, stop the HW checkpointer (writing a final
    /// checkpoint), and close every segment. Blocked readers wake with
    /// [`RillError::CommitLogClosed`]. Idempotent.
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Ok(());
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.stop_checkpointer();

        let segments = self.segments.read().clone();
        if let Some(active) = segments.last() {
            active.seal();
        }
        self.notify_hw_waiters();
        for segment in &segments {
            segment.close()?;
        }
        info!(path = %self.path.display(), "Commit log closed");
        Ok(())
    }

    /// Close the log and remove all of its data from the filesystem.
    /// Blocked readers wake with [`RillError::CommitLogDeleted`].
    pub fn delete(&self) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            if self.state.load(Ordering::Acquire) == STATE_DELETED {
                return Ok(());
            }
            self.state.store(STATE_DELETED, Ordering::Release);
            self.stop_checkpointer();
            let segments = self.segments.read().clone();
            if let Some(active) = segments.last() {
                active.notify_waiters();
            }
            self.notify_hw_waiters();
            for segment in &segments {
                segment.close()?;
            }
        }
        fs::remove_dir_all(&self.path).map_err(|e| RillError::io("remove_dir_all", &self.path, e))?;
        info!(path = %self.path.display(), "Commit log deleted");
        Ok(())
    }

    /// Fail with the appropriate lifecycle error unless the log is open.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => Err(RillError::CommitLogClosed),
            STATE_DELETED => Err(RillError::CommitLogDeleted),
            _ => Ok(()),
        }
    }

    pub(crate) fn active_segment(&self) -> Arc<Segment> {
        let segments = self.segments.read();
        Arc::clone(segments.last().expect("commit log has no segments"))
    }

    /// The active segment and its current end position, for readers
    /// parked at the LEO.
    pub(crate) fn active_end(&self) -> (Arc<Segment>, i64) {
        let active = self.active_segment();
        let position = active.position();
        (active, position)
    }

    /// The first segment whose base offset is beyond `base_offset`.
    pub(crate) fn segment_after(&self, base_offset: i64) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .iter()
            .find(|s| s.base_offset() > base_offset)
            .cloned()
    }

    /// Resolve the segment and byte position for reading `offset`,
    /// clamping offsets below the oldest retained message. Offsets at or
    /// beyond the LEO resolve to the end of the active segment.
    pub(crate) fn position_for(&self, offset: i64) -> (Arc<Segment>, i64, i64) {
        let segments = self.segments.read();
        let oldest = segments
            .iter()
            .find(|s| !s.is_empty())
            .map(|s| s.first_offset())
            .unwrap_or(-1);
        let offset = if oldest >= 0 { offset.max(oldest) } else { offset.max(0) };

        let idx = segments
            .iter()
            .rposition(|s| s.base_offset() <= offset)
            .unwrap_or(0);
        for segment in &segments[idx..] {
            match segment.find_entry(offset) {
                Ok(entry) => return (Arc::clone(segment), entry.position, offset),
                Err(RillError::EntryNotFound) => continue,
                Err(_) => break,
            }
        }
        let active = segments.last().expect("commit log has no segments");
        (Arc::clone(active), active.position(), offset)
    }

    fn start_checkpointer(&self) {
        let (stop_tx, stop_rx) = bounded(0);
        let hw = Arc::clone(&self.high_watermark);
        let checkpoint = HighWatermarkCheckpoint::new(&self.path);
        let interval = Duration::from_millis(self.config.hw_checkpoint_interval_ms.max(1));
        let thread = std::thread::spawn(move || run_checkpointer(hw, checkpoint, interval, stop_rx));
        *self.checkpointer.lock() = Some(CheckpointerHandle {
            stop: stop_tx,
            thread,
        });
    }

    fn stop_checkpointer(&self) {
        if let Some(handle) = self.checkpointer.lock().take() {
            drop(handle.stop);
            if handle.thread.join().is_err() {
                warn!(path = %self.path.display(), "High watermark checkpointer panicked");
            }
        }
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        self.stop_checkpointer();
    }
}

/// Periodically persist the HW until the stop channel closes, then write
/// one final checkpoint.
fn run_checkpointer(
    hw: Arc<AtomicI64>,
    checkpoint: HighWatermarkCheckpoint,
    interval: Duration,
    stop: Receiver<()>,
) {
    let mut last_written: Option<i64> = None;
    loop {
        let finished = !matches!(stop.recv_timeout(interval), Err(RecvTimeoutError::Timeout));
        let value = hw.load(Ordering::Acquire);
        if last_written != Some(value) {
            match checkpoint.save(value) {
                Ok(()) => last_written = Some(value),
                Err(e) => warn!(error = %e, "High watermark checkpoint write failed"),
            }
        }
        if finished {
            return;
        }
    }
}

/// Remove shadow files left behind by a replace ceremony that never
/// completed. The original segment files are still in place, so the
/// compaction or truncation simply reruns later.
fn discard_interrupted_replacements(path: &Path) -> Result<()> {
    let mut removed = false;
    for dir_entry in fs::read_dir(path).map_err(|e| RillError::io("read_dir", path, e))? {
        let dir_entry = dir_entry.map_err(|e| RillError::io("read_dir", path, e))?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(CLEANED_SUFFIX) || name.ends_with(TRUNCATED_SUFFIX) {
            let stale = dir_entry.path();
            warn!(path = %stale.display(), "Discarding interrupted segment replacement");
            fs::remove_file(&stale).map_err(|e| RillError::io("remove", &stale, e))?;
            removed = true;
        }
    }
    if removed {
        sync_dir(path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config() -> LogConfig {
        LogConfig {
            segment_max_bytes: 256,
            index_max_bytes: 4096,
            hw_checkpoint_interval_ms: 20,
            ..Default::default()
        }
    }

    fn messages(values: &[&str]) -> Vec<Message> {
        values.iter().map(|v| Message::new(v.to_string())).collect()
    }

    #[test]
    fn test_append_assigns_dense_offsets() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();

        let offsets = log.append(messages(&["a", "b", "c"])).unwrap();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(log.leo(), 3);
        assert_eq!(log.newest_offset(), 2);
        assert_eq!(log.oldest_offset(), 0);
        assert_eq!(log.high_watermark(), 0);

        let offsets = log.append(messages(&["d"])).unwrap();
        assert_eq!(offsets, vec![3]);
        assert_eq!(log.leo(), 4);
        log.close().unwrap();
    }

    #[test]
    fn test_empty_log_offsets() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        assert_eq!(log.newest_offset(), -1);
        assert_eq!(log.oldest_offset(), -1);
        assert_eq!(log.leo(), 0);
        log.close().unwrap();
    }

    #[test]
    fn test_segment_roll_on_size() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();

        // Push well past segment_max_bytes.
        for _ in 0..20 {
            log.append(messages(&["0123456789abcdef0123456789abcdef"]))
                .unwrap();
        }
        let segments = log.segments.read().clone();
        assert!(segments.len() > 1, "expected a roll, got one segment");
        // All but the last are sealed, base offsets are contiguous.
        for pair in segments.windows(2) {
            assert!(pair[0].is_sealed());
            assert_eq!(pair[0].next_offset(), pair[1].base_offset());
        }
        assert!(!segments.last().unwrap().is_sealed());
        log.close().unwrap();
    }

    #[test]
    fn test_reopen_recovers_leo_and_hw() {
        let dir = tempdir().unwrap();
        {
            let log = CommitLog::open(dir.path(), small_config()).unwrap();
            for _ in 0..10 {
                log.append(messages(&["0123456789abcdef0123456789abcdef"]))
                    .unwrap();
            }
            log.set_high_watermark(7);
            log.close().unwrap();
        }
        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        assert_eq!(log.leo(), 10);
        // The final checkpoint written on close bounds the HW from below.
        assert_eq!(log.high_watermark(), 7);
        // Appends continue from the recovered LEO.
        let offsets = log.append(messages(&["next"])).unwrap();
        assert_eq!(offsets, vec![10]);
        log.close().unwrap();
    }

    #[test]
    fn test_hw_checkpoint_never_exceeds_leo() {
        let dir = tempdir().unwrap();
        {
            let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
            log.append(messages(&["a", "b"])).unwrap();
            log.close().unwrap();
        }
        // Corrupt the checkpoint to claim more than was written.
        fs::write(dir.path().join("high_watermark"), "99\n").unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        assert_eq!(log.high_watermark(), 2);
        log.close().unwrap();
    }

    #[test]
    fn test_hw_is_monotonic() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        log.append(messages(&["a", "b", "c"])).unwrap();

        log.set_high_watermark(2);
        assert_eq!(log.high_watermark(), 2);
        log.set_high_watermark(1);
        assert_eq!(log.high_watermark(), 2);
        // Cannot exceed the LEO.
        log.set_high_watermark(50);
        assert_eq!(log.high_watermark(), 3);
        // The test-only override can regress it.
        log.override_high_watermark(1);
        assert_eq!(log.high_watermark(), 1);
        log.close().unwrap();
    }

    #[test]
    fn test_readonly_rejects_append() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        log.append(messages(&["a"])).unwrap();
        log.set_readonly(true);
        assert!(log.is_readonly());
        assert!(matches!(
            log.append(messages(&["b"])),
            Err(RillError::CommitLogReadonly)
        ));
        log.close().unwrap();
    }

    #[test]
    fn test_append_message_set_preserves_offsets() {
        let dir = tempdir().unwrap();
        let leader = CommitLog::open(dir.path().join("leader"), LogConfig::default()).unwrap();
        let follower = CommitLog::open(dir.path().join("follower"), LogConfig::default()).unwrap();

        leader.append(messages(&["a", "b", "c"])).unwrap();

        // Replicate the leader's raw bytes.
        let active = leader.active_segment();
        let mut raw = vec![0u8; active.position() as usize];
        active.read_at(&mut raw, 0).unwrap();

        // Works even while the follower is readonly.
        follower.set_readonly(true);
        let offsets = follower.append_message_set(&raw).unwrap();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(follower.leo(), 3);

        // A gap in offsets is rejected.
        let err = follower.append_message_set(&raw).unwrap_err();
        assert!(matches!(err, RillError::Protocol(_)));

        leader.close().unwrap();
        follower.close().unwrap();
    }

    #[test]
    fn test_truncate_discards_suffix_and_clamps_hw() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        for i in 0..100 {
            log.append(messages(&[format!("message-{i:03}").as_str()])).unwrap();
        }
        log.set_high_watermark(50);

        log.truncate(40).unwrap();
        assert_eq!(log.leo(), 40);
        assert_eq!(log.high_watermark(), 40);

        // New appends continue from the truncation point.
        let offsets = log.append(messages(&["after"])).unwrap();
        assert_eq!(offsets, vec![40]);

        // No segment file beyond the new LEO survives on disk.
        for entry in fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name();
            if let Some(base) = parse_log_filename(name.to_str().unwrap()) {
                assert!(base <= 40, "segment {base} should have been deleted");
            }
        }
        log.close().unwrap();
    }

    #[test]
    fn test_truncate_beyond_leo_is_noop() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        log.append(messages(&["a"])).unwrap();
        log.truncate(10).unwrap();
        assert_eq!(log.leo(), 1);
        log.close().unwrap();
    }

    #[test]
    fn test_leader_epoch_queries() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();

        log.new_leader_epoch(1).unwrap();
        log.append(messages(&["a", "b", "c"])).unwrap(); // epoch 1: 0..3
        log.new_leader_epoch(3).unwrap();
        log.append(messages(&["d", "e"])).unwrap(); // epoch 3: 3..5

        assert_eq!(log.last_leader_epoch(), 3);
        assert_eq!(log.last_offset_for_leader_epoch(3), 5);
        assert_eq!(log.last_offset_for_leader_epoch(1), 3);
        assert_eq!(log.last_offset_for_leader_epoch(2), 3);
        // Unknown newer epoch maps to the LEO.
        assert_eq!(log.last_offset_for_leader_epoch(9), 5);
        // Older than all recorded terms maps to the first start offset.
        assert_eq!(log.last_offset_for_leader_epoch(0), 0);

        // Stale epochs are ignored.
        log.new_leader_epoch(2).unwrap();
        assert_eq!(log.last_leader_epoch(), 3);
        log.close().unwrap();
    }

    #[test]
    fn test_leader_epochs_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
            log.new_leader_epoch(5).unwrap();
            log.append(messages(&["a"])).unwrap();
            log.close().unwrap();
        }
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        assert_eq!(log.last_leader_epoch(), 5);
        log.close().unwrap();
    }

    #[test]
    fn test_timestamp_queries() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        for i in 0..10i64 {
            let mut m = Message::new(format!("m{i}-padded-to-force-some-rolls"));
            m.timestamp = 1_000 + i * 100;
            log.append(vec![m]).unwrap();
        }

        assert_eq!(log.earliest_offset_after_timestamp(0).unwrap(), 0);
        assert_eq!(log.earliest_offset_after_timestamp(1_000).unwrap(), 0);
        assert_eq!(log.earliest_offset_after_timestamp(1_050).unwrap(), 1);
        assert_eq!(log.earliest_offset_after_timestamp(1_900).unwrap(), 9);
        assert_eq!(log.earliest_offset_after_timestamp(5_000).unwrap(), -1);

        assert_eq!(log.latest_offset_before_timestamp(5_000).unwrap(), 9);
        assert_eq!(log.latest_offset_before_timestamp(1_450).unwrap(), 4);
        assert_eq!(log.latest_offset_before_timestamp(1_000).unwrap(), 0);
        assert_eq!(log.latest_offset_before_timestamp(999).unwrap(), -1);
        log.close().unwrap();
    }

    #[test]
    fn test_notify_leo_contract() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        log.append(messages(&["a"])).unwrap();

        // Stale LEO comes back closed immediately.
        let rx = log.notify_leo(WaiterId::next(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));

        // Waiting at the current LEO blocks until an append lands.
        let waiter = WaiterId::next();
        let rx = log.notify_leo(waiter, log.leo());
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Empty)
        ));
        log.append(messages(&["b"])).unwrap();
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
        log.close().unwrap();
    }

    #[test]
    fn test_readonly_closes_leo_waiters() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        log.append(messages(&["a"])).unwrap();

        let rx = log.notify_leo(WaiterId::next(), log.leo());
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Empty)
        ));
        log.set_readonly(true);
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
        log.close().unwrap();
    }

    #[test]
    fn test_clean_applies_retention() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            segment_max_bytes: 128,
            retention_max_bytes: 256,
            index_max_bytes: 4096,
            ..Default::default()
        };
        let log = CommitLog::open(dir.path(), config).unwrap();
        for _ in 0..30 {
            log.append(messages(&["0123456789abcdef0123456789abcdef"]))
                .unwrap();
        }
        let before = log.segments.read().len();
        assert!(before > 2);

        log.clean().unwrap();
        let after = log.segments.read().len();
        assert!(after < before, "retention should drop old segments");
        assert!(log.oldest_offset() > 0);
        // Offsets are never reused after deletion.
        let next = log.append(messages(&["tail"])).unwrap();
        assert_eq!(next[0], 30);
        log.close().unwrap();
    }

    #[test]
    fn test_clean_compacts_by_key() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            segment_max_bytes: 128,
            compact: true,
            index_max_bytes: 4096,
            ..Default::default()
        };
        let log = CommitLog::open(dir.path(), config).unwrap();
        for i in 0..12 {
            log.append(vec![Message::with_key(
                "the-only-key",
                format!("value-{i:02}-padded-for-size-xxxxxxxx"),
            )])
            .unwrap();
        }
        log.set_high_watermark(log.leo());
        let sealed_before: i64 = {
            let segments = log.segments.read().clone();
            segments[..segments.len() - 1]
                .iter()
                .map(|s| s.message_count())
                .sum()
        };
        assert!(sealed_before > 1);

        log.clean().unwrap();

        let segments = log.segments.read().clone();
        let sealed_after: i64 = segments[..segments.len() - 1]
            .iter()
            .map(|s| s.message_count())
            .sum();
        // One key: at most one surviving message per sealed segment run.
        assert!(sealed_after < sealed_before);
        log.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_io() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        log.append(messages(&["a"])).unwrap();
        log.close().unwrap();
        log.close().unwrap();
        assert!(matches!(
            log.append(messages(&["b"])),
            Err(RillError::CommitLogClosed)
        ));
    }

    #[test]
    fn test_delete_removes_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partition-0");
        let log = CommitLog::open(&path, LogConfig::default()).unwrap();
        log.append(messages(&["a"])).unwrap();
        log.delete().unwrap();
        assert!(!path.exists());
        assert!(matches!(
            log.append(messages(&["b"])),
            Err(RillError::CommitLogDeleted)
        ));
    }

    #[test]
    fn test_interrupted_replacement_is_discarded_on_open() {
        let dir = tempdir().unwrap();
        {
            let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
            log.append(messages(&["a"])).unwrap();
            log.close().unwrap();
        }
        fs::write(dir.path().join("00000000000000000000.log.cleaned"), b"junk").unwrap();
        fs::write(dir.path().join("00000000000000000000.index.cleaned"), b"junk").unwrap();

        let log = CommitLog::open(dir.path(), LogConfig::default()).unwrap();
        assert!(!dir.path().join("00000000000000000000.log.cleaned").exists());
        assert_eq!(log.leo(), 1);
        log.close().unwrap();
    }
}
