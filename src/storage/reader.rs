//! Blocking message readers
//!
//! A [`Reader`] streams messages forward from a starting offset,
//! transitioning across segment boundaries transparently. In committed
//! mode (the default) it only returns offsets below the high watermark,
//! blocking until the HW advances; in uncommitted mode it reads up to the
//! log end offset and blocks for new data. Either way a reader parked at
//! the end of the log wakes when data arrives, when the log turns
//! readonly (committed mode observes [`RillError::CommitLogReadonly`]
//! once it has drained up to the LEO), or when the log is closed or
//! deleted.
//!
//! A reader that raced with compaction or truncation sees
//! [`RillError::SegmentReplaced`] from its segment, re-resolves its
//! position through the log, and retries; the caller never observes the
//! retry.

use std::sync::Arc;

use crate::error::{Result, RillError};
use crate::storage::commit_log::CommitLog;
use crate::storage::message::{FrameHeader, Message, FRAME_HEADER_LEN};
use crate::storage::segment::{Segment, WaiterId};

/// A forward reader over a commit log.
pub struct Reader {
    log: Arc<CommitLog>,
    /// Next offset to deliver.
    offset: i64,
    uncommitted: bool,
    segment: Arc<Segment>,
    /// Byte position of the next frame in `segment`.
    position: i64,
    waiter: WaiterId,
}

impl Reader {
    pub(crate) fn new(log: Arc<CommitLog>, offset: i64, uncommitted: bool) -> Result<Self> {
        let (segment, position, offset) = log.position_for(offset.max(0));
        Ok(Self {
            log,
            offset,
            uncommitted,
            segment,
            position,
            waiter: WaiterId::next(),
        })
    }

    /// The offset the next call to [`Reader::read_message`] will return
    /// (or wait for).
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Whether this reader returns uncommitted messages.
    pub fn is_uncommitted(&self) -> bool {
        self.uncommitted
    }

    /// Read the next message, blocking until one is available. Returns
    /// [`RillError::CommitLogReadonly`] once a committed reader has
    /// drained a readonly log, and [`RillError::CommitLogClosed`] /
    /// [`RillError::CommitLogDeleted`] after the log is torn down.
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            self.log.ensure_open()?;

            let limit = if self.uncommitted {
                i64::MAX
            } else {
                let hw = self.log.high_watermark();
                if self.offset >= hw {
                    if self.log.is_readonly() && self.offset >= self.log.leo() {
                        return Err(RillError::CommitLogReadonly);
                    }
                    // Block until the HW moves. Entering readonly wakes us
                    // so the check above can run; a reader still below the
                    // LEO goes back to waiting.
                    let rx = self.log.wait_for_hw(self.waiter, hw, self.offset);
                    let _ = rx.recv();
                    continue;
                }
                hw
            };

            if self.uncommitted && self.offset >= self.log.leo() {
                // Park on the active segment until data arrives or the
                // segment seals. Readonly mode does not affect uncommitted
                // readers; only close/delete terminates them.
                let (active, end) = self.log.active_end();
                let rx = active.wait_for_data(self.waiter, end);
                let _ = rx.recv();
                continue;
            }

            match self.try_read_frame(limit) {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => continue,
                Err(RillError::SegmentReplaced) | Err(RillError::SegmentClosed) => {
                    // Compaction, truncation, or retention moved the data
                    // out from under us; re-resolve and retry.
                    self.log.ensure_open()?;
                    self.reposition();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Attempt to read the frame at the current position. Returns
    /// `Ok(None)` when the reader advanced (segment transition, skipped
    /// frame, or a frame at or beyond `limit`) and should loop.
    fn try_read_frame(&mut self, limit: i64) -> Result<Option<Message>> {
        if self.segment.is_replaced() {
            // The stale segment's byte positions no longer mean anything;
            // resolve against its replacement before deciding anything.
            self.reposition();
            return Ok(None);
        }
        if self.position >= self.segment.position() {
            match self.log.segment_after(self.segment.base_offset()) {
                Some(next) => {
                    self.position = match next.find_entry(self.offset) {
                        Ok(entry) => entry.position,
                        Err(_) => 0,
                    };
                    self.segment = next;
                }
                // The gating checks said data exists, so the segment list
                // changed under us (e.g. truncation); resolve afresh.
                None => self.reposition(),
            }
            return Ok(None);
        }

        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        self.segment.read_at(&mut header_buf, self.position)?;
        let header = FrameHeader::decode(&header_buf)?;

        if header.offset >= limit {
            // The next surviving frame is not yet committed (compaction
            // can leave gaps right below the HW); wait for the HW to
            // reach it rather than surface an uncommitted message.
            self.offset = header.offset;
            return Ok(None);
        }

        let mut payload = vec![0u8; header.size as usize];
        self.segment
            .read_at(&mut payload, self.position + FRAME_HEADER_LEN as i64)?;
        self.position += header.frame_len() as i64;

        if header.offset < self.offset {
            // Frame below the requested offset (index granularity or a
            // clamped start); skip forward.
            return Ok(None);
        }

        let message = Message::decode(header, &payload)?;
        self.offset = message.offset + 1;
        Ok(Some(message))
    }

    fn reposition(&mut self) {
        let (segment, position, offset) = self.log.position_for(self.offset);
        self.segment = segment;
        self.position = position;
        self.offset = offset;
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.segment.remove_waiter(self.waiter);
        self.log.remove_hw_waiter(self.waiter);
        self.log.remove_leo_waiter(self.waiter);
    }
}
