//! Key-based log compaction
//!
//! Compaction rewrites sealed segments so that only the newest message
//! for each key survives, turning the log's head into a changelog while
//! its tail stays append-only. Keyless messages cannot be deduplicated
//! and are always retained, as is anything at or beyond the high
//! watermark (uncommitted messages must not be dropped).
//!
//! Each sealed segment is rewritten into a `.cleaned` shadow at the same
//! base offset and installed with [`Segment::replace`], so readers never
//! observe a half-compacted segment — at worst they see
//! `SegmentReplaced` and retry.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::Result;
use crate::storage::index::Entry;
use crate::storage::message::{FrameHeader, Message, FRAME_HEADER_LEN};
use crate::storage::segment::{Segment, SegmentScanner};

/// Compactor over a log's sealed segments.
#[derive(Debug, Default)]
pub(crate) struct Compactor;

impl Compactor {
    /// Compact the given sealed segments, deduplicating messages below
    /// `hw` by key. Returns the replacement segments, aligned one-to-one
    /// with the input; each input segment has already been replaced on
    /// disk and marked replaced in memory.
    pub fn compact(&self, sealed: &[Arc<Segment>], hw: i64) -> Result<Vec<Arc<Segment>>> {
        let latest = self.latest_offsets(sealed, hw)?;

        let mut replacements = Vec::with_capacity(sealed.len());
        for segment in sealed {
            let shadow = Arc::new(segment.cleaned()?);
            let mut scanner = SegmentScanner::new(Arc::clone(segment));
            let mut retained = 0i64;
            while let Some((frame, entry)) = scanner.scan()? {
                if !self.retain(&frame, &entry, &latest, hw)? {
                    continue;
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
                retained += 1;
            }
            let scanned = segment.message_count();
            shadow.replace(segment)?;
            shadow.seal();
            debug!(
                base_offset = segment.base_offset(),
                scanned,
                retained,
                "Segment compacted"
            );
            replacements.push(shadow);
        }
        Ok(replacements)
    }

    /// Newest offset per key among committed messages.
    fn latest_offsets(&self, sealed: &[Arc<Segment>], hw: i64) -> Result<HashMap<Bytes, i64>> {
        let mut latest = HashMap::new();
        for segment in sealed {
            let mut scanner = SegmentScanner::new(Arc::clone(segment));
            while let Some((frame, entry)) = scanner.scan()? {
                if entry.offset >= hw {
                    continue;
                }
                let message = decode_frame(&frame)?;
                if let Some(key) = message.key {
                    latest.insert(key, entry.offset);
                }
            }
        }
        Ok(latest)
    }

    fn retain(
        &self,
        frame: &[u8],
        entry: &Entry,
        latest: &HashMap<Bytes, i64>,
        hw: i64,
    ) -> Result<bool> {
        if entry.offset >= hw {
            return Ok(true);
        }
        let message = decode_frame(frame)?;
        Ok(match message.key {
            Some(key) => latest.get(&key) == Some(&entry.offset),
            None => true,
        })
    }
}

fn decode_frame(frame: &[u8]) -> Result<Message> {
    let header = FrameHeader::decode(frame)?;
    Message::decode(header, &frame[FRAME_HEADER_LEN..])
}
