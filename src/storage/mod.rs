//! Storage engine for rill
//!
//! One [`CommitLog`] per partition: an append-only sequence of segments
//! (log + index file pairs), a monotone high watermark with a background
//! disk checkpointer, a leader-epoch history, blocking readers, and
//! retention/compaction via [`CommitLog::clean`].

pub mod checkpoint;
pub mod commit_log;
pub mod compaction;
pub mod index;
pub mod message;
pub mod reader;
pub mod retention;
pub mod segment;

pub use checkpoint::{EpochOffset, HW_CHECKPOINT_FILE, LEADER_EPOCH_FILE};
pub use commit_log::CommitLog;
pub use index::{Entry, ENTRY_WIDTH};
pub use message::{Header, Message};
pub use reader::Reader;
pub use segment::{Segment, WaiterId, CLEANED_SUFFIX, INDEX_SUFFIX, LOG_SUFFIX, TRUNCATED_SUFFIX};
