//! # rill
//!
//! A replicated, append-only message log core. Clients publish ordered
//! batches of messages into named streams, each partitioned into
//! independent logs; consumers read committed messages in order with
//! at-least-once delivery.
//!
//! The crate provides the two subsystems that implement durability and
//! consistency:
//!
//! - **[`storage`]** — the per-partition commit log: a segmented,
//!   append-only store with fixed-width offset indexes, a monotone high
//!   watermark checkpointed to disk, a leader-epoch history, blocking
//!   readers, and retention/compaction.
//! - **[`cluster`]** — the replicated metadata state machine: a
//!   consensus-driven FSM that applies partition lifecycle, leadership,
//!   and ISR changes to an in-memory metadata store, with snapshot and
//!   restore support and a recovery barrier for startup replay.
//!
//! Consensus transport, the client-facing API, membership discovery, and
//! authentication are external collaborators: the FSM consumes committed
//! entries through the narrow [`cluster::ReplicatedLog`] view and nothing
//! else.
//!
//! ## Example
//!
//! ```no_run
//! use rill::{CommitLog, LogConfig, Message, Result};
//!
//! fn main() -> Result<()> {
//!     let log = CommitLog::open("/var/lib/rill/orders/0", LogConfig::default())?;
//!
//!     let offsets = log.append(vec![
//!         Message::with_key("user-1", "signed-up"),
//!         Message::with_key("user-2", "signed-up"),
//!     ])?;
//!     log.set_high_watermark(offsets[offsets.len() - 1] + 1);
//!
//!     let mut reader = log.new_reader(0, false)?;
//!     let message = reader.read_message()?;
//!     println!("offset {}: {:?}", message.offset, message.value);
//!
//!     log.close()
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod storage;

pub use cluster::{
    ApplyOutcome, EntryType, Fsm, LogEntry, LogOp, MemoryLog, MetadataSnapshot, MetadataStore,
    Partition, PartitionSpec, ReplicatedLog,
};
pub use config::{LogConfig, ServerConfig};
pub use error::{Result, RillError};
pub use storage::{CommitLog, Header, Message, Reader, WaiterId};
