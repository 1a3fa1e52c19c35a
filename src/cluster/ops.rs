//! Consensus log envelope and snapshot types
//!
//! The consensus layer itself (transport, elections, quorum) is a
//! black-box dependency. The metadata FSM consumes exactly three things
//! from it: committed [`LogEntry`] values handed to `apply`, and the
//! [`ReplicatedLog`] view (`commit_index` / `first_index` / `entry`)
//! used once at startup to establish the recovery barrier.
//!
//! Operations are a closed set of tagged variants so dispatch is
//! exhaustive at compile time. Snapshots are JSON with a length prefix;
//! unknown fields survive a decode/encode round-trip so newer snapshots
//! can pass through older nodes.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RillError};

/// Everything that describes a partition in metadata: the unit of both
/// consensus commands and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Owning stream name.
    pub stream: String,

    /// Partition id within the stream.
    pub id: i32,

    /// Replica node ids.
    pub replicas: Vec<String>,

    /// In-sync replica node ids. Always contains the leader.
    pub isr: Vec<String>,

    /// Current leader node id, if one has been assigned.
    pub leader: Option<String>,

    /// Metadata epoch: bumped on every mutation, guards idempotency.
    #[serde(default)]
    pub epoch: u64,

    /// Epoch of the current leadership term.
    #[serde(default)]
    pub leader_epoch: u64,

    /// Whether the partition is paused to client writes.
    #[serde(default)]
    pub paused: bool,

    /// Fields added by newer versions, preserved across round-trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PartitionSpec {
    /// A spec with the given identity and replica set; the ISR starts as
    /// the full replica set.
    pub fn new(stream: impl Into<String>, id: i32, replicas: Vec<String>) -> Self {
        Self {
            stream: stream.into(),
            id,
            isr: replicas.clone(),
            replicas,
            leader: None,
            epoch: 0,
            leader_epoch: 0,
            paused: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Set the leader.
    pub fn with_leader(mut self, leader: impl Into<String>) -> Self {
        self.leader = Some(leader.into());
        self
    }
}

/// A metadata mutation carried through the consensus log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Create a partition (and its stream, when this is the stream's
    /// first partition). The partition's epochs are assigned from the
    /// entry index at apply time.
    CreatePartition { partition: PartitionSpec },

    /// Remove a replica from a partition's ISR.
    ShrinkIsr {
        stream: String,
        partition: i32,
        replica: String,
        epoch: u64,
    },

    /// Add a replica back to a partition's ISR.
    ExpandIsr {
        stream: String,
        partition: i32,
        replica: String,
        epoch: u64,
    },

    /// Change a partition's leader.
    ChangeLeader {
        stream: String,
        partition: i32,
        leader: String,
        epoch: u64,
    },

    /// Delete a stream and all of its partitions.
    DeleteStream { stream: String },

    /// Pause or resume stream partitions.
    PauseStream {
        stream: String,
        partitions: Vec<i32>,
        resume_all: bool,
    },
}

impl LogOp {
    /// Encode for a consensus log entry.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| RillError::Protocol(format!("log op encode failed: {e}")))
    }

    /// Decode from a consensus log entry.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RillError::Protocol(format!("log op decode failed: {e}")))
    }
}

/// The kind of a consensus log entry. Only command entries carry
/// operations; the consensus layer interleaves its own bookkeeping
/// entries, which the recovery barrier must skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// An application command ([`LogOp`]).
    Command,
    /// Consensus-internal bookkeeping (configuration changes, no-ops).
    Internal,
}

/// A committed consensus log entry as seen by the FSM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the consensus log. Strictly increasing; also used as
    /// the metadata epoch for newly created partitions.
    pub index: u64,

    /// Entry kind.
    pub entry_type: EntryType,

    /// Encoded [`LogOp`] for command entries; opaque otherwise.
    pub data: Vec<u8>,
}

impl LogEntry {
    /// A command entry wrapping the given op.
    pub fn command(index: u64, op: &LogOp) -> Result<Self> {
        Ok(Self {
            index,
            entry_type: EntryType::Command,
            data: op.encode()?,
        })
    }
}

/// The slice of the consensus layer the FSM reads: enough to scan the
/// durable log backwards when establishing the recovery barrier.
pub trait ReplicatedLog: Send + Sync {
    /// Index of the newest committed entry.
    fn commit_index(&self) -> u64;

    /// Index of the oldest retained entry, or 0 when the log is empty.
    fn first_index(&self) -> Result<u64>;

    /// Fetch the entry at `index`, or `None` when it has been compacted
    /// away.
    fn entry(&self, index: u64) -> Result<Option<LogEntry>>;
}

/// In-memory [`ReplicatedLog`] used in tests and by embedders that drive
/// the FSM directly. Entries are 1-indexed like most consensus
/// implementations.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: RwLock<Vec<LogEntry>>,
    commit_index: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the next index and mark it committed.
    /// Returns the entry, ready to hand to the FSM.
    pub fn commit(&self, entry_type: EntryType, data: Vec<u8>) -> LogEntry {
        let mut entries = self.entries.write();
        let entry = LogEntry {
            index: entries.len() as u64 + 1,
            entry_type,
            data,
        };
        entries.push(entry.clone());
        self.commit_index.store(entry.index, Ordering::Release);
        entry
    }

    /// Append and commit a command op.
    pub fn commit_op(&self, op: &LogOp) -> Result<LogEntry> {
        Ok(self.commit(EntryType::Command, op.encode()?))
    }
}

impl ReplicatedLog for MemoryLog {
    fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    fn first_index(&self) -> Result<u64> {
        let entries = self.entries.read();
        Ok(if entries.is_empty() { 0 } else { 1 })
    }

    fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        let entries = self.entries.read();
        if index == 0 || index as usize > entries.len() {
            return Ok(None);
        }
        Ok(Some(entries[index as usize - 1].clone()))
    }
}

/// Point-in-time capture of the full partition list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    /// Every partition across every stream.
    pub partitions: Vec<PartitionSpec>,

    /// Fields added by newer versions, preserved across round-trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MetadataSnapshot {
    /// Write the snapshot to `sink` as a 4-byte big-endian length prefix
    /// followed by the encoded body.
    pub fn persist(&self, sink: &mut impl Write) -> Result<()> {
        let body = serde_json::to_vec(self)
            .map_err(|e| RillError::Protocol(format!("snapshot encode failed: {e}")))?;
        let len = u32::try_from(body.len())
            .map_err(|_| RillError::Protocol("snapshot exceeds 4 GiB".to_string()))?;
        sink.write_all(&len.to_be_bytes())?;
        sink.write_all(&body)?;
        Ok(())
    }

    /// Read a snapshot previously written by [`MetadataSnapshot::persist`].
    pub fn read_from(source: &mut impl Read) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        source.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        source.read_exact(&mut body)?;
        serde_json::from_slice(&body)
            .map_err(|e| RillError::Protocol(format!("snapshot decode failed: {e}")))
    }
}
