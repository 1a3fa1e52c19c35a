//! Cluster metadata layer for rill
//!
//! The replicated control plane: a consensus-driven [`Fsm`] applies
//! metadata mutations ([`ops::LogOp`]) to the node-local
//! [`MetadataStore`], which owns the [`Partition`] objects and, through
//! them, the per-partition commit logs.

pub mod fsm;
pub mod metadata;
pub mod ops;
pub mod partition;

pub use fsm::{ApplyOutcome, Fsm};
pub use metadata::MetadataStore;
pub use ops::{
    EntryType, LogEntry, LogOp, MemoryLog, MetadataSnapshot, PartitionSpec, ReplicatedLog,
};
pub use partition::Partition;
