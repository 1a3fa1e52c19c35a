//! Metadata state machine
//!
//! [`Fsm`] applies committed consensus log entries to the
//! [`MetadataStore`]. Every replica applies the same entries in the same
//! order, so application must be deterministic and idempotent: epoch
//! checks make re-applied mutations no-ops, and recognized sentinel
//! errors ([`RillError::PartitionExists`], [`RillError::StreamNotFound`],
//! [`RillError::PartitionNotFound`]) are returned to the proposer as the
//! apply result rather than treated as failures. Any other apply error
//! is fatal — continuing would fork this replica's state from the rest
//! of the cluster — and aborts the process unless a shutdown is in
//! progress.
//!
//! # Recovery barrier
//!
//! On restart the consensus layer replays already-committed entries
//! through `apply`. Side effects with external visibility (starting
//! partitions, per-op logging) must wait until the replay catches up to
//! what was committed before the restart. The first `apply` call scans
//! the consensus log backwards from the commit index for the newest
//! committed command entry; everything up to and including that index is
//! applied in recovered mode (partitions created but not started).
//! Applying the barrier entry itself finishes recovery and starts every
//! recovered partition. A fresh cluster — where the entry being applied
//! *is* the newest commit — has no barrier.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::metadata::MetadataStore;
use crate::cluster::ops::{
    EntryType, LogEntry, LogOp, MetadataSnapshot, PartitionSpec, ReplicatedLog,
};
use crate::error::{Result, RillError};

/// Result of applying a consensus log entry.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The operation was applied (or skipped as an idempotent no-op).
    Applied,
    /// The operation was rejected with a recognized sentinel, returned
    /// to the proposer. The state machine is unaffected.
    Rejected(RillError),
}

struct RecoveryState {
    started: bool,
    latest_recovered_index: Option<u64>,
}

/// The replicated metadata state machine.
pub struct Fsm {
    metadata: Arc<MetadataStore>,
    raft: Arc<dyn ReplicatedLog>,
    log_recovery: bool,
    recovery: Mutex<RecoveryState>,
    shutdown: AtomicBool,
}

impl Fsm {
    /// Build the FSM over a metadata store and the consensus log view.
    /// `log_recovery` re-enables per-operation logging during replay.
    pub fn new(metadata: Arc<MetadataStore>, raft: Arc<dyn ReplicatedLog>, log_recovery: bool) -> Self {
        Self {
            metadata,
            raft,
            log_recovery,
            recovery: Mutex::new(RecoveryState {
                started: false,
                latest_recovered_index: None,
            }),
            shutdown: AtomicBool::new(false),
        }
    }

    /// The metadata store this FSM mutates.
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    /// Mark the process as shutting down: subsequent fatal apply errors
    /// are returned instead of aborting.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Apply a committed entry. Invoked by the consensus layer, which
    /// serializes calls; re-invocation with already-applied entries
    /// (restart replay) is expected and idempotent.
    ///
    /// # Panics
    /// Aborts on a non-sentinel apply failure unless [`Fsm::shutdown`]
    /// was called first: a replica that cannot apply a committed entry
    /// cannot stay consistent with the cluster.
    pub fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        let (recovered, finish_boundary) = {
            let mut recovery = self.recovery.lock();
            if !recovery.started {
                let latest = match self.recover_latest_committed_entry(entry.index) {
                    Ok(latest) => latest,
                    Err(e) => return self.fail(e),
                };
                recovery.latest_recovered_index = latest.map(|l| l.index);
                recovery.started = true;
                if recovery.latest_recovered_index.is_some() {
                    debug!("fsm: replaying consensus log");
                }
            }
            let recovered = recovery
                .latest_recovered_index
                .map_or(false, |latest| entry.index <= latest);
            let finish = recovery.latest_recovered_index == Some(entry.index);
            if finish {
                recovery.latest_recovered_index = None;
            }
            (recovered, finish)
        };

        if entry.entry_type != EntryType::Command {
            return self.fail(RillError::Protocol(format!(
                "non-command entry {} handed to apply",
                entry.index
            )));
        }
        let op = match LogOp::decode(&entry.data) {
            Ok(op) => op,
            Err(e) => return self.fail(e),
        };

        let outcome = match self.apply_op(&op, entry.index, recovered) {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(e),
        };

        if finish_boundary {
            match self.finished_recovery() {
                Ok(count) => debug!(
                    streams = count,
                    "fsm: finished replaying consensus log"
                ),
                Err(e) => return self.fail(e),
            }
        }
        Ok(outcome)
    }

    fn fail(&self, e: RillError) -> Result<ApplyOutcome> {
        if self.is_shutdown() {
            return Err(e);
        }
        panic!("fsm: failed to apply consensus log entry: {e}");
    }

    /// Find the newest committed command entry by scanning the consensus
    /// log backwards from the commit index. Returns `None` for a fresh
    /// cluster: an empty log, or one whose first committed command is the
    /// entry being applied right now.
    fn recover_latest_committed_entry(&self, apply_index: u64) -> Result<Option<LogEntry>> {
        let commit_index = self.raft.commit_index();
        let first_index = self.raft.first_index()?;
        if first_index == 0 {
            return Ok(None);
        }
        let mut index = commit_index;
        while index >= first_index {
            if index == apply_index && apply_index == commit_index {
                // We are committing the first command of a fresh log.
                return Ok(None);
            }
            if let Some(entry) = self.raft.entry(index)? {
                if entry.entry_type == EntryType::Command {
                    return Ok(Some(entry));
                }
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }
        Ok(None)
    }

    fn apply_op(&self, op: &LogOp, index: u64, recovered: bool) -> Result<ApplyOutcome> {
        match op {
            LogOp::CreatePartition { partition } => {
                self.apply_create_partition(partition, index, recovered)
            }
            LogOp::ShrinkIsr {
                stream,
                partition,
                replica,
                epoch,
            } => {
                let p = self.partition(stream, *partition)?;
                if p.epoch() >= *epoch {
                    return Ok(ApplyOutcome::Applied);
                }
                p.remove_from_isr(replica)?;
                p.set_epoch(*epoch);
                if self.should_log(recovered) {
                    warn!(partition = %p, replica = %replica, epoch, "fsm: removed replica from ISR");
                }
                Ok(ApplyOutcome::Applied)
            }
            LogOp::ExpandIsr {
                stream,
                partition,
                replica,
                epoch,
            } => {
                let p = self.partition(stream, *partition)?;
                if p.epoch() >= *epoch {
                    return Ok(ApplyOutcome::Applied);
                }
                p.add_to_isr(replica)?;
                p.set_epoch(*epoch);
                if self.should_log(recovered) {
                    info!(partition = %p, replica = %replica, epoch, "fsm: added replica to ISR");
                }
                Ok(ApplyOutcome::Applied)
            }
            LogOp::ChangeLeader {
                stream,
                partition,
                leader,
                epoch,
            } => {
                let p = self.partition(stream, *partition)?;
                if p.epoch() >= *epoch {
                    return Ok(ApplyOutcome::Applied);
                }
                p.set_leader(leader.clone(), *epoch)?;
                p.set_epoch(*epoch);
                if self.should_log(recovered) {
                    debug!(partition = %p, leader = %leader, epoch, "fsm: changed partition leader");
                }
                Ok(ApplyOutcome::Applied)
            }
            LogOp::DeleteStream { stream } => {
                match self.metadata.close_and_delete_stream(stream) {
                    Ok(()) => {
                        if self.should_log(recovered) {
                            debug!(stream = %stream, "fsm: deleted stream");
                        }
                        Ok(ApplyOutcome::Applied)
                    }
                    Err(RillError::StreamNotFound) => {
                        Ok(ApplyOutcome::Rejected(RillError::StreamNotFound))
                    }
                    Err(e) => Err(e),
                }
            }
            LogOp::PauseStream {
                stream,
                partitions,
                resume_all,
            } => match self.metadata.pause_stream(stream, partitions, *resume_all) {
                Ok(()) => {
                    if self.should_log(recovered) {
                        debug!(stream = %stream, resume_all, "fsm: paused stream");
                    }
                    Ok(ApplyOutcome::Applied)
                }
                Err(e @ (RillError::StreamNotFound | RillError::PartitionNotFound)) => {
                    Ok(ApplyOutcome::Rejected(e))
                }
                Err(e) => Err(e),
            },
        }
    }

    fn apply_create_partition(
        &self,
        partition: &PartitionSpec,
        index: u64,
        recovered: bool,
    ) -> Result<ApplyOutcome> {
        let mut spec = partition.clone();
        spec.epoch = index;
        spec.leader_epoch = index;
        match self.metadata.add_partition(&spec, recovered) {
            Ok(p) => {
                if self.should_log(recovered) {
                    debug!(partition = %p, "fsm: created partition");
                }
                Ok(ApplyOutcome::Applied)
            }
            Err(RillError::PartitionExists) => {
                Ok(ApplyOutcome::Rejected(RillError::PartitionExists))
            }
            Err(e) => Err(e),
        }
    }

    fn partition(&self, stream: &str, id: i32) -> Result<Arc<crate::cluster::partition::Partition>> {
        self.metadata.get_partition(stream, id).ok_or_else(|| {
            RillError::Protocol(format!("no such partition [stream={stream}, partition={id}]"))
        })
    }

    fn should_log(&self, recovered: bool) -> bool {
        !recovered || self.log_recovery
    }

    /// Start every partition whose start was deferred during replay.
    /// Returns the number of streams with recovered partitions.
    fn finished_recovery(&self) -> Result<usize> {
        let mut recovered_streams = HashSet::new();
        for partition in self.metadata.get_all_partitions() {
            if partition.start_recovered()? {
                recovered_streams.insert(partition.stream().to_string());
            }
        }
        Ok(recovered_streams.len())
    }

    /// Capture a point-in-time snapshot of the metadata. Safe to call
    /// concurrently with `apply`: the partition list is captured under
    /// the store's read lock; encoding happens off-lock.
    pub fn snapshot(&self) -> Result<MetadataSnapshot> {
        let partitions = self
            .metadata
            .get_all_partitions()
            .iter()
            .map(|p| p.spec())
            .collect();
        Ok(MetadataSnapshot {
            partitions,
            extra: serde_json::Map::new(),
        })
    }

    /// Snapshot and write to `sink` in the length-prefixed wire format.
    pub fn persist_snapshot(&self, sink: &mut impl Write) -> Result<()> {
        self.snapshot()?.persist(sink)
    }

    /// Discard all metadata and rebuild it from a snapshot. Never called
    /// concurrently with `apply`.
    pub fn restore(&self, source: &mut impl Read) -> Result<()> {
        debug!("fsm: restoring metadata from snapshot");
        let snapshot = MetadataSnapshot::read_from(source)?;
        self.metadata.reset()?;
        let mut streams = HashSet::new();
        for spec in &snapshot.partitions {
            self.metadata.add_partition(spec, false)?;
            streams.insert(spec.stream.clone());
        }
        debug!(
            streams = streams.len(),
            "fsm: finished restoring metadata from snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ops::MemoryLog;
    use crate::config::ServerConfig;
    use tempfile::tempdir;

    fn fsm_over(dir: &std::path::Path) -> (Fsm, Arc<MemoryLog>) {
        let store = Arc::new(MetadataStore::new(ServerConfig::new("n1", dir)).unwrap());
        let raft = Arc::new(MemoryLog::new());
        (Fsm::new(store, raft.clone(), false), raft)
    }

    fn create_op(stream: &str, id: i32) -> LogOp {
        LogOp::CreatePartition {
            partition: PartitionSpec::new(stream, id, vec!["n1".to_string()]).with_leader("n1"),
        }
    }

    #[test]
    fn test_create_partition_assigns_epochs_from_index() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());

        // Burn a few indices so the command does not land at index 1.
        for _ in 0..41 {
            raft.commit(EntryType::Internal, Vec::new());
        }
        let entry = raft.commit_op(&create_op("orders", 0)).unwrap();
        assert_eq!(entry.index, 42);
        assert!(matches!(
            fsm.apply(&entry).unwrap(),
            ApplyOutcome::Applied
        ));

        let partition = fsm.metadata().get_partition("orders", 0).unwrap();
        assert_eq!(partition.epoch(), 42);
        assert_eq!(partition.leader_epoch(), 42);
    }

    #[test]
    fn test_create_partition_duplicate_is_rejected_not_fatal() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());

        let entry = raft.commit_op(&create_op("orders", 0)).unwrap();
        fsm.apply(&entry).unwrap();
        let duplicate = raft.commit_op(&create_op("orders", 0)).unwrap();
        match fsm.apply(&duplicate).unwrap() {
            ApplyOutcome::Rejected(RillError::PartitionExists) => {}
            other => panic!("expected PartitionExists rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_shrink_isr_is_idempotent_by_epoch() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetadataStore::new(ServerConfig::new("n1", dir.path())).unwrap());
        let raft = Arc::new(MemoryLog::new());
        let fsm = Fsm::new(store, raft.clone(), false);

        let create = raft
            .commit_op(&LogOp::CreatePartition {
                partition: PartitionSpec::new(
                    "orders",
                    0,
                    vec!["n1".to_string(), "n2".to_string()],
                )
                .with_leader("n1"),
            })
            .unwrap();
        fsm.apply(&create).unwrap();

        let shrink = LogOp::ShrinkIsr {
            stream: "orders".to_string(),
            partition: 0,
            replica: "n2".to_string(),
            epoch: 7,
        };
        let entry = raft.commit_op(&shrink).unwrap();
        fsm.apply(&entry).unwrap();

        let partition = fsm.metadata().get_partition("orders", 0).unwrap();
        assert!(!partition.in_isr("n2"));
        assert_eq!(partition.epoch(), 7);

        // Re-applying the same entry is a no-op.
        fsm.apply(&entry).unwrap();
        assert_eq!(partition.epoch(), 7);
        assert_eq!(partition.isr(), vec!["n1"]);
    }

    #[test]
    fn test_expand_isr_and_change_leader() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        let create = raft
            .commit_op(&LogOp::CreatePartition {
                partition: PartitionSpec::new(
                    "orders",
                    0,
                    vec!["n1".to_string(), "n2".to_string()],
                )
                .with_leader("n2"),
            })
            .unwrap();
        fsm.apply(&create).unwrap();
        let partition = fsm.metadata().get_partition("orders", 0).unwrap();
        partition.remove_from_isr("n2").unwrap();

        let expand = raft
            .commit_op(&LogOp::ExpandIsr {
                stream: "orders".to_string(),
                partition: 0,
                replica: "n2".to_string(),
                epoch: 5,
            })
            .unwrap();
        fsm.apply(&expand).unwrap();
        assert!(partition.in_isr("n2"));
        assert_eq!(partition.epoch(), 5);

        let change = raft
            .commit_op(&LogOp::ChangeLeader {
                stream: "orders".to_string(),
                partition: 0,
                leader: "n1".to_string(),
                epoch: 6,
            })
            .unwrap();
        fsm.apply(&change).unwrap();
        assert!(partition.is_leader());
        assert_eq!(partition.leader_epoch(), 6);
        assert_eq!(partition.epoch(), 6);
        // The local promotion landed in the leader-epoch history.
        let log = partition.commit_log().unwrap();
        assert_eq!(log.last_leader_epoch(), 6);

        // A stale leader change is skipped entirely.
        let stale = raft
            .commit_op(&LogOp::ChangeLeader {
                stream: "orders".to_string(),
                partition: 0,
                leader: "n2".to_string(),
                epoch: 6,
            })
            .unwrap();
        fsm.apply(&stale).unwrap();
        assert!(partition.is_leader());
    }

    #[test]
    fn test_delete_stream_sentinel() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        let entry = raft
            .commit_op(&LogOp::DeleteStream {
                stream: "ghost".to_string(),
            })
            .unwrap();
        match fsm.apply(&entry).unwrap() {
            ApplyOutcome::Rejected(RillError::StreamNotFound) => {}
            other => panic!("expected StreamNotFound rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_pause_stream_sentinels() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        let create = raft.commit_op(&create_op("orders", 0)).unwrap();
        fsm.apply(&create).unwrap();

        let pause = raft
            .commit_op(&LogOp::PauseStream {
                stream: "orders".to_string(),
                partitions: Vec::new(),
                resume_all: false,
            })
            .unwrap();
        fsm.apply(&pause).unwrap();
        assert!(fsm
            .metadata()
            .get_partition("orders", 0)
            .unwrap()
            .is_paused());

        let unknown = raft
            .commit_op(&LogOp::PauseStream {
                stream: "orders".to_string(),
                partitions: vec![9],
                resume_all: false,
            })
            .unwrap();
        match fsm.apply(&unknown).unwrap() {
            ApplyOutcome::Rejected(RillError::PartitionNotFound) => {}
            other => panic!("expected PartitionNotFound rejection, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "fsm: failed to apply")]
    fn test_unknown_partition_mutation_is_fatal() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        let entry = raft
            .commit_op(&LogOp::ShrinkIsr {
                stream: "ghost".to_string(),
                partition: 0,
                replica: "n2".to_string(),
                epoch: 1,
            })
            .unwrap();
        let _ = fsm.apply(&entry);
    }

    #[test]
    fn test_fatal_error_returned_during_shutdown() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        fsm.shutdown();
        let entry = raft
            .commit_op(&LogOp::ShrinkIsr {
                stream: "ghost".to_string(),
                partition: 0,
                replica: "n2".to_string(),
                epoch: 1,
            })
            .unwrap();
        assert!(fsm.apply(&entry).is_err());
    }

    #[test]
    fn test_garbage_entry_is_fatal_but_silent_on_shutdown() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        fsm.shutdown();
        let entry = raft.commit(EntryType::Command, b"not json".to_vec());
        assert!(matches!(fsm.apply(&entry), Err(RillError::Protocol(_))));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        for (stream, id) in [("orders", 0), ("orders", 1), ("events", 0)] {
            let entry = raft.commit_op(&create_op(stream, id)).unwrap();
            fsm.apply(&entry).unwrap();
        }

        let mut buf = Vec::new();
        fsm.persist_snapshot(&mut buf).unwrap();

        // Restore into a fresh store.
        let dir2 = tempdir().unwrap();
        let (fsm2, _) = fsm_over(dir2.path());
        fsm2.restore(&mut buf.as_slice()).unwrap();

        assert_eq!(fsm2.metadata().get_streams(), vec!["events", "orders"]);
        assert_eq!(fsm2.metadata().get_stream("orders").unwrap().len(), 2);
        let original = fsm.metadata().get_partition("orders", 1).unwrap().spec();
        let restored = fsm2.metadata().get_partition("orders", 1).unwrap().spec();
        assert_eq!(original, restored);
    }

    #[test]
    fn test_recovery_barrier_defers_partition_start() {
        let dir = tempdir().unwrap();
        let raft = Arc::new(MemoryLog::new());
        // Two committed commands from a previous incarnation.
        let first = raft.commit_op(&create_op("orders", 0)).unwrap();
        let second = raft.commit_op(&create_op("orders", 1)).unwrap();

        let store = Arc::new(MetadataStore::new(ServerConfig::new("n1", dir.path())).unwrap());
        let fsm = Fsm::new(store, Arc::clone(&raft) as Arc<dyn ReplicatedLog>, false);

        // Replay: the barrier is the newest committed command entry, so
        // both existing entries apply in recovered mode.
        fsm.apply(&first).unwrap();
        let p0 = fsm.metadata().get_partition("orders", 0).unwrap();
        // Recovered partitions are not started yet: no commit log.
        assert!(p0.commit_log().is_none());

        fsm.apply(&second).unwrap();
        // Crossing the barrier (entry 2) starts all recovered partitions.
        assert!(p0.commit_log().is_some());
        assert!(fsm
            .metadata()
            .get_partition("orders", 1)
            .unwrap()
            .commit_log()
            .is_some());

        // An entry committed after recovery starts immediately.
        let third = raft.commit_op(&create_op("events", 0)).unwrap();
        fsm.apply(&third).unwrap();
        assert!(fsm
            .metadata()
            .get_partition("events", 0)
            .unwrap()
            .commit_log()
            .is_some());
    }

    #[test]
    fn test_fresh_cluster_has_no_barrier() {
        let dir = tempdir().unwrap();
        let (fsm, raft) = fsm_over(dir.path());
        // The first command of a fresh log applies in normal mode.
        let entry = raft.commit_op(&create_op("orders", 0)).unwrap();
        fsm.apply(&entry).unwrap();
        let partition = fsm.metadata().get_partition("orders", 0).unwrap();
        assert!(partition.commit_log().is_some());
    }
}
