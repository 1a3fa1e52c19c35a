//! Stream partitions
//!
//! A [`Partition`] is the metadata-side object for one `(stream, id)`
//! pair: its replica set, ISR, leader, epochs, and paused flag, plus the
//! local [`CommitLog`] when this node is one of the replicas. The FSM is
//! the only writer of partition metadata; readers (snapshots, client
//! lookups) go through the same `RwLock`.
//!
//! Partitions created during consensus-log replay are *recovered*: their
//! commit logs stay unopened and no role is assumed until the FSM
//! crosses the recovery barrier and calls [`Partition::start_recovered`],
//! so a half-replayed node never serves from intermediate state.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::cluster::ops::PartitionSpec;
use crate::config::ServerConfig;
use crate::error::{Result, RillError};
use crate::storage::commit_log::CommitLog;

struct PartitionState {
    isr: Vec<String>,
    leader: Option<String>,
    leader_epoch: u64,
    epoch: u64,
    paused: bool,
    started: bool,
    pending_recovery: bool,
    closed: bool,
    extra: serde_json::Map<String, serde_json::Value>,
}

/// One partition of a stream: metadata plus the local commit log on
/// replica nodes.
pub struct Partition {
    stream: String,
    id: i32,
    replicas: Vec<String>,
    node_id: String,
    log_dir: PathBuf,
    log_config: crate::config::LogConfig,
    log: Mutex<Option<Arc<CommitLog>>>,
    state: RwLock<PartitionState>,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[stream={}, partition={}]", self.stream, self.id)
    }
}

impl Partition {
    /// Create a partition from its spec. Unless `recovered` is set, the
    /// partition starts immediately: the commit log opens (on replicas)
    /// and the current role is assumed. Recovered partitions wait for
    /// [`Partition::start_recovered`].
    pub(crate) fn create(
        spec: &PartitionSpec,
        config: &ServerConfig,
        recovered: bool,
    ) -> Result<Self> {
        let log_dir = config
            .data_dir
            .join("streams")
            .join(&spec.stream)
            .join(spec.id.to_string());
        let partition = Self {
            stream: spec.stream.clone(),
            id: spec.id,
            replicas: spec.replicas.clone(),
            node_id: config.node_id.clone(),
            log_dir,
            log_config: config.log.clone(),
            log: Mutex::new(None),
            state: RwLock::new(PartitionState {
                isr: spec.isr.clone(),
                leader: spec.leader.clone(),
                leader_epoch: spec.leader_epoch,
                epoch: spec.epoch,
                paused: spec.paused,
                started: false,
                pending_recovery: recovered,
                closed: false,
                extra: spec.extra.clone(),
            }),
        };
        if !recovered {
            partition.start()?;
        }
        Ok(partition)
    }

    /// Owning stream name.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Partition id within the stream.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Replica node ids.
    pub fn replicas(&self) -> &[String] {
        &self.replicas
    }

    /// Whether the local node is one of the replicas.
    pub fn is_replica(&self) -> bool {
        self.replicas.iter().any(|r| r == &self.node_id)
    }

    /// Whether the local node is the current leader.
    pub fn is_leader(&self) -> bool {
        self.state.read().leader.as_deref() == Some(self.node_id.as_str())
    }

    /// Current leader node id, if any.
    pub fn leader(&self) -> Option<String> {
        self.state.read().leader.clone()
    }

    /// Current ISR membership.
    pub fn isr(&self) -> Vec<String> {
        self.state.read().isr.clone()
    }

    /// Whether `replica` is in the ISR.
    pub fn in_isr(&self, replica: &str) -> bool {
        self.state.read().isr.iter().any(|r| r == replica)
    }

    /// Metadata epoch of the last applied mutation.
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Bump the metadata epoch.
    pub fn set_epoch(&self, epoch: u64) {
        self.state.write().epoch = epoch;
    }

    /// Epoch of the current leadership term.
    pub fn leader_epoch(&self) -> u64 {
        self.state.read().leader_epoch
    }

    /// Whether the partition is paused to client writes.
    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    /// Pause or resume client writes.
    pub fn set_paused(&self, paused: bool) {
        self.state.write().paused = paused;
        debug!(partition = %self, paused, "Partition pause toggled");
    }

    /// The local commit log, present on started replicas.
    pub fn commit_log(&self) -> Option<Arc<CommitLog>> {
        self.log.lock().clone()
    }

    /// Start a partition created during recovery: open the commit log
    /// and assume the current role. Idempotent; returns whether this
    /// call performed the deferred start.
    pub fn start_recovered(&self) -> Result<bool> {
        {
            let state = self.state.read();
            if !state.pending_recovery || state.started {
                return Ok(false);
            }
        }
        self.start()?;
        self.state.write().pending_recovery = false;
        Ok(true)
    }

    /// Open the commit log (on replicas) and assume the role the current
    /// metadata assigns: a local leader records its leadership term in
    /// the log, a follower begins from its replicated state. Idempotent.
    fn start(&self) -> Result<()> {
        {
            let state = self.state.read();
            if state.started || state.closed {
                return Ok(());
            }
        }
        if self.is_replica() {
            let log = CommitLog::open(&self.log_dir, self.log_config.clone())?;
            *self.log.lock() = Some(log);
        }
        let (is_leader, leader_epoch) = {
            let mut state = self.state.write();
            state.started = true;
            (
                state.leader.as_deref() == Some(self.node_id.as_str()),
                state.leader_epoch,
            )
        };
        if is_leader {
            if let Some(log) = self.commit_log() {
                log.new_leader_epoch(leader_epoch)?;
            }
        }
        info!(
            partition = %self,
            leader = is_leader,
            replica = self.is_replica(),
            "Partition started"
        );
        Ok(())
    }

    /// Remove a replica from the ISR. The replica must be a member of
    /// the replica set.
    pub fn remove_from_isr(&self, replica: &str) -> Result<()> {
        if !self.replicas.iter().any(|r| r == replica) {
            return Err(RillError::ReplicaNotFound);
        }
        let mut state = self.state.write();
        state.isr.retain(|r| r != replica);
        Ok(())
    }

    /// Add a replica back to the ISR. The replica must be a member of
    /// the replica set.
    pub fn add_to_isr(&self, replica: &str) -> Result<()> {
        if !self.replicas.iter().any(|r| r == replica) {
            return Err(RillError::ReplicaNotFound);
        }
        let mut state = self.state.write();
        if !state.isr.iter().any(|r| r == replica) {
            state.isr.push(replica.to_string());
        }
        Ok(())
    }

    /// Install a new leader for the given leadership epoch. When the
    /// local node becomes leader, the new term is recorded in the commit
    /// log's leader-epoch history; truncation of a divergent suffix is
    /// driven by the replication protocol before the HW advances.
    pub fn set_leader(&self, leader: impl Into<String>, epoch: u64) -> Result<()> {
        let leader = leader.into();
        let becomes_local_leader = {
            let mut state = self.state.write();
            state.leader = Some(leader.clone());
            state.leader_epoch = epoch;
            state.started && leader == self.node_id
        };
        if becomes_local_leader {
            if let Some(log) = self.commit_log() {
                log.new_leader_epoch(epoch)?;
            }
        }
        debug!(partition = %self, leader = %leader, leader_epoch = epoch, "Leader changed");
        Ok(())
    }

    /// Snapshot this partition's metadata.
    pub fn spec(&self) -> PartitionSpec {
        let state = self.state.read();
        PartitionSpec {
            stream: self.stream.clone(),
            id: self.id,
            replicas: self.replicas.clone(),
            isr: state.isr.clone(),
            leader: state.leader.clone(),
            epoch: state.epoch,
            leader_epoch: state.leader_epoch,
            paused: state.paused,
            extra: state.extra.clone(),
        }
    }

    /// Close the partition and its commit log. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        if let Some(log) = self.log.lock().take() {
            log.close()?;
        }
        Ok(())
    }

    /// Close the partition and remove its data from the filesystem.
    pub fn delete(&self) -> Result<()> {
        let log = self.log.lock().take();
        {
            let mut state = self.state.write();
            state.closed = true;
        }
        match log {
            Some(log) => log.delete()?,
            None => {
                if self.log_dir.exists() {
                    fs::remove_dir_all(&self.log_dir)
                        .map_err(|e| RillError::io("remove_dir_all", &self.log_dir, e))?;
                }
            }
        }
        debug!(partition = %self, "Partition deleted");
        Ok(())
    }
}
