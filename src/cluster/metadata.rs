//! In-memory metadata store
//!
//! The authoritative per-node view of streams and partitions. Only the
//! FSM mutates it (applies are serialized by consensus); snapshots and
//! client lookups read it concurrently through the store's `RwLock`.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cluster::ops::PartitionSpec;
use crate::cluster::partition::Partition;
use crate::config::ServerConfig;
use crate::error::{Result, RillError};

struct Stream {
    partitions: HashMap<i32, Arc<Partition>>,
}

/// Node-local store of stream and partition metadata.
pub struct MetadataStore {
    config: ServerConfig,
    streams: RwLock<HashMap<String, Stream>>,
}

impl MetadataStore {
    /// Create an empty store for this node.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            streams: RwLock::new(HashMap::new()),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Add a partition, creating its stream on first use. Fails with
    /// [`RillError::PartitionExists`] when the `(stream, id)` pair is
    /// already present. Recovered partitions are created but not started
    /// until [`Partition::start_recovered`] runs.
    pub fn add_partition(&self, spec: &PartitionSpec, recovered: bool) -> Result<Arc<Partition>> {
        let mut streams = self.streams.write();
        let stream = streams
            .entry(spec.stream.clone())
            .or_insert_with(|| Stream {
                partitions: HashMap::new(),
            });
        if stream.partitions.contains_key(&spec.id) {
            return Err(RillError::PartitionExists);
        }
        let partition = Arc::new(Partition::create(spec, &self.config, recovered)?);
        stream.partitions.insert(spec.id, Arc::clone(&partition));
        debug!(partition = %partition, recovered, "Partition added to metadata store");
        Ok(partition)
    }

    /// Look up a partition.
    pub fn get_partition(&self, stream: &str, id: i32) -> Option<Arc<Partition>> {
        self.streams
            .read()
            .get(stream)
            .and_then(|s| s.partitions.get(&id))
            .cloned()
    }

    /// The partitions of a stream, or `None` when the stream is unknown.
    pub fn get_stream(&self, stream: &str) -> Option<Vec<Arc<Partition>>> {
        self.streams.read().get(stream).map(|s| {
            let mut partitions: Vec<_> = s.partitions.values().cloned().collect();
            partitions.sort_by_key(|p| p.id());
            partitions
        })
    }

    /// Names of all known streams, sorted.
    pub fn get_streams(&self) -> Vec<String> {
        let mut names: Vec<_> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every partition across every stream, ordered by stream then id.
    pub fn get_all_partitions(&self) -> Vec<Arc<Partition>> {
        let streams = self.streams.read();
        let mut partitions: Vec<_> = streams
            .values()
            .flat_map(|s| s.partitions.values().cloned())
            .collect();
        partitions.sort_by(|a, b| {
            a.stream()
                .cmp(b.stream())
                .then_with(|| a.id().cmp(&b.id()))
        });
        partitions
    }

    /// Close a stream's partitions, delete their data, and drop the
    /// stream. Fails with [`RillError::StreamNotFound`] for an unknown
    /// stream.
    pub fn close_and_delete_stream(&self, name: &str) -> Result<()> {
        let stream = self
            .streams
            .write()
            .remove(name)
            .ok_or(RillError::StreamNotFound)?;
        for partition in stream.partitions.values() {
            partition.delete()?;
        }
        let stream_dir = self.config.data_dir.join("streams").join(name);
        if stream_dir.exists() {
            fs::remove_dir_all(&stream_dir)
                .map_err(|e| RillError::io("remove_dir_all", &stream_dir, e))?;
        }
        info!(stream = name, "Stream deleted");
        Ok(())
    }

    /// Pause the given partitions of a stream (every partition when the
    /// list is empty), or resume all of them. Unknown streams fail with
    /// [`RillError::StreamNotFound`]; unknown partition ids with
    /// [`RillError::PartitionNotFound`].
    pub fn pause_stream(&self, name: &str, partitions: &[i32], resume_all: bool) -> Result<()> {
        let streams = self.streams.read();
        let stream = streams.get(name).ok_or(RillError::StreamNotFound)?;

        if resume_all {
            for partition in stream.partitions.values() {
                partition.set_paused(false);
            }
            return Ok(());
        }
        if partitions.is_empty() {
            for partition in stream.partitions.values() {
                partition.set_paused(true);
            }
            return Ok(());
        }
        for id in partitions {
            let partition = stream
                .partitions
                .get(id)
                .ok_or(RillError::PartitionNotFound)?;
            partition.set_paused(true);
        }
        Ok(())
    }

    /// Close every partition and drop all metadata. Used by snapshot
    /// restore; on-disk data is left for the re-added partitions to
    /// reopen.
    pub fn reset(&self) -> Result<()> {
        let mut streams = self.streams.write();
        for stream in streams.values() {
            for partition in stream.partitions.values() {
                partition.close()?;
            }
        }
        streams.clear();
        Ok(())
    }
}
