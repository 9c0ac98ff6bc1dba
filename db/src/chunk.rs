//! Detached views of chunk data handed out to readers.
//!
//! Nothing in here points back into the catalog: a [`ChunkView`] stays valid after all
//! catalog locks are released and after the chunk it came from is gone.
use std::sync::Arc;

use data_types::{
    chunk_metadata::{ChunkAddr, ChunkStorage},
    timestamp::TimestampRange,
    write::{Row, rows_timestamp_range},
};
use mutable_buffer::snapshot::ChunkSnapshot;
use persistence_windows::min_max_sequence::{MinMaxSequence, union_all};
use preserved_catalog::{paths::ArtifactPath, pin::ArtifactPin};
use serde::{Deserialize, Serialize};

/// Immutable rows of a closed chunk.
///
/// This is also the content of a chunk artifact in the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    rows: Vec<Row>,
    time_range: Option<TimestampRange>,
    sequence: Option<MinMaxSequence>,
}

impl ChunkData {
    pub fn new(rows: Vec<Row>, sequence: Option<MinMaxSequence>) -> Self {
        let time_range = rows_timestamp_range(&rows);
        Self {
            rows,
            time_range,
            sequence,
        }
    }

    /// Combine the rows of `inputs` into one, ordered by timestamp.
    ///
    /// Rows with equal timestamps keep the order of `inputs`.
    pub fn merge(inputs: &[Arc<Self>]) -> Self {
        let mut rows: Vec<_> = inputs.iter().flat_map(|d| d.rows.iter().cloned()).collect();
        rows.sort_by_key(|r| r.time);

        let sequence = union_all(inputs.iter().filter_map(|d| d.sequence.as_ref()));
        Self::new(rows, sequence)
    }

    /// Same rows, ordered by timestamp
    pub fn sorted(&self) -> Self {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|r| r.time);
        Self {
            rows,
            time_range: self.time_range,
            sequence: self.sequence,
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn time_range(&self) -> Option<TimestampRange> {
        self.time_range
    }

    pub fn sequence(&self) -> Option<MinMaxSequence> {
        self.sequence
    }
}

impl From<&ChunkSnapshot> for ChunkData {
    fn from(snapshot: &ChunkSnapshot) -> Self {
        Self {
            rows: snapshot.rows().to_vec(),
            time_range: snapshot.time_range(),
            sequence: snapshot.sequence(),
        }
    }
}

/// Shared handle to the data of an immutable chunk.
///
/// Holding a reference to an object store chunk keeps its artifact from being deleted, even
/// after the chunk was compacted away or dropped from the catalog.
#[derive(Debug, Clone)]
pub struct ChunkReference {
    addr: ChunkAddr,
    storage: ChunkStorage,
    data: Arc<ChunkData>,
    pin: Option<Arc<ArtifactPin>>,
}

impl ChunkReference {
    pub(crate) fn new(
        addr: ChunkAddr,
        storage: ChunkStorage,
        data: Arc<ChunkData>,
        pin: Option<Arc<ArtifactPin>>,
    ) -> Self {
        Self {
            addr,
            storage,
            data,
            pin,
        }
    }

    pub fn addr(&self) -> &ChunkAddr {
        &self.addr
    }

    pub fn storage(&self) -> ChunkStorage {
        self.storage
    }

    pub fn data(&self) -> &Arc<ChunkData> {
        &self.data
    }

    /// The artifact backing this chunk, if it was persisted
    pub fn artifact_path(&self) -> Option<&ArtifactPath> {
        self.pin.as_ref().map(|pin| pin.path())
    }
}

/// What a reader gets for one chunk: a private copy of an open chunk, or a shared reference
/// to an immutable one.
#[derive(Debug, Clone)]
pub enum ChunkView {
    Snapshot(Arc<ChunkSnapshot>),
    Reference(ChunkReference),
}

impl ChunkView {
    pub fn storage(&self) -> ChunkStorage {
        match self {
            Self::Snapshot(_) => ChunkStorage::OpenMutableBuffer,
            Self::Reference(r) => r.storage,
        }
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            Self::Snapshot(s) => s.rows(),
            Self::Reference(r) => r.data.rows(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows().len()
    }

    pub fn time_range(&self) -> Option<TimestampRange> {
        match self {
            Self::Snapshot(s) => s.time_range(),
            Self::Reference(r) => r.data.time_range(),
        }
    }

    pub fn sequence(&self) -> Option<MinMaxSequence> {
        match self {
            Self::Snapshot(s) => s.sequence(),
            Self::Reference(r) => r.data.sequence(),
        }
    }
}
