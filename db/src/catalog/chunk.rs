//! The catalog representation of a Chunk
use std::sync::Arc;

use data_types::{
    chunk_metadata::{ChunkAddr, ChunkId, ChunkStorage},
    timestamp::TimestampRange,
    write::Row,
};
use mutable_buffer::MBChunk;
use persistence_windows::min_max_sequence::MinMaxSequence;
use preserved_catalog::{interface::ArtifactInfo, pin::ArtifactPin};
use snafu::{ResultExt, Snafu};

use crate::chunk::{ChunkData, ChunkReference, ChunkView};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "Internal Error: unexpected chunk state for {} during {}. Expected {}, got {}",
        chunk,
        operation,
        expected,
        actual
    ))]
    InternalChunkState {
        chunk: ChunkAddr,
        operation: String,
        expected: String,
        actual: String,
    },

    #[snafu(display("Error writing to mutable buffer chunk {}: {}", chunk, source))]
    MutableBufferWrite {
        chunk: ChunkAddr,
        source: mutable_buffer::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Metadata of a chunk as seen by chunk predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    pub addr: ChunkAddr,
    pub storage: ChunkStorage,
    pub row_count: usize,
    pub time_range: Option<TimestampRange>,
    pub sequence: Option<MinMaxSequence>,
}

/// The stage a chunk is in, holding the data of that stage.
///
/// Stages only ever move forward:
///
/// ```text
/// Open -> Frozen -> ReadOptimized -> Persisted
/// ```
///
/// Persisting creates a new chunk in the `Persisted` stage that replaces the inputs.
#[derive(Debug)]
pub enum ChunkStage {
    /// Writable rows in the mutable buffer
    Open { mb_chunk: MBChunk },

    /// No longer writable, still in write order
    Frozen { data: Arc<ChunkData> },

    /// Sorted by time
    ReadOptimized { data: Arc<ChunkData> },

    /// Backed by an artifact referenced from the preserved catalog
    Persisted {
        data: Arc<ChunkData>,
        artifact: Arc<ArtifactInfo>,

        /// Keeps the artifact alive while the chunk is in the catalog
        pin: Arc<ArtifactPin>,
    },
}

impl ChunkStage {
    pub fn storage(&self) -> ChunkStorage {
        match self {
            Self::Open { .. } => ChunkStorage::OpenMutableBuffer,
            Self::Frozen { .. } => ChunkStorage::FrozenMutableBuffer,
            Self::ReadOptimized { .. } => ChunkStorage::ReadOptimizedBuffer,
            Self::Persisted { .. } => ChunkStorage::ObjectStoreChunk,
        }
    }
}

/// A chunk in the catalog. Always accessed through the [`tracker::LockableObject`] the
/// owning partition holds it in.
#[derive(Debug)]
pub struct CatalogChunk {
    addr: ChunkAddr,
    stage: ChunkStage,
}

impl CatalogChunk {
    /// Creates a new open chunk from `mb_chunk`
    pub(super) fn new_open(addr: ChunkAddr, mb_chunk: MBChunk) -> Self {
        Self {
            addr,
            stage: ChunkStage::Open { mb_chunk },
        }
    }

    /// Creates a chunk for an artifact that is live in the preserved catalog
    pub(crate) fn new_object_store(
        addr: ChunkAddr,
        data: Arc<ChunkData>,
        artifact: Arc<ArtifactInfo>,
        pin: Arc<ArtifactPin>,
    ) -> Self {
        debug_assert_eq!(artifact.path, *pin.path(), "pin must be for the chunk's artifact");
        Self {
            addr,
            stage: ChunkStage::Persisted {
                data,
                artifact,
                pin,
            },
        }
    }

    pub fn addr(&self) -> &ChunkAddr {
        &self.addr
    }

    pub fn id(&self) -> ChunkId {
        self.addr.chunk_id
    }

    pub fn stage(&self) -> &ChunkStage {
        &self.stage
    }

    pub fn storage(&self) -> ChunkStorage {
        self.stage.storage()
    }

    /// The immutable data of this chunk, `None` while it is open
    pub fn data(&self) -> Option<&Arc<ChunkData>> {
        match &self.stage {
            ChunkStage::Open { .. } => None,
            ChunkStage::Frozen { data }
            | ChunkStage::ReadOptimized { data }
            | ChunkStage::Persisted { data, .. } => Some(data),
        }
    }

    pub fn artifact(&self) -> Option<&Arc<ArtifactInfo>> {
        match &self.stage {
            ChunkStage::Persisted { artifact, .. } => Some(artifact),
            _ => None,
        }
    }

    pub fn row_count(&self) -> usize {
        match &self.stage {
            ChunkStage::Open { mb_chunk } => mb_chunk.rows(),
            _ => self.data().map(|d| d.row_count()).unwrap_or_default(),
        }
    }

    pub fn summary(&self) -> ChunkSummary {
        let (time_range, sequence) = match &self.stage {
            ChunkStage::Open { mb_chunk } => (mb_chunk.time_range(), mb_chunk.sequence()),
            _ => self
                .data()
                .map(|d| (d.time_range(), d.sequence()))
                .unwrap_or_default(),
        };

        ChunkSummary {
            addr: self.addr.clone(),
            storage: self.storage(),
            row_count: self.row_count(),
            time_range,
            sequence,
        }
    }

    /// Append `rows` written with `sequence` to the open chunk
    pub fn write(&mut self, sequence: u64, rows: &[Row]) -> Result<()> {
        match &mut self.stage {
            ChunkStage::Open { mb_chunk } => mb_chunk
                .write(sequence, rows)
                .context(MutableBufferWriteSnafu {
                    chunk: self.addr.clone(),
                }),
            _ => self.unexpected_state("write", "Open"),
        }
    }

    /// Close the open chunk for writes
    pub fn freeze(&mut self) -> Result<()> {
        match &self.stage {
            ChunkStage::Open { mb_chunk } => {
                let (snapshot, _) = mb_chunk.snapshot();
                let data = Arc::new(ChunkData::from(snapshot.as_ref()));
                self.stage = ChunkStage::Frozen { data };
                Ok(())
            }
            _ => self.unexpected_state("freeze", "Open"),
        }
    }

    /// Convert a frozen chunk into the read-optimized form
    pub fn move_to_read_buffer(&mut self) -> Result<()> {
        match &self.stage {
            ChunkStage::Frozen { data } => {
                let data = Arc::new(data.sorted());
                self.stage = ChunkStage::ReadOptimized { data };
                Ok(())
            }
            _ => self.unexpected_state("move to read buffer", "Frozen"),
        }
    }

    /// A detached view for readers.
    ///
    /// Open chunks are copied; immutable chunks are shared.
    pub fn snapshot_or_reference(&self) -> ChunkView {
        match &self.stage {
            ChunkStage::Open { mb_chunk } => ChunkView::Snapshot(mb_chunk.snapshot().0),
            ChunkStage::Frozen { data } | ChunkStage::ReadOptimized { data } => {
                ChunkView::Reference(ChunkReference::new(
                    self.addr.clone(),
                    self.storage(),
                    Arc::clone(data),
                    None,
                ))
            }
            ChunkStage::Persisted { data, pin, .. } => ChunkView::Reference(ChunkReference::new(
                self.addr.clone(),
                self.storage(),
                Arc::clone(data),
                Some(Arc::clone(pin)),
            )),
        }
    }

    fn unexpected_state<T>(&self, operation: &str, expected: &str) -> Result<T> {
        InternalChunkStateSnafu {
            chunk: self.addr.clone(),
            operation,
            expected,
            actual: self.storage().as_str(),
        }
        .fail()
    }
}

#[cfg(test)]
mod tests {
    use data_types::{
        chunk_metadata::PartitionAddr,
        write::FieldValue,
    };

    use super::*;

    fn make_open_chunk() -> CatalogChunk {
        let addr = ChunkAddr::new(&PartitionAddr::new("table1", "p1"), ChunkId::new_test(0));
        let rows = vec![
            Row::new(20).with_field("v", FieldValue::I64(1)),
            Row::new(10).with_field("v", FieldValue::I64(2)),
        ];
        let mb_chunk = MBChunk::new("table1", 1, &rows).unwrap();
        CatalogChunk::new_open(addr, mb_chunk)
    }

    #[test]
    fn test_lifecycle() {
        let mut chunk = make_open_chunk();
        assert_eq!(chunk.storage(), ChunkStorage::OpenMutableBuffer);
        assert!(chunk.data().is_none());

        chunk.write(2, &[Row::new(5)]).unwrap();
        assert_eq!(chunk.row_count(), 3);

        chunk.freeze().unwrap();
        assert_eq!(chunk.storage(), ChunkStorage::FrozenMutableBuffer);
        let times: Vec<_> = chunk.data().unwrap().rows().iter().map(|r| r.time).collect();
        assert_eq!(times, vec![20, 10, 5]);

        chunk.move_to_read_buffer().unwrap();
        assert_eq!(chunk.storage(), ChunkStorage::ReadOptimizedBuffer);
        let times: Vec<_> = chunk.data().unwrap().rows().iter().map(|r| r.time).collect();
        assert_eq!(times, vec![5, 10, 20]);

        let summary = chunk.summary();
        assert_eq!(summary.row_count, 3);
        assert_eq!(summary.time_range, Some(TimestampRange::new(5, 20)));
        assert_eq!(summary.sequence, Some(MinMaxSequence::new(1, 2)));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut chunk = make_open_chunk();

        let err = chunk.move_to_read_buffer().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Internal Error: unexpected chunk state for Chunk('table1':'p1':00000000) during \
             move to read buffer. Expected Frozen, got OpenMutableBuffer"
        );

        chunk.freeze().unwrap();
        assert!(matches!(
            chunk.freeze(),
            Err(Error::InternalChunkState { .. })
        ));
        assert!(matches!(
            chunk.write(3, &[Row::new(1)]),
            Err(Error::InternalChunkState { .. })
        ));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut chunk = make_open_chunk();

        let view = chunk.snapshot_or_reference();
        assert!(matches!(view, ChunkView::Snapshot(_)));

        chunk.write(2, &[Row::new(30)]).unwrap();
        assert_eq!(view.row_count(), 2);
        assert_eq!(chunk.snapshot_or_reference().row_count(), 3);

        chunk.freeze().unwrap();
        let view = chunk.snapshot_or_reference();
        match &view {
            ChunkView::Reference(r) => {
                assert!(Arc::ptr_eq(r.data(), chunk.data().unwrap()));
                assert_eq!(r.artifact_path(), None);
            }
            ChunkView::Snapshot(_) => panic!("frozen chunk must be referenced"),
        }
    }
}
