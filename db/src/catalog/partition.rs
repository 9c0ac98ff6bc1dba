//! The catalog representation of a Partition
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use data_types::chunk_metadata::{ChunkAddr, ChunkId, PartitionAddr};
use mutable_buffer::MBChunk;
use parking_lot::Mutex;
use persistence_windows::PersistenceWindow;
use preserved_catalog::{interface::ArtifactInfo, paths::ArtifactPath, pin::ArtifactPin};
use snafu::{OptionExt, Snafu};
use tracker::{LockLevel, LockTracker, LockableObject};

use super::chunk::CatalogChunk;
use crate::chunk::ChunkData;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("chunk not found: {}", chunk))]
    ChunkNotFound { chunk: ChunkAddr },

    #[snafu(display("{} already has an open chunk", partition))]
    OpenChunkExists { partition: PartitionAddr },

    #[snafu(display("chunk is in use by another lifecycle action: {}", chunk))]
    ChunkClaimed { chunk: ChunkAddr },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Chunks selected by a lifecycle action that works on them without holding the partition
/// lock.
///
/// The chunks stay claimed until this object is dropped.
#[derive(Debug)]
pub struct ChunkClaim {
    partition: PartitionAddr,
    chunks: Vec<ChunkId>,
}

impl ChunkClaim {
    pub fn partition(&self) -> &PartitionAddr {
        &self.partition
    }

    pub fn chunks(&self) -> &[ChunkId] {
        &self.chunks
    }
}

#[derive(Debug)]
struct PartitionChunk {
    /// Creation order within the partition
    order: u64,
    chunk: Arc<LockableObject<CatalogChunk>>,
}

/// IOx Catalog Partition
///
/// A partition contains multiple Chunks for a given table, at most one of them open for
/// writes.
#[derive(Debug)]
pub struct Partition {
    addr: PartitionAddr,

    /// The chunks that make up this partition, indexed by id
    chunks: HashMap<ChunkId, PartitionChunk>,

    /// The single chunk accepting writes
    open_chunk: Option<ChunkId>,

    /// Object store chunks by the artifact backing them
    artifacts: HashMap<ArtifactPath, ChunkId>,

    next_order: u64,

    /// Claims can be taken under a shared-exclusive lock
    claims: Mutex<HashMap<ChunkId, Weak<ChunkClaim>>>,

    /// Writes not yet durable and the persisted watermark
    persistence_window: PersistenceWindow,

    tracker: LockTracker,
}

impl Partition {
    /// Create a new partition catalog object.
    pub(super) fn new(addr: PartitionAddr, tracker: LockTracker) -> Self {
        Self {
            addr,
            chunks: Default::default(),
            open_chunk: None,
            artifacts: Default::default(),
            next_order: 0,
            claims: Default::default(),
            persistence_window: PersistenceWindow::new(),
            tracker,
        }
    }

    pub fn addr(&self) -> &PartitionAddr {
        &self.addr
    }

    pub fn key(&self) -> &str {
        &self.addr.partition_key
    }

    pub fn chunk_addr(&self, chunk_id: ChunkId) -> ChunkAddr {
        ChunkAddr::new(&self.addr, chunk_id)
    }

    pub fn chunk(&self, chunk_id: ChunkId) -> Option<Arc<LockableObject<CatalogChunk>>> {
        self.chunks.get(&chunk_id).map(|c| Arc::clone(&c.chunk))
    }

    /// Like [`chunk`](Self::chunk) but errors if the chunk does not exist
    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Arc<LockableObject<CatalogChunk>>> {
        self.chunk(chunk_id).context(ChunkNotFoundSnafu {
            chunk: self.chunk_addr(chunk_id),
        })
    }

    /// All chunks in creation order
    pub fn chunks(&self) -> Vec<(ChunkId, Arc<LockableObject<CatalogChunk>>)> {
        let mut chunks: Vec<_> = self.chunks.iter().collect();
        chunks.sort_by_key(|(_, c)| c.order);
        chunks
            .into_iter()
            .map(|(id, c)| (*id, Arc::clone(&c.chunk)))
            .collect()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks().into_iter().map(|(id, _)| id).collect()
    }

    pub fn open_chunk(&self) -> Option<Arc<LockableObject<CatalogChunk>>> {
        self.open_chunk.and_then(|id| self.chunk(id))
    }

    /// Create the open chunk of this partition.
    ///
    /// Fails if there is one already.
    pub fn create_open_chunk(
        &mut self,
        mb_chunk: MBChunk,
    ) -> Result<Arc<LockableObject<CatalogChunk>>> {
        if self.open_chunk.is_some() {
            return OpenChunkExistsSnafu {
                partition: self.addr.clone(),
            }
            .fail();
        }

        let addr = self.chunk_addr(ChunkId::new());
        let chunk_id = addr.chunk_id;
        let chunk = self.insert(chunk_id, CatalogChunk::new_open(addr, mb_chunk));
        self.open_chunk = Some(chunk_id);

        Ok(chunk)
    }

    /// Mark the open chunk, which must have been frozen, as no longer accepting writes
    pub fn close_open_chunk(&mut self) -> Option<ChunkId> {
        self.open_chunk.take()
    }

    /// Add an object store chunk for `artifact`.
    ///
    /// If the partition already has a chunk for the same artifact that chunk is returned
    /// instead.
    pub fn insert_object_store_chunk(
        &mut self,
        chunk_id: ChunkId,
        data: Arc<ChunkData>,
        artifact: Arc<ArtifactInfo>,
        pin: Arc<ArtifactPin>,
    ) -> Arc<LockableObject<CatalogChunk>> {
        if let Some(existing) = self
            .artifacts
            .get(&artifact.path)
            .and_then(|id| self.chunk(*id))
        {
            return existing;
        }

        let path = artifact.path.clone();
        let addr = self.chunk_addr(chunk_id);
        let chunk = self.insert(
            chunk_id,
            CatalogChunk::new_object_store(addr, data, artifact, pin),
        );
        self.artifacts.insert(path, chunk_id);

        chunk
    }

    fn insert(
        &mut self,
        chunk_id: ChunkId,
        chunk: CatalogChunk,
    ) -> Arc<LockableObject<CatalogChunk>> {
        let chunk = self.tracker.new_lock(LockLevel::Chunk, chunk);
        let order = self.next_order;
        self.next_order += 1;

        let old = self.chunks.insert(
            chunk_id,
            PartitionChunk {
                order,
                chunk: Arc::clone(&chunk),
            },
        );
        assert!(old.is_none(), "chunk ID collision: {chunk_id}");

        chunk
    }

    /// Remove a chunk from the partition, returning it if it was present.
    ///
    /// Readers holding a snapshot or reference of the chunk are unaffected.
    pub fn remove_chunk(&mut self, chunk_id: ChunkId) -> Option<Arc<LockableObject<CatalogChunk>>> {
        let removed = self.chunks.remove(&chunk_id)?;

        if self.open_chunk == Some(chunk_id) {
            self.open_chunk = None;
        }
        self.artifacts.retain(|_, id| *id != chunk_id);
        self.claims.get_mut().remove(&chunk_id);

        Some(removed.chunk)
    }

    /// Returns true if a chunk of this partition is backed by `path`
    pub fn has_artifact(&self, path: &ArtifactPath) -> bool {
        self.artifacts.contains_key(path)
    }

    /// Claim `chunks` for a lifecycle action.
    ///
    /// Fails if any of them does not exist or is claimed already.
    pub fn claim(&self, chunks: &[ChunkId]) -> Result<Arc<ChunkClaim>> {
        let mut claims = self.claims.lock();
        claims.retain(|_, claim| claim.strong_count() > 0);

        for chunk_id in chunks {
            if !self.chunks.contains_key(chunk_id) {
                return ChunkNotFoundSnafu {
                    chunk: self.chunk_addr(*chunk_id),
                }
                .fail();
            }
            if claims.contains_key(chunk_id) {
                return ChunkClaimedSnafu {
                    chunk: self.chunk_addr(*chunk_id),
                }
                .fail();
            }
        }

        let claim = Arc::new(ChunkClaim {
            partition: self.addr.clone(),
            chunks: chunks.to_vec(),
        });
        for chunk_id in chunks {
            claims.insert(*chunk_id, Arc::downgrade(&claim));
        }

        Ok(claim)
    }

    pub fn is_claimed(&self, chunk_id: ChunkId) -> bool {
        self.claims
            .lock()
            .get(&chunk_id)
            .map(|claim| claim.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Errors if `chunk_id` is claimed
    pub fn ensure_unclaimed(&self, chunk_id: ChunkId) -> Result<()> {
        if self.is_claimed(chunk_id) {
            return ChunkClaimedSnafu {
                chunk: self.chunk_addr(chunk_id),
            }
            .fail();
        }
        Ok(())
    }

    pub fn persistence_window(&self) -> &PersistenceWindow {
        &self.persistence_window
    }

    pub fn persistence_window_mut(&mut self) -> &mut PersistenceWindow {
        &mut self.persistence_window
    }
}

#[cfg(test)]
mod tests {
    use data_types::{chunk_metadata::ChunkStorage, write::Row};
    use preserved_catalog::{paths::CatalogPrefix, pin::PinRegistry};
    use uuid::Uuid;

    use super::*;

    fn make_partition() -> Partition {
        Partition::new(PartitionAddr::new("t", "p"), LockTracker::default())
    }

    fn mb_chunk() -> MBChunk {
        MBChunk::new("t", 1, &[Row::new(1)]).unwrap()
    }

    fn artifact(partition: &Partition, chunk_id: ChunkId) -> Arc<ArtifactInfo> {
        let addr = partition.chunk_addr(chunk_id);
        Arc::new(ArtifactInfo {
            path: ArtifactPath::new(&CatalogPrefix::new("c"), &addr, Uuid::new_v4()),
            table_name: "t".to_string(),
            partition_key: "p".to_string(),
            chunk_id,
            row_count: 0,
            file_size_bytes: 0,
            time_range: None,
            sequence: None,
        })
    }

    #[test]
    fn test_single_open_chunk() {
        let mut partition = make_partition();
        assert!(partition.open_chunk().is_none());

        let chunk = partition.create_open_chunk(mb_chunk()).unwrap();
        assert!(Arc::ptr_eq(&chunk, &partition.open_chunk().unwrap()));
        assert_eq!(chunk.level(), LockLevel::Chunk);

        let err = partition.create_open_chunk(mb_chunk()).unwrap_err();
        assert_eq!(err.to_string(), "Partition('t':'p') already has an open chunk");

        let closed = partition.close_open_chunk().unwrap();
        assert!(partition.open_chunk().is_none());
        let second = partition.create_open_chunk(mb_chunk()).unwrap();

        let ids = partition.chunk_ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], closed, "chunks are listed in creation order");
        assert!(Arc::ptr_eq(&second, &partition.chunk(ids[1]).unwrap()));
    }

    #[test]
    fn test_object_store_chunk_is_idempotent() {
        let mut partition = make_partition();
        let pins = PinRegistry::new();

        let chunk_id = ChunkId::new_test(1);
        let info = artifact(&partition, chunk_id);
        let data = Arc::new(ChunkData::new(vec![Row::new(1)], None));

        let c1 = partition.insert_object_store_chunk(
            chunk_id,
            Arc::clone(&data),
            Arc::clone(&info),
            pins.pin(&info.path),
        );
        let c2 = partition.insert_object_store_chunk(
            chunk_id,
            data,
            Arc::clone(&info),
            pins.pin(&info.path),
        );
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(partition.chunk_ids(), vec![chunk_id]);
        assert!(partition.has_artifact(&info.path));
        assert_eq!(
            c1.try_shared().unwrap().read().storage(),
            ChunkStorage::ObjectStoreChunk
        );

        drop((c1, c2));
        assert!(pins.is_pinned(&info.path), "catalog entry keeps the pin");

        partition.remove_chunk(chunk_id).unwrap();
        assert!(!partition.has_artifact(&info.path));
        assert!(!pins.is_pinned(&info.path));
        assert!(partition.remove_chunk(chunk_id).is_none());
    }

    #[test]
    fn test_claims() {
        let mut partition = make_partition();
        partition.create_open_chunk(mb_chunk()).unwrap();
        partition.close_open_chunk();
        partition.create_open_chunk(mb_chunk()).unwrap();
        let ids = partition.chunk_ids();

        let claim = partition.claim(&ids[..1]).unwrap();
        assert_eq!(claim.chunks(), &ids[..1]);
        assert!(partition.is_claimed(ids[0]));
        assert!(!partition.is_claimed(ids[1]));

        assert!(matches!(
            partition.claim(&ids),
            Err(Error::ChunkClaimed { .. })
        ));
        assert!(matches!(
            partition.ensure_unclaimed(ids[0]),
            Err(Error::ChunkClaimed { .. })
        ));
        assert!(matches!(
            partition.claim(&[ChunkId::new_test(42)]),
            Err(Error::ChunkNotFound { .. })
        ));

        drop(claim);
        assert!(!partition.is_claimed(ids[0]));
        let _claim = partition.claim(&ids).unwrap();
    }
}
