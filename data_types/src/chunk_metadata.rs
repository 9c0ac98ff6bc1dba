//! Module contains a representation of chunk metadata
use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Address of the partition, used for logging and addressing
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionAddr {
    /// The table name
    pub table_name: Arc<str>,

    /// The partition key
    pub partition_key: Arc<str>,
}

impl PartitionAddr {
    pub fn new(table_name: impl Into<Arc<str>>, partition_key: impl Into<Arc<str>>) -> Self {
        Self {
            table_name: table_name.into(),
            partition_key: partition_key.into(),
        }
    }
}

impl fmt::Display for PartitionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Partition('{}':'{}')", self.table_name, self.partition_key)
    }
}

/// Address of the chunk within the catalog
///
/// This is a stable identifier: it stays valid after the chunk has been
/// removed from the catalog, so snapshots and references can carry it without
/// pointing back into the live catalog tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkAddr {
    /// The table name
    pub table_name: Arc<str>,

    /// The partition key
    pub partition_key: Arc<str>,

    /// The chunk ID
    pub chunk_id: ChunkId,
}

impl ChunkAddr {
    pub fn new(partition: &PartitionAddr, chunk_id: ChunkId) -> Self {
        Self {
            table_name: Arc::clone(&partition.table_name),
            partition_key: Arc::clone(&partition.partition_key),
            chunk_id,
        }
    }

    pub fn into_partition(self) -> PartitionAddr {
        PartitionAddr {
            table_name: self.table_name,
            partition_key: self.partition_key,
        }
    }

    pub fn partition(&self) -> PartitionAddr {
        PartitionAddr {
            table_name: Arc::clone(&self.table_name),
            partition_key: Arc::clone(&self.partition_key),
        }
    }
}

impl fmt::Display for ChunkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk('{}':'{}':{})",
            self.table_name, self.partition_key, self.chunk_id
        )
    }
}

/// ID of a chunk.
///
/// This ID is unique within a single partition and is never reused, not even
/// after the chunk was compacted away or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Create new, random ID.
    #[allow(clippy::new_without_default)] // `new` creates a new ID, not a default one
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// **TESTING ONLY:** Create new ID from integer.
    ///
    /// Since this can easily lead to ID collisions (which in turn can lead to panics), this must
    /// only be used for testing purposes!
    pub fn new_test(id: u128) -> Self {
        Self(Uuid::from_u128(id))
    }

    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Use the short form of the UUID, like git does for commits
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

impl From<Uuid> for ChunkId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// The mutability class of a chunk, i.e. which representation currently
/// backs its data.
///
/// Chunks only ever move forward through these classes:
///
/// ```text
/// OpenMutableBuffer -> FrozenMutableBuffer -> ReadOptimizedBuffer -> ObjectStoreChunk
/// ```
///
/// A partition holds at most one [`ChunkStorage::OpenMutableBuffer`] chunk at
/// any time, and it is the only class that accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkStorage {
    /// The chunk is still open for new writes, in the Mutable Buffer
    OpenMutableBuffer,

    /// The chunk is no longer open for writes, in the Mutable Buffer
    FrozenMutableBuffer,

    /// The chunk is in the read-optimized in-memory representation
    ReadOptimizedBuffer,

    /// The chunk lives as an immutable artifact in the object store
    ObjectStoreChunk,
}

impl ChunkStorage {
    /// Return a str representation of this storage state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenMutableBuffer => "OpenMutableBuffer",
            Self::FrozenMutableBuffer => "FrozenMutableBuffer",
            Self::ReadOptimizedBuffer => "ReadOptimizedBuffer",
            Self::ObjectStoreChunk => "ObjectStoreChunk",
        }
    }

    /// Returns true if the storage may still receive writes
    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::OpenMutableBuffer)
    }

    /// Returns true if the storage is backed by a durable artifact
    pub fn has_object_store(&self) -> bool {
        matches!(self, Self::ObjectStoreChunk)
    }
}

impl fmt::Display for ChunkStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
