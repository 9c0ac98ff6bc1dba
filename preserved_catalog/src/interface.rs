//! Abstract interfaces to make different users work with the preserved catalog.
use std::collections::BTreeMap;

use data_types::{
    chunk_metadata::{ChunkAddr, ChunkId, PartitionAddr},
    timestamp::TimestampRange,
};
use persistence_windows::min_max_sequence::MinMaxSequence;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::ArtifactPath;

/// Everything the catalog records about a chunk artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Full path.
    pub path: ArtifactPath,

    pub table_name: String,

    pub partition_key: String,

    pub chunk_id: ChunkId,

    pub row_count: usize,

    /// Size of the artifact in bytes
    pub file_size_bytes: usize,

    pub time_range: Option<TimestampRange>,

    /// Write sequence numbers of the rows contained in the artifact
    pub sequence: Option<MinMaxSequence>,
}

impl ArtifactInfo {
    pub fn chunk_addr(&self) -> ChunkAddr {
        ChunkAddr::new(
            &PartitionAddr::new(self.table_name.as_str(), self.partition_key.as_str()),
            self.chunk_id,
        )
    }
}

#[derive(Debug, Error)]
pub enum CatalogStateAddError {
    #[error("artifact already exists in catalog: {path}")]
    ArtifactAlreadyExists { path: ArtifactPath },
}

#[derive(Debug, Error)]
pub enum CatalogStateRemoveError {
    #[error("artifact does not exist in catalog: {path}")]
    ArtifactDoesNotExist { path: ArtifactPath },
}

/// Abstraction over how the in-memory state of the catalog works.
///
/// A transaction works on its own copy of the committed state and swaps it in on commit, so
/// the state must be cheap enough to clone.
pub trait CatalogState: Clone + Send + Sync + 'static {
    /// Input to create a new empty instance.
    ///
    /// See [`new_empty`](Self::new_empty) for details.
    type EmptyInput: Send;

    /// Create empty state w/o any known files.
    fn new_empty(data: Self::EmptyInput) -> Self;

    /// Add artifact to state.
    fn add(&mut self, info: ArtifactInfo) -> Result<(), CatalogStateAddError>;

    /// Remove artifact from state.
    fn remove(&mut self, path: &ArtifactPath) -> Result<(), CatalogStateRemoveError>;

    /// Returns true if `path` is live in this state
    fn contains(&self, path: &ArtifactPath) -> bool;
}

/// The set of live artifacts, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveArtifacts {
    artifacts: BTreeMap<ArtifactPath, ArtifactInfo>,
}

impl LiveArtifacts {
    pub fn get(&self, path: &ArtifactPath) -> Option<&ArtifactInfo> {
        self.artifacts.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArtifactInfo> + '_ {
        self.artifacts.values()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl CatalogState for LiveArtifacts {
    type EmptyInput = ();

    fn new_empty(_data: Self::EmptyInput) -> Self {
        Self::default()
    }

    fn add(&mut self, info: ArtifactInfo) -> Result<(), CatalogStateAddError> {
        use std::collections::btree_map::Entry;

        match self.artifacts.entry(info.path.clone()) {
            Entry::Occupied(o) => Err(CatalogStateAddError::ArtifactAlreadyExists {
                path: o.key().clone(),
            }),
            Entry::Vacant(v) => {
                v.insert(info);
                Ok(())
            }
        }
    }

    fn remove(&mut self, path: &ArtifactPath) -> Result<(), CatalogStateRemoveError> {
        self.artifacts
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| CatalogStateRemoveError::ArtifactDoesNotExist { path: path.clone() })
    }

    fn contains(&self, path: &ArtifactPath) -> bool {
        self.artifacts.contains_key(path)
    }
}
