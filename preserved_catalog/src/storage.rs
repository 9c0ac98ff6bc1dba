//! Write-once storage of chunk artifacts.
use std::sync::Arc;

use data_types::chunk_metadata::ChunkAddr;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    internals::serialize::{
        self, ARTIFACT_FILE_TYPE, serialize_to_file_bytes, verify_file_type_and_deserialize,
    },
    paths::{ArtifactPath, CatalogPrefix},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot encode or decode artifact {path}: {source}")]
    Serialization {
        path: ArtifactPath,
        source: serialize::Error,
    },

    #[error("error writing artifact {path}: {source}")]
    Write {
        path: ArtifactPath,
        source: object_store::Error,
    },

    #[error("error reading artifact {path}: {source}")]
    Read {
        path: ArtifactPath,
        source: object_store::Error,
    },

    #[error("error deleting artifact {path}: {source}")]
    Delete {
        path: ArtifactPath,
        source: object_store::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Handle to the data directory of a catalog.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    object_store: Arc<dyn ObjectStore>,
    prefix: CatalogPrefix,
}

impl ArtifactStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: CatalogPrefix) -> Self {
        Self {
            object_store,
            prefix,
        }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    pub fn prefix(&self) -> &CatalogPrefix {
        &self.prefix
    }

    /// Write `contents` as a new artifact of chunk `addr`.
    ///
    /// Returns the fresh path and the number of bytes written. The artifact is not linked
    /// from the catalog; callers must hold the cleanup lock in shared mode until the
    /// transaction adding it is committed.
    pub async fn write<T>(&self, addr: &ChunkAddr, contents: &T) -> Result<(ArtifactPath, usize)>
    where
        T: Serialize + Sync,
    {
        let path = ArtifactPath::new(&self.prefix, addr, Uuid::new_v4());
        let data = serialize_to_file_bytes(ARTIFACT_FILE_TYPE, contents).map_err(|source| {
            Error::Serialization {
                path: path.clone(),
                source,
            }
        })?;
        let file_size_bytes = data.len();

        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        self.object_store
            .put_opts(&path, PutPayload::from_bytes(data), opts)
            .await
            .map_err(|source| Error::Write {
                path: path.clone(),
                source,
            })?;

        info!(%path, chunk=%addr, file_size_bytes, "artifact written");

        Ok((path, file_size_bytes))
    }

    /// Read and decode the artifact at `path`.
    pub async fn read<T>(&self, path: &ArtifactPath) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let read_err = |source: object_store::Error| Error::Read {
            path: path.clone(),
            source,
        };
        let data = self
            .object_store
            .get(path)
            .await
            .map_err(read_err)?
            .bytes()
            .await
            .map_err(read_err)?;

        verify_file_type_and_deserialize(ARTIFACT_FILE_TYPE, data).map_err(|source| {
            Error::Serialization {
                path: path.clone(),
                source,
            }
        })
    }

    /// Delete the artifact at `path`. A missing artifact is not an error.
    pub async fn delete(&self, path: &ArtifactPath) -> Result<()> {
        match self.object_store.delete(path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!(%path, "artifact already gone");
                Ok(())
            }
            Err(source) => Err(Error::Delete {
                path: path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use data_types::chunk_metadata::{ChunkId, PartitionAddr};
    use object_store::memory::InMemory;

    use super::*;

    fn make_store() -> ArtifactStore {
        ArtifactStore::new(Arc::new(InMemory::new()), CatalogPrefix::new("catalog"))
    }

    fn addr() -> ChunkAddr {
        ChunkAddr::new(&PartitionAddr::new("cpu", "2023-01-01"), ChunkId::new_test(3))
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = make_store();

        let (p1, size) = store.write(&addr(), &vec![1_i64, 2, 3]).await.unwrap();
        let (p2, _) = store.write(&addr(), &vec![4_i64]).await.unwrap();
        assert_ne!(p1, p2, "every write gets its own path");
        assert!(size > 0);

        let back: Vec<i64> = store.read(&p1).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        store.delete(&p1).await.unwrap();
        // deleting twice is fine
        store.delete(&p1).await.unwrap();

        let err = store.read::<Vec<i64>>(&p1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Read {
                source: object_store::Error::NotFound { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_read_wrong_type() {
        let store = make_store();
        let (path, _) = store.write(&addr(), &"text").await.unwrap();

        let err = store.read::<Vec<i64>>(&path).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Serialization {
                source: serialize::Error::Serde(_),
                ..
            }
        ));
    }
}
