//! Methods to cleanup the object store.
use futures::TryStreamExt;
use thiserror::Error;
use tracing::info;

use crate::{
    core::PreservedCatalog,
    interface::CatalogState,
    paths::ArtifactPath,
    pin::PinRegistry,
    storage::{self, ArtifactStore},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("error from read operation while cleaning object store: {source}")]
    Read { source: object_store::Error },

    #[error("error from delete operation while cleaning object store: {source}")]
    Delete { source: storage::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Get unreferenced artifacts.
///
/// An artifact is unreferenced if it is neither live in the committed state of `catalog` nor
/// pinned by a reader. The resulting vector is in no particular order. It may be passed to
/// [`delete_files`].
///
/// # Locking / Concurrent Actions
/// While this method is running you MUST NOT write new artifacts. Hence the caller needs to
/// hold the cleanup lock in exclusive mode. Otherwise this method may report files for deletion
/// that are about to be added to the catalog!
///
/// **This method does NOT acquire the transaction lock!**
///
/// To limit the time the exclusive access is required use `max_files` which will limit the
/// number of files to be detected in this cleanup round.
///
/// The exclusive access can be dropped after this method returned and before calling
/// [`delete_files`].
pub async fn get_unreferenced_files<S>(
    catalog: &PreservedCatalog<S>,
    pins: &PinRegistry,
    max_files: usize,
) -> Result<Vec<ArtifactPath>>
where
    S: CatalogState,
{
    let state = catalog.state();
    let prefix = catalog.prefix();

    // gather a list of "files to remove" eagerly so we do not block writers for too long
    let mut to_remove = vec![];
    let mut stream = catalog.object_store().list(Some(&prefix.data_dir()));

    while let Some(meta) = stream
        .try_next()
        .await
        .map_err(|source| Error::Read { source })?
    {
        if to_remove.len() >= max_files {
            info!(%max_files, "reached limit of number of files to cleanup in one go");
            break;
        }

        // only delete if all of the following conditions are met:
        // - file is a chunk artifact
        // - file is not tracked by the catalog
        // - nobody is reading it
        let Some(path) = ArtifactPath::from_listed(prefix, &meta.location) else {
            continue;
        };
        if !state.contains(&path) && !pins.is_pinned(&path) {
            to_remove.push(path);
        }
    }

    info!(n_files = to_remove.len(), "found files to delete");

    Ok(to_remove)
}

/// Delete all `files` from the store.
///
/// A file might already be deleted (or entirely absent) when this method is called. This will
/// NOT result in an error.
///
/// # Locking / Concurrent Actions
/// Artifact creation and catalog modifications can be done while calling this method. Even
/// [`get_unreferenced_files`] can be called while is method is in-progress.
pub async fn delete_files(store: &ArtifactStore, files: &[ArtifactPath]) -> Result<()> {
    for path in files {
        info!(%path, "delete file");
        store
            .delete(path)
            .await
            .map_err(|source| Error::Delete { source })?;
    }

    info!(n_files = files.len(), "finished deletion, removed files");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use data_types::chunk_metadata::{ChunkAddr, ChunkId, PartitionAddr};
    use object_store::{ObjectStore, memory::InMemory, path::Path as ObjPath};

    use super::*;
    use crate::{
        interface::{ArtifactInfo, LiveArtifacts},
        paths::CatalogPrefix,
    };

    fn chunk_addr(id: u128) -> ChunkAddr {
        ChunkAddr::new(&PartitionAddr::new("table1", "part1"), ChunkId::new_test(id))
    }

    async fn write_artifact(store: &ArtifactStore, id: u128) -> ArtifactInfo {
        let addr = chunk_addr(id);
        let (path, file_size_bytes) = store.write(&addr, &vec![id as u64]).await.unwrap();
        ArtifactInfo {
            path,
            table_name: addr.table_name.to_string(),
            partition_key: addr.partition_key.to_string(),
            chunk_id: addr.chunk_id,
            row_count: 1,
            file_size_bytes,
            time_range: None,
            sequence: None,
        }
    }

    fn setup() -> (PreservedCatalog<LiveArtifacts>, ArtifactStore) {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let prefix = CatalogPrefix::new("catalog");
        let catalog = PreservedCatalog::new_empty(Arc::clone(&object_store), prefix.clone(), ());
        let store = ArtifactStore::new(object_store, prefix);
        (catalog, store)
    }

    async fn list_all(store: &ArtifactStore) -> Vec<ArtifactPath> {
        let mut paths: Vec<_> = store
            .object_store()
            .list(None)
            .map_ok(|m| m.location)
            .try_collect::<Vec<ObjPath>>()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|p| ArtifactPath::from_listed(store.prefix(), &p))
            .collect();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn test_cleanup_empty() {
        let (catalog, store) = setup();
        let pins = PinRegistry::new();

        // run clean-up
        let files = get_unreferenced_files(&catalog, &pins, 1_000).await.unwrap();
        assert!(files.is_empty());
        delete_files(&store, &files).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_cleanup_rules() {
        let (catalog, store) = setup();
        let pins = PinRegistry::new();

        // live => keep
        let live = write_artifact(&store, 1).await;
        // soft-deleted and pinned by a reader => keep
        let removed_pinned = write_artifact(&store, 2).await;
        // soft-deleted => delete
        let removed = write_artifact(&store, 3).await;
        // never committed => delete
        let orphan = write_artifact(&store, 4).await;

        let mut t = catalog.open_transaction().await;
        t.stage_add(live.clone()).unwrap();
        t.stage_add(removed_pinned.clone()).unwrap();
        t.stage_add(removed.clone()).unwrap();
        t.commit().await.unwrap();

        let mut t = catalog.open_transaction().await;
        t.stage_remove(&removed_pinned.path).unwrap();
        t.stage_remove(&removed.path).unwrap();
        t.commit().await.unwrap();

        let pin = pins.pin(&removed_pinned.path);

        // files outside of the artifact naming scheme are left alone
        let foreign = catalog.prefix().data_dir().child("README.md");
        catalog
            .object_store()
            .put(&foreign, bytes::Bytes::from_static(b"x").into())
            .await
            .unwrap();

        let mut files = get_unreferenced_files(&catalog, &pins, 1_000).await.unwrap();
        files.sort();
        let mut expected = vec![removed.path.clone(), orphan.path.clone()];
        expected.sort();
        assert_eq!(files, expected);

        delete_files(&store, &files).await.unwrap();
        let mut remaining = vec![live.path.clone(), removed_pinned.path.clone()];
        remaining.sort();
        assert_eq!(list_all(&store).await, remaining);
        catalog.object_store().head(&foreign).await.unwrap();

        // once the reader is gone the artifact can go as well
        drop(pin);
        let files = get_unreferenced_files(&catalog, &pins, 1_000).await.unwrap();
        assert_eq!(files, vec![removed_pinned.path.clone()]);
        delete_files(&store, &files).await.unwrap();

        // deleting again is not an error
        delete_files(&store, &files).await.unwrap();
        assert_eq!(list_all(&store).await, vec![live.path]);
    }

    #[tokio::test]
    async fn test_cleanup_max_files() {
        let (catalog, store) = setup();
        let pins = PinRegistry::new();

        for id in 0..3 {
            write_artifact(&store, id).await;
        }

        let files = get_unreferenced_files(&catalog, &pins, 2).await.unwrap();
        assert_eq!(files.len(), 2);
        delete_files(&store, &files).await.unwrap();

        let files = get_unreferenced_files(&catalog, &pins, 2).await.unwrap();
        assert_eq!(files.len(), 1);
    }
}
