//! This module contains the code to drop chunks from the catalog and the preserved catalog
use data_types::chunk_metadata::{ChunkId, ChunkStorage};
use tracing::info;

use super::{LifecycleGuard, Result, commit_transaction, error::CannotDropOpenChunkSnafu};
use crate::Db;

/// Drop a chunk from the catalog.
///
/// Object store chunks are first removed from the preserved catalog. Their artifact is
/// deleted by a later cleanup sweep once no reader references it anymore.
///
/// The open chunk cannot be dropped, and neither can chunks in use by another lifecycle
/// action.
pub(crate) async fn drop_chunk(
    db: &Db,
    table_name: &str,
    partition_key: &str,
    chunk_id: ChunkId,
) -> Result<()> {
    let table = db.catalog.table_shared(table_name).await?;
    let partition = LifecycleGuard::SharedExclusive(
        db.catalog
            .partition_shared_exclusive(&table, partition_key)
            .await?,
    );

    let chunk = {
        let partition = partition.read();
        partition.ensure_unclaimed(chunk_id)?;
        partition.get_chunk(chunk_id)?
    };

    let (addr, storage, artifact) = {
        let chunk = db.catalog.chunk_shared(&partition, &chunk).await?;
        let chunk = chunk.read();
        (
            chunk.addr().clone(),
            chunk.storage(),
            chunk.artifact().map(|a| a.path.clone()),
        )
    };

    match (storage, artifact) {
        (ChunkStorage::OpenMutableBuffer, _) => CannotDropOpenChunkSnafu { addr }.fail(),
        (ChunkStorage::ObjectStoreChunk, Some(path)) => {
            // keep other actions off the chunk while the transaction is in flight
            let claim = partition.read().claim(&[chunk_id])?;
            std::mem::drop(partition);
            std::mem::drop(table);

            let transaction = db.preserved_catalog.open_transaction().await;
            let revision_counter =
                commit_transaction(transaction, |transaction| transaction.stage_remove(&path))
                    .await?;

            let (_table, partition) = db
                .catalog
                .partition_exclusive_for_swap(table_name, partition_key)
                .await?;
            partition.write().remove_chunk(chunk_id);
            std::mem::drop(claim);

            info!(chunk=%addr, %path, revision_counter, "object store chunk dropped");
            Ok(())
        }
        _ => {
            let partition = partition.upgrade();
            partition.write().remove_chunk(chunk_id);

            info!(chunk=%addr, storage=storage.as_str(), "chunk dropped");
            Ok(())
        }
    }
}
