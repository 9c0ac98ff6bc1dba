//! This module contains the code to freeze open chunks and move frozen chunks to the read
//! optimized form
use data_types::chunk_metadata::ChunkId;
use tracing::{debug, info};
use tracker::ExclusiveGuard;

use super::{LifecycleGuard, Result};
use crate::{
    Db,
    catalog::{Catalog, partition::Partition},
};

/// Close the open chunk of a partition for writes.
///
/// Returns the id of the frozen chunk, or `None` if the partition had no open chunk.
pub(crate) async fn freeze_partition(
    db: &Db,
    table_name: &str,
    partition_key: &str,
) -> Result<Option<ChunkId>> {
    let table = db.catalog.table_shared(table_name).await?;
    let partition = db
        .catalog
        .partition_shared_exclusive(&table, partition_key)
        .await?;

    if partition.read().open_chunk().is_none() {
        return Ok(None);
    }

    let partition = partition.upgrade();
    freeze_open_chunk(&db.catalog, &partition).await
}

/// Freeze the open chunk of the exclusively locked `partition`, if it has one.
///
/// Rotates the persistence window so the rows of the frozen chunk become persistable.
pub(super) async fn freeze_open_chunk(
    catalog: &Catalog,
    partition: &ExclusiveGuard<Partition>,
) -> Result<Option<ChunkId>> {
    let open_chunk = partition.read().open_chunk();
    let Some(chunk) = open_chunk else {
        return Ok(None);
    };

    let chunk = catalog.chunk_exclusive(partition, &chunk).await?;
    chunk.write().freeze()?;
    let addr = chunk.read().addr().clone();
    std::mem::drop(chunk);

    {
        let mut partition = partition.write();
        partition.close_open_chunk();
        partition.persistence_window_mut().rotate();
    }

    info!(chunk=%addr, "chunk frozen");
    Ok(Some(addr.chunk_id))
}

/// Convert a frozen chunk into the read-optimized form.
///
/// The chunk must not be claimed by a running persist.
pub(crate) async fn move_chunk_to_read_buffer(
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

    let chunk = db.catalog.chunk_exclusive(&partition, &chunk).await?;
    chunk.write().move_to_read_buffer()?;

    debug!(chunk=%chunk.read().addr(), "chunk moved to read buffer");
    Ok(())
}
