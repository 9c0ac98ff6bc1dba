//! This module contains the code to persist the closed chunks of a partition into a single
//! object store chunk
use std::{sync::Arc, time::Instant};

use data_types::chunk_metadata::{ChunkAddr, ChunkId, PartitionAddr};
use persistence_windows::FlushHandle;
use snafu::ensure;
use tracing::{debug, info};

use super::{
    LifecycleGuard, Result, error::PersistInProgressSnafu, move_chunk::freeze_open_chunk,
    write_and_commit,
};
use crate::{
    Db,
    catalog::{chunk::ChunkStage, partition::ChunkClaim},
    chunk::ChunkData,
};

/// Persist all unpersisted rows of a partition.
///
/// Freezes the open chunk, then writes the frozen and read-optimized chunks into one new
/// object store chunk that replaces them, and advances the partition's persisted watermark.
///
/// Returns the id of the new chunk, or `None` if there was nothing to persist.
///
/// Implementation steps
///   . Freeze, then claim and reference the chunks to persist (partition lock)
///   . Merge them (no locks)
///   . Write the artifact and commit it to the preserved catalog (cleanup lock)
///   . Swap the new chunk in for the old ones (exclusive partition lock)
pub(crate) async fn persist_partition(
    db: &Db,
    table_name: &str,
    partition_key: &str,
) -> Result<Option<ChunkId>> {
    let now = Instant::now();

    // Step 1: select, claim and reference the chunks, then drop locks
    let Some(persisting) = mark_chunks_to_persist(db, table_name, partition_key).await? else {
        return Ok(None);
    };

    // Step 2: merge off-lock
    let data = ChunkData::merge(&persisting.inputs);

    // Step 3: make it durable
    let chunk_id = ChunkId::new();
    let addr = ChunkAddr::new(&persisting.partition_addr, chunk_id);
    let committed = write_and_commit(db, &addr, &data, &[]).await?;

    // Step 4: swap
    let rows = data.row_count();
    let (_table, partition) = db
        .catalog
        .partition_exclusive_for_swap(table_name, partition_key)
        .await?;
    {
        let mut partition = partition.write();
        for chunk_id in persisting.claim.chunks() {
            partition.remove_chunk(*chunk_id);
        }
        partition.insert_object_store_chunk(
            chunk_id,
            Arc::new(data),
            committed.info,
            committed.pin,
        );
        if let Some(handle) = persisting.flush_handle {
            partition.persistence_window_mut().flush(handle);
        }
    }
    std::mem::drop(partition);

    info!(
        chunk=%addr,
        input_chunks=persisting.claim.chunks().len(),
        rows,
        revision_counter=committed.revision_counter,
        persist_took=?now.elapsed(),
        "partition persisted"
    );

    Ok(Some(chunk_id))
}

/// Chunks selected for persisting
#[derive(Debug)]
struct PersistingChunks {
    partition_addr: PartitionAddr,
    claim: Arc<ChunkClaim>,
    inputs: Vec<Arc<ChunkData>>,
    flush_handle: Option<FlushHandle>,
}

/// Freeze the open chunk and claim all frozen and read-optimized chunks.
///
/// Returns `None` if there is nothing to persist. If all closed chunks were dropped before
/// being persisted their windows are flushed right away.
async fn mark_chunks_to_persist(
    db: &Db,
    table_name: &str,
    partition_key: &str,
) -> Result<Option<PersistingChunks>> {
    let table = db.catalog.table_shared(table_name).await?;
    let partition = db
        .catalog
        .partition_shared_exclusive(&table, partition_key)
        .await?;

    let partition = if partition.read().open_chunk().is_some() {
        let partition = partition.upgrade();
        freeze_open_chunk(&db.catalog, &partition).await?;
        LifecycleGuard::Exclusive(partition)
    } else {
        LifecycleGuard::SharedExclusive(partition)
    };

    let (partition_addr, chunks, flush_handle) = {
        let partition = partition.read();
        (
            partition.addr().clone(),
            partition.chunks(),
            partition.persistence_window().flush_handle(),
        )
    };

    let mut chunk_ids = vec![];
    let mut inputs = vec![];
    for (chunk_id, chunk) in chunks {
        let chunk = db.catalog.chunk_shared(&partition, &chunk).await?;
        let chunk = chunk.read();
        match chunk.stage() {
            ChunkStage::Frozen { data } | ChunkStage::ReadOptimized { data } => {
                chunk_ids.push(chunk_id);
                inputs.push(Arc::clone(data));
            }
            ChunkStage::Open { .. } | ChunkStage::Persisted { .. } => {}
        }
    }

    if chunk_ids.is_empty() {
        if let Some(handle) = flush_handle {
            debug!(partition=%partition_addr, rows=handle.row_count(), "flushing windows of dropped chunks");
            let partition = partition.upgrade();
            partition.write().persistence_window_mut().flush(handle);
        }
        return Ok(None);
    }

    let claim = {
        let partition = partition.read();
        ensure!(
            chunk_ids.iter().all(|id| !partition.is_claimed(*id)),
            PersistInProgressSnafu {
                partition: partition_addr.clone()
            }
        );
        partition.claim(&chunk_ids)?
    };

    debug!(partition=%partition_addr, chunks=?chunk_ids, "persisting chunks");

    Ok(Some(PersistingChunks {
        partition_addr,
        claim,
        inputs,
        flush_handle,
    }))
}
