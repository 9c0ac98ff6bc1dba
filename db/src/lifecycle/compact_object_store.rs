//! This module compact object store chunks (aka persisted chunks)
use std::{collections::HashSet, sync::Arc, time::Instant};

use data_types::chunk_metadata::{ChunkAddr, ChunkId, PartitionAddr};
use preserved_catalog::paths::ArtifactPath;
use snafu::ensure;
use tracing::info;

use super::{
    LifecycleGuard, Result,
    error::{ChunksNotPersistedSnafu, EmptyChunksSnafu},
    write_and_commit,
};
use crate::{
    Db,
    catalog::{chunk::ChunkStage, partition::ChunkClaim},
    chunk::ChunkData,
};

/// Compact the provided object store chunks into a single object store chunk, returning the
/// id of the newly created chunk
///
/// The function will error if
///    . No chunks are provided
///    . provided chunk(s) do not belong to the provided partition
///    . not all provided chunks are persisted
///    . any of them is in use by another lifecycle action
///
/// Implementation steps
///   . Verify the input chunks, claim and reference them
///   . Compact the chunks
///   . Persist the compacted output and in one transaction drop the old artifacts and add the
///     new one
///   . Drop old chunks and make the new chunk available in the catalog
pub(crate) async fn compact_object_store_chunks(
    db: &Db,
    table_name: &str,
    partition_key: &str,
    chunk_ids: &[ChunkId],
) -> Result<ChunkId> {
    // Track compaction duration
    let now = Instant::now();

    // Step 1: Verify input while claiming and referencing the chunks for compacting
    let compacting = mark_chunks_to_compact(db, table_name, partition_key, chunk_ids).await?;
    let input_chunks = compacting.claim.chunks().len();
    let input_rows: usize = compacting.inputs.iter().map(|d| d.row_count()).sum();
    info!(partition=%compacting.partition_addr, chunks=?compacting.claim.chunks(), "compacting object store chunks");

    // Step 2: Compact the os chunks
    let data = ChunkData::merge(&compacting.inputs);
    let compacted_rows = data.row_count();

    // Step 3: Write the compacted chunk and replace the old artifacts with it in the
    // preserved catalog. The old artifacts stay in the object store until the cleanup sweep
    // finds them unreferenced.
    let chunk_id = ChunkId::new();
    let addr = ChunkAddr::new(&compacting.partition_addr, chunk_id);
    let committed = write_and_commit(db, &addr, &data, &compacting.artifacts).await?;

    // Step 4: Update the in-memory catalog
    let (_table, partition) = db
        .catalog
        .partition_exclusive_for_swap(table_name, partition_key)
        .await?;
    {
        let mut partition = partition.write();
        for chunk_id in compacting.claim.chunks() {
            partition.remove_chunk(*chunk_id);
        }
        partition.insert_object_store_chunk(
            chunk_id,
            Arc::new(data),
            committed.info,
            committed.pin,
        );
    }
    std::mem::drop(partition);

    // Log the summary
    let elapsed = now.elapsed();
    info!(
        chunk=%addr,
        input_chunks,
        input_rows,
        compacted_rows,
        revision_counter=committed.revision_counter,
        compaction_took=?elapsed,
        "object store chunk(s) compacted"
    );

    Ok(chunk_id)
}

/// This struct is used as return data of compacting os chunks
#[derive(Debug)]
struct CompactingOsChunks {
    partition_addr: PartitionAddr,
    claim: Arc<ChunkClaim>,
    inputs: Vec<Arc<ChunkData>>,
    artifacts: Vec<ArtifactPath>,
}

/// Verify eligible compacting chunks, claim and reference them to get ready for compacting.
///
/// Chunks are returned in the order they were added to the partition.
async fn mark_chunks_to_compact(
    db: &Db,
    table_name: &str,
    partition_key: &str,
    chunk_ids: &[ChunkId],
) -> Result<CompactingOsChunks> {
    // no chunks provided
    ensure!(!chunk_ids.is_empty(), EmptyChunksSnafu);

    let table = db.catalog.table_shared(table_name).await?;
    let partition = LifecycleGuard::SharedExclusive(
        db.catalog
            .partition_shared_exclusive(&table, partition_key)
            .await?,
    );

    let requested: HashSet<_> = chunk_ids.iter().copied().collect();
    let (partition_addr, chunks) = {
        let partition = partition.read();
        // provided chunks not in the provided partition
        for chunk_id in &requested {
            partition.get_chunk(*chunk_id)?;
        }

        let chunks: Vec<_> = partition
            .chunks()
            .into_iter()
            .filter(|(chunk_id, _)| requested.contains(chunk_id))
            .collect();
        (partition.addr().clone(), chunks)
    };

    let mut ids = Vec::with_capacity(chunks.len());
    let mut inputs = Vec::with_capacity(chunks.len());
    let mut artifacts = Vec::with_capacity(chunks.len());
    for (chunk_id, chunk) in chunks {
        let chunk = db.catalog.chunk_shared(&partition, &chunk).await?;
        let chunk = chunk.read();
        match chunk.stage() {
            ChunkStage::Persisted { data, artifact, .. } => {
                ids.push(chunk_id);
                inputs.push(Arc::clone(data));
                artifacts.push(artifact.path.clone());
            }
            _ => return ChunksNotPersistedSnafu.fail(),
        }
    }

    let claim = partition.read().claim(&ids)?;

    // drop partition lock
    std::mem::drop(partition);

    Ok(CompactingOsChunks {
        partition_addr,
        claim,
        inputs,
        artifacts,
    })
}
