//! Lifecycle actions that move chunks between storage stages.
//!
//! Every action takes a shared-exclusive lock on the partition to decide what to do, so at
//! most one action inspects a partition at a time while readers carry on. Work that needs
//! object store IO runs without catalog locks on chunks claimed beforehand and is applied
//! under a short exclusive lock at the end.
use std::sync::Arc;

use data_types::chunk_metadata::ChunkAddr;
use parking_lot::RwLockReadGuard;
use preserved_catalog::{
    core::TransactionHandle,
    interface::{ArtifactInfo, LiveArtifacts},
    paths::ArtifactPath,
    pin::ArtifactPin,
};
use snafu::ResultExt;
use tracker::{ExclusiveGuard, HeldLock, LockLevel, LockMode, SharedExclusiveGuard};

use crate::{Db, catalog::partition::Partition, chunk::ChunkData};

pub(crate) use compact_object_store::compact_object_store_chunks;
pub(crate) use drop::drop_chunk;
pub(crate) use error::{Error, Result};
pub(crate) use move_chunk::{freeze_partition, move_chunk_to_read_buffer};
pub(crate) use persist::persist_partition;

mod compact_object_store;
mod drop;
pub(crate) mod error;
mod move_chunk;
mod persist;

/// A partition lock held by a lifecycle action, upgraded to exclusive only when the action
/// turns out to modify the partition
#[derive(Debug)]
pub(crate) enum LifecycleGuard {
    SharedExclusive(SharedExclusiveGuard<Partition>),
    Exclusive(ExclusiveGuard<Partition>),
}

impl LifecycleGuard {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Partition> {
        match self {
            Self::SharedExclusive(guard) => guard.read(),
            Self::Exclusive(guard) => guard.read(),
        }
    }

    pub(crate) fn upgrade(self) -> ExclusiveGuard<Partition> {
        match self {
            Self::SharedExclusive(guard) => guard.upgrade(),
            Self::Exclusive(guard) => guard,
        }
    }
}

impl HeldLock for LifecycleGuard {
    fn level(&self) -> LockLevel {
        LockLevel::Partition
    }

    fn mode(&self) -> LockMode {
        match self {
            Self::SharedExclusive(_) => LockMode::SharedExclusive,
            Self::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

/// Stage `f` on `transaction` and commit it, aborting on staging errors
async fn commit_transaction<F>(
    mut transaction: TransactionHandle<'_, LiveArtifacts>,
    f: F,
) -> Result<u64>
where
    F: FnOnce(&mut TransactionHandle<'_, LiveArtifacts>) -> preserved_catalog::core::Result<()>
        + Send,
{
    if let Err(e) = f(&mut transaction) {
        transaction.abort();
        return Err(e).context(error::CommitSnafu);
    }
    transaction.commit().await.context(error::CommitSnafu)
}

/// An artifact that was committed and pinned, ready to be swapped into the catalog
#[derive(Debug)]
struct CommittedArtifact {
    info: Arc<ArtifactInfo>,
    pin: Arc<ArtifactPin>,
    revision_counter: u64,
}

/// Write `data` as the artifact of chunk `addr` and commit a single transaction that
/// replaces the artifacts at `replaces` with it.
///
/// The cleanup lock is held in shared mode from before the write until the new artifact is
/// live and pinned. If anything fails the artifact is left behind unreferenced and the next
/// cleanup sweep removes it.
async fn write_and_commit(
    db: &Db,
    addr: &ChunkAddr,
    data: &ChunkData,
    replaces: &[ArtifactPath],
) -> Result<CommittedArtifact> {
    let _guard = db.acquire_cleanup_shared().await;

    let (path, file_size_bytes) = db
        .artifact_store
        .write(addr, data)
        .await
        .context(error::WritingToObjectStoreSnafu)?;

    let info = ArtifactInfo {
        path,
        table_name: addr.table_name.to_string(),
        partition_key: addr.partition_key.to_string(),
        chunk_id: addr.chunk_id,
        row_count: data.row_count(),
        file_size_bytes,
        time_range: data.time_range(),
        sequence: data.sequence(),
    };

    let transaction = db.preserved_catalog.open_transaction().await;
    let revision_counter = commit_transaction(transaction, |transaction| {
        for path in replaces {
            transaction.stage_remove(path)?;
        }
        transaction.stage_add(info.clone())
    })
    .await?;

    let pin = db.pins.pin(&info.path);

    Ok(CommittedArtifact {
        info: Arc::new(info),
        pin,
        revision_counter,
    })
}
