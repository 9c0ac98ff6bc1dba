//! This module contains the main Database object: the lock-protected chunk catalog, its
//! durable counterpart in the object store and the cleanup of unreferenced artifacts.
//!
//! Readers get detached views of chunks and never hold a lock while reading data. Writers
//! append to the single open chunk of a partition. Lifecycle actions move closed chunks into
//! the object store using a transaction on the preserved catalog and swap them into the
//! catalog under a short exclusive lock.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use data_types::{chunk_metadata::ChunkId, write::Row};
use object_store::ObjectStore;
use preserved_catalog::{
    cleanup::{delete_files, get_unreferenced_files},
    core::PreservedCatalog,
    interface::LiveArtifacts,
    paths::CatalogPrefix,
    pin::PinRegistry,
    storage::ArtifactStore,
};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracker::{ExclusiveGuard, LockLevel, LockTracker, LockableObject, SharedGuard};

use crate::{
    catalog::{Catalog, PartitionSummary, WriteSummary, chunk::ChunkSummary},
    chunk::ChunkView,
    config::CatalogConfig,
};

pub mod catalog;
pub mod chunk;
pub mod config;
mod lifecycle;
pub mod load;

pub use lifecycle::error::Error as LifecycleError;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Error loading catalog: {}", source))]
    Load { source: load::Error },

    #[snafu(display("{}", source))]
    CatalogError { source: catalog::Error },

    #[snafu(display("Lifecycle error: {}", source))]
    Lifecycle { source: lifecycle::Error },

    #[snafu(display("Error while cleaning up unreferenced artifacts: {}", source))]
    Cleanup {
        source: preserved_catalog::cleanup::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A chunk catalog backed by an object store.
#[derive(Debug)]
pub struct Db {
    config: CatalogConfig,

    /// The catalog holds chunks of data under partitions for the database. Chunks move
    /// through these stages:
    ///
    ///  - the open mutable buffer, the only writable chunk of a partition;
    ///  - frozen and read-optimized chunks, immutable and in memory; and
    ///  - object store chunks, backed by an artifact that is live in the preserved catalog.
    catalog: Arc<Catalog>,

    /// The durable log of live artifacts
    preserved_catalog: Arc<PreservedCatalog<LiveArtifacts>>,

    artifact_store: ArtifactStore,

    /// Artifacts that readers or catalog entries still use
    pins: PinRegistry,

    /// Lock that prevents the cleanup job from deleting files that are written but not yet
    /// added to the preserved catalog.
    ///
    /// The cleanup job needs exclusive access. Writing artifacts and committing the catalog
    /// transaction that references them only needs shared access.
    cleanup_lock: Arc<LockableObject<()>>,

    /// Number of iterations of the worker cleanup loop for this Db
    worker_iterations_cleanup: AtomicUsize,
}

impl Db {
    /// Open the catalog stored below the configured prefix of `object_store`, creating an
    /// empty one if there is none.
    ///
    /// Every artifact that is live in the preserved catalog becomes an object store chunk.
    pub async fn load(object_store: Arc<dyn ObjectStore>, config: CatalogConfig) -> Result<Self> {
        let prefix = CatalogPrefix::new(&config.object_store_prefix);
        let preserved_catalog =
            load::load_or_create_preserved_catalog(Arc::clone(&object_store), prefix.clone())
                .await
                .context(LoadSnafu)?;

        let lock_tracker = LockTracker::default();
        let catalog = Catalog::new(lock_tracker.clone(), config.lock_wait_timeout);
        let artifact_store = ArtifactStore::new(object_store, prefix);
        let pins = PinRegistry::new();

        load::rebuild_catalog(&catalog, &preserved_catalog, &artifact_store, &pins)
            .await
            .context(LoadSnafu)?;

        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            preserved_catalog: Arc::new(preserved_catalog),
            artifact_store,
            pins,
            cleanup_lock: lock_tracker.new_lock(LockLevel::Cleanup, ()),
            worker_iterations_cleanup: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn preserved_catalog(&self) -> &Arc<PreservedCatalog<LiveArtifacts>> {
        &self.preserved_catalog
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.artifact_store
    }

    pub fn pins(&self) -> &PinRegistry {
        &self.pins
    }

    /// Lock statistics of all catalog locks and the cleanup lock
    pub fn lock_tracker(&self) -> &LockTracker {
        self.catalog.lock_tracker()
    }

    /// Return all table names of the DB
    pub async fn table_names(&self) -> Vec<Arc<str>> {
        self.catalog.table_names().await
    }

    /// Write `rows` into a partition, creating it if needed.
    ///
    /// The write is recorded in the partition's persistence window.
    pub async fn write(
        &self,
        table_name: &str,
        partition_key: &str,
        rows: &[Row],
    ) -> Result<WriteSummary> {
        self.catalog
            .write(table_name, partition_key, rows)
            .await
            .context(CatalogSnafu)
    }

    /// Detached views of all chunks of `table_name` in partitions matching
    /// `partition_predicate` whose summary matches `chunk_predicate`.
    ///
    /// No lock is held once this returns: open chunks are snapshotted, immutable ones are
    /// referenced.
    pub async fn get_snapshot_or_reference<P, C>(
        &self,
        table_name: &str,
        partition_predicate: P,
        chunk_predicate: C,
    ) -> Vec<(ChunkId, ChunkView)>
    where
        P: Fn(&str) -> bool + Send + Sync,
        C: Fn(&ChunkSummary) -> bool + Send + Sync,
    {
        self.catalog
            .snapshot_chunks(table_name, partition_predicate, chunk_predicate)
            .await
    }

    pub async fn partition_summary(
        &self,
        table_name: &str,
        partition_key: &str,
    ) -> Result<PartitionSummary> {
        self.catalog
            .partition_summary(table_name, partition_key)
            .await
            .context(CatalogSnafu)
    }

    /// Close the open chunk of a partition for writes
    pub async fn freeze_partition(
        &self,
        table_name: &str,
        partition_key: &str,
    ) -> Result<Option<ChunkId>> {
        lifecycle::freeze_partition(self, table_name, partition_key)
            .await
            .context(LifecycleSnafu)
    }

    /// Convert a frozen chunk into the read-optimized form
    pub async fn move_to_read_buffer(
        &self,
        table_name: &str,
        partition_key: &str,
        chunk_id: ChunkId,
    ) -> Result<()> {
        lifecycle::move_chunk_to_read_buffer(self, table_name, partition_key, chunk_id)
            .await
            .context(LifecycleSnafu)
    }

    /// Persist given partition.
    ///
    /// Returns the chunk that contains the persisted data, or `None` if there was nothing to
    /// persist.
    pub async fn persist_partition(
        &self,
        table_name: &str,
        partition_key: &str,
    ) -> Result<Option<ChunkId>> {
        lifecycle::persist_partition(self, table_name, partition_key)
            .await
            .context(LifecycleSnafu)
    }

    /// Compact the given object store chunks of a partition into one
    pub async fn compact_object_store_chunks(
        &self,
        table_name: &str,
        partition_key: &str,
        chunk_ids: &[ChunkId],
    ) -> Result<ChunkId> {
        lifecycle::compact_object_store_chunks(self, table_name, partition_key, chunk_ids)
            .await
            .context(LifecycleSnafu)
    }

    /// Drops the specified chunk from the catalog
    pub async fn drop_chunk(
        &self,
        table_name: &str,
        partition_key: &str,
        chunk_id: ChunkId,
    ) -> Result<()> {
        lifecycle::drop_chunk(self, table_name, partition_key, chunk_id)
            .await
            .context(LifecycleSnafu)
    }

    /// Hold while an artifact exists that the preserved catalog does not reference yet.
    ///
    /// Released when the guard is dropped.
    pub async fn acquire_cleanup_shared(&self) -> SharedGuard<()> {
        self.cleanup_lock.shared().await
    }

    /// Hold while scanning for unreferenced artifacts.
    ///
    /// Released when the guard is dropped.
    pub async fn acquire_cleanup_exclusive(&self) -> ExclusiveGuard<()> {
        self.cleanup_lock.exclusive().await
    }

    /// Delete artifacts that are neither live in the preserved catalog nor pinned.
    ///
    /// Returns the number of deleted artifacts.
    pub async fn cleanup_unreferenced_files(&self) -> Result<usize> {
        let guard = self.acquire_cleanup_exclusive().await;
        let files = get_unreferenced_files(
            &self.preserved_catalog,
            &self.pins,
            self.config.cleanup_max_files,
        )
        .await
        .context(CleanupSnafu)?;
        std::mem::drop(guard);

        // the found files can never become referenced again, so deleting them does not
        // need the lock
        delete_files(&self.artifact_store, &files)
            .await
            .context(CleanupSnafu)?;

        if !files.is_empty() {
            info!(n_files = files.len(), "deleted unreferenced artifacts");
        }
        Ok(files.len())
    }

    /// Background worker function
    pub async fn background_worker(&self, shutdown: CancellationToken) {
        info!(prefix=%self.artifact_store.prefix(), "started background worker");

        // object store cleanup loop
        let object_store_cleanup_loop = async {
            loop {
                self.worker_iterations_cleanup
                    .fetch_add(1, Ordering::Relaxed);

                // Perform this sleep BEFORE the actual clean-up so that we don't immediately
                // run a clean-up on startup.
                let duration = self.config.cleanup_interval;
                debug!(?duration, "cleanup worker sleeps");
                tokio::time::sleep(duration).await;

                if let Err(e) = self.cleanup_unreferenced_files().await {
                    error!(%e, "error while cleaning unreferenced artifacts");
                }
            }
        };

        // The loop does not need to perform drain logic on shutdown.
        tokio::select! {
            _ = object_store_cleanup_loop => error!("object store cleanup loop exited - db worker bailing out"),
            _ = shutdown.cancelled() => info!("db worker shutting down"),
        }

        info!("finished db background worker");
    }

    /// Number of iterations of the cleanup loop so far
    pub fn worker_iterations_cleanup(&self) -> usize {
        self.worker_iterations_cleanup.load(Ordering::Relaxed)
    }
}
