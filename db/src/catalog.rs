//! This module contains the implementation of the chunk catalog: a tree of lockable
//! tables, partitions and chunks.
//!
//! Locks are always acquired top-down (tables, table, partition, chunk) and the write path
//! narrows its exclusive prefix as it descends, releasing the coarser lock as soon as the
//! finer one is held.
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use data_types::{
    chunk_metadata::ChunkId,
    write::{Row, rows_timestamp_range},
};
use mutable_buffer::MBChunk;
use snafu::{OptionExt, ResultExt, Snafu};
use persistence_windows::PersistedWatermark;
use tracing::debug;
use tracker::{
    ExclusiveGuard, HeldLock, LockError, LockLevel, LockMode, LockTracker, LockableObject,
    SharedExclusiveGuard, SharedGuard, assert_lock_order, with_lock_timeout,
};

use self::{
    chunk::{CatalogChunk, ChunkSummary},
    partition::Partition,
    table::Table,
};
use crate::chunk::ChunkView;

pub mod chunk;
pub mod partition;
pub mod table;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("table '{}' not found", table))]
    TableNotFound { table: String },

    #[snafu(display("partition '{}' not found in table '{}'", partition, table))]
    PartitionNotFound { partition: String, table: String },

    #[snafu(display("Cannot write an empty batch to table '{}'", table))]
    EmptyWrite { table: String },

    #[snafu(display("Error creating mutable buffer chunk: {}", source))]
    CreateMutableBuffer { source: mutable_buffer::Error },

    #[snafu(context(false), display("{}", source))]
    Lock { source: LockError },

    #[snafu(context(false), display("{}", source))]
    PartitionError { source: partition::Error },

    #[snafu(context(false), display("{}", source))]
    ChunkError { source: chunk::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The tables of the catalog, by name
pub type Tables = HashMap<Arc<str>, Arc<LockableObject<Table>>>;

/// Outcome of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// Sequence number assigned to the write
    pub sequence: u64,

    /// The open chunk the rows landed in
    pub chunk_id: ChunkId,
}

/// Point-in-time description of a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub key: Arc<str>,

    /// Summaries of all chunks, in creation order
    pub chunks: Vec<ChunkSummary>,

    /// Rows written but not yet persisted
    pub unpersisted_row_count: usize,

    pub persisted: Option<PersistedWatermark>,
}

/// InfluxDB IOx chunk catalog
#[derive(Debug)]
pub struct Catalog {
    tables: Arc<LockableObject<Tables>>,

    /// Last sequence number handed out to a write
    sequence: AtomicU64,

    /// Bound on lock waits of lifecycle actions
    lock_wait_timeout: Option<Duration>,

    tracker: LockTracker,
}

impl Catalog {
    /// Create a new empty `Catalog` whose locks report to `tracker`
    pub fn new(tracker: LockTracker, lock_wait_timeout: Option<Duration>) -> Self {
        Self {
            tables: tracker.new_lock(LockLevel::Tables, Tables::new()),
            sequence: AtomicU64::new(0),
            lock_wait_timeout,
            tracker,
        }
    }

    pub fn tables(&self) -> &Arc<LockableObject<Tables>> {
        &self.tables
    }

    pub fn lock_tracker(&self) -> &LockTracker {
        &self.tracker
    }

    /// Names of all tables, sorted
    pub async fn table_names(&self) -> Vec<Arc<str>> {
        let tables = self.tables.shared().await;
        let mut names: Vec<_> = tables.read().keys().map(Arc::clone).collect();
        names.sort();
        names
    }

    /// The last sequence number handed out
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Make sure future writes are sequenced after `sequence`
    pub fn advance_sequence(&self, sequence: u64) {
        self.sequence.fetch_max(sequence, Ordering::SeqCst);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write `rows` into the open chunk of the given partition, creating the table, the
    /// partition and the chunk as needed.
    pub async fn write(
        &self,
        table_name: &str,
        partition_key: &str,
        rows: &[Row],
    ) -> Result<WriteSummary> {
        let time_range = rows_timestamp_range(rows).context(EmptyWriteSnafu { table: table_name })?;

        let tables = self.tables.exclusive().await;
        let table = {
            let mut tables = tables.write();
            let table = tables.entry(Arc::from(table_name)).or_insert_with_key(|name| {
                debug!(table=%name, "creating table");
                self.tracker
                    .new_lock(LockLevel::Table, Table::new(Arc::clone(name), self.tracker.clone()))
            });
            Arc::clone(table)
        };
        assert_lock_order(&tables, LockLevel::Table);
        let table = table.exclusive().await;
        std::mem::drop(tables);

        let partition = table.write().get_or_create_partition(partition_key);
        assert_lock_order(&table, LockLevel::Partition);
        let partition = partition.exclusive().await;

        // allocated under the partition lock so sequences are increasing per partition
        let sequence = self.next_sequence();

        let open_chunk = partition.read().open_chunk();
        let chunk_id = match open_chunk {
            Some(chunk) => {
                assert_lock_order(&partition, LockLevel::Chunk);
                let chunk = chunk.exclusive().await;
                chunk.write().write(sequence, rows)?;
                chunk.read().id()
            }
            None => {
                let table_name = Arc::clone(table.read().name());
                let mb_chunk =
                    MBChunk::new(table_name, sequence, rows).context(CreateMutableBufferSnafu)?;
                let chunk = partition.write().create_open_chunk(mb_chunk)?;

                // nobody else can reach the chunk before the partition lock is released
                assert_lock_order(&partition, LockLevel::Chunk);
                let chunk = chunk.try_exclusive()?;
                debug!(chunk=%chunk.read().addr(), "created open chunk");
                chunk.read().id()
            }
        };

        partition.write().persistence_window_mut().add_range(
            sequence,
            rows.len(),
            time_range,
            Instant::now(),
        );
        std::mem::drop(partition);
        std::mem::drop(table);

        Ok(WriteSummary { sequence, chunk_id })
    }

    /// Detached views of the chunks of `table_name` that pass both predicates.
    ///
    /// Locks are only held while the views are taken. Returns an empty list for an unknown
    /// table.
    pub async fn snapshot_chunks<P, C>(
        &self,
        table_name: &str,
        partition_predicate: P,
        chunk_predicate: C,
    ) -> Vec<(ChunkId, ChunkView)>
    where
        P: Fn(&str) -> bool + Send + Sync,
        C: Fn(&ChunkSummary) -> bool + Send + Sync,
    {
        let tables = self.tables.shared().await;
        let table = tables.read().get(table_name).map(Arc::clone);
        let Some(table) = table else {
            return vec![];
        };
        assert_lock_order(&tables, LockLevel::Table);
        let table = table.shared().await;
        std::mem::drop(tables);

        let partitions = table.read().partitions();
        let mut views = vec![];
        for (partition_key, partition) in partitions {
            if !partition_predicate(&partition_key) {
                continue;
            }

            assert_lock_order(&table, LockLevel::Partition);
            let partition = partition.shared().await;
            let chunks = partition.read().chunks();

            for (chunk_id, chunk) in chunks {
                assert_lock_order(&partition, LockLevel::Chunk);
                let chunk = chunk.shared().await;
                let view = {
                    let chunk = chunk.read();
                    chunk_predicate(&chunk.summary()).then(|| chunk.snapshot_or_reference())
                };
                if let Some(view) = view {
                    views.push((chunk_id, view));
                }
            }
        }

        views
    }

    /// Take a shared lock on table `table_name`, traversing through the tables lock.
    ///
    /// Waits are bounded by the lifecycle lock timeout.
    pub async fn table_shared(&self, table_name: &str) -> Result<SharedGuard<Table>> {
        let tables = self
            .timed(LockLevel::Tables, LockMode::Shared, self.tables.shared())
            .await?;
        let table = tables.read().get(table_name).map(Arc::clone);
        let table = table.context(TableNotFoundSnafu { table: table_name })?;

        assert_lock_order(&tables, LockLevel::Table);
        let table = self
            .timed(LockLevel::Table, LockMode::Shared, table.shared())
            .await?;
        Ok(table)
    }

    /// Look up a partition of the locked `table`
    pub fn lockable_partition(
        table: &SharedGuard<Table>,
        partition_key: &str,
    ) -> Result<Arc<LockableObject<Partition>>> {
        assert_lock_order(table, LockLevel::Partition);
        let partition = table.read().partition(partition_key);
        partition.context(PartitionNotFoundSnafu {
            partition: partition_key,
            table: table.read().name().as_ref(),
        })
    }

    pub async fn partition_shared(
        &self,
        table: &SharedGuard<Table>,
        partition_key: &str,
    ) -> Result<SharedGuard<Partition>> {
        let partition = Self::lockable_partition(table, partition_key)?;
        let guard = self
            .timed(LockLevel::Partition, LockMode::Shared, partition.shared())
            .await?;
        Ok(guard)
    }

    /// Fails with [`LockError::SharedExclusiveContended`] if another lifecycle action holds
    /// the partition
    pub async fn partition_shared_exclusive(
        &self,
        table: &SharedGuard<Table>,
        partition_key: &str,
    ) -> Result<SharedExclusiveGuard<Partition>> {
        let partition = Self::lockable_partition(table, partition_key)?;
        let guard = self
            .timed(
                LockLevel::Partition,
                LockMode::SharedExclusive,
                partition.shared_exclusive(),
            )
            .await??;
        Ok(guard)
    }

    pub async fn partition_exclusive(
        &self,
        table: &SharedGuard<Table>,
        partition_key: &str,
    ) -> Result<ExclusiveGuard<Partition>> {
        let partition = Self::lockable_partition(table, partition_key)?;
        let guard = self
            .timed(LockLevel::Partition, LockMode::Exclusive, partition.exclusive())
            .await?;
        Ok(guard)
    }

    /// Exclusive lock on a partition for applying a change that is already durable.
    ///
    /// Unlike [`partition_exclusive`](Self::partition_exclusive) this waits as long as it
    /// takes.
    pub async fn partition_exclusive_for_swap(
        &self,
        table_name: &str,
        partition_key: &str,
    ) -> Result<(SharedGuard<Table>, ExclusiveGuard<Partition>)> {
        let tables = self.tables.shared().await;
        let table = tables.read().get(table_name).map(Arc::clone);
        let table = table.context(TableNotFoundSnafu { table: table_name })?;
        assert_lock_order(&tables, LockLevel::Table);
        let table = table.shared().await;
        std::mem::drop(tables);

        let partition = Self::lockable_partition(&table, partition_key)?;
        let partition = partition.exclusive().await;
        Ok((table, partition))
    }

    /// Take a shared lock on `chunk` below the held `partition` lock
    pub async fn chunk_shared<G>(
        &self,
        partition: &G,
        chunk: &Arc<LockableObject<CatalogChunk>>,
    ) -> Result<SharedGuard<CatalogChunk>>
    where
        G: HeldLock + Sync,
    {
        assert_lock_order(partition, LockLevel::Chunk);
        let guard = self
            .timed(LockLevel::Chunk, LockMode::Shared, chunk.shared())
            .await?;
        Ok(guard)
    }

    /// Take an exclusive lock on `chunk` below the held `partition` lock
    pub async fn chunk_exclusive<G>(
        &self,
        partition: &G,
        chunk: &Arc<LockableObject<CatalogChunk>>,
    ) -> Result<ExclusiveGuard<CatalogChunk>>
    where
        G: HeldLock + Sync,
    {
        assert_lock_order(partition, LockLevel::Chunk);
        let guard = self
            .timed(LockLevel::Chunk, LockMode::Exclusive, chunk.exclusive())
            .await?;
        Ok(guard)
    }

    /// Describe a partition and its chunks
    pub async fn partition_summary(
        &self,
        table_name: &str,
        partition_key: &str,
    ) -> Result<PartitionSummary> {
        let table = self.table_shared(table_name).await?;
        let partition = self.partition_shared(&table, partition_key).await?;
        std::mem::drop(table);

        let (key, chunks, unpersisted_row_count, persisted) = {
            let partition = partition.read();
            let window = partition.persistence_window();
            (
                Arc::from(partition.key()),
                partition.chunks(),
                window.unpersisted_row_count(),
                window.persisted(),
            )
        };

        let mut summaries = Vec::with_capacity(chunks.len());
        for (_, chunk) in chunks {
            let chunk = self.chunk_shared(&partition, &chunk).await?;
            summaries.push(chunk.read().summary());
        }

        Ok(PartitionSummary {
            key,
            chunks: summaries,
            unpersisted_row_count,
            persisted,
        })
    }

    async fn timed<G, F>(&self, level: LockLevel, mode: LockMode, acquire: F) -> Result<G, LockError>
    where
        F: Future<Output = G> + Send,
    {
        with_lock_timeout(self.lock_wait_timeout, level, mode, acquire).await
    }

    /// Get the partition lock for `table_name`/`partition_key` creating the table and the
    /// partition if needed. Used when rebuilding the catalog.
    pub(crate) async fn get_or_create_partition(
        &self,
        table_name: &str,
        partition_key: &str,
    ) -> Arc<LockableObject<Partition>> {
        let tables = self.tables.exclusive().await;
        let table = {
            let mut tables = tables.write();
            let table = tables.entry(Arc::from(table_name)).or_insert_with_key(|name| {
                self.tracker
                    .new_lock(LockLevel::Table, Table::new(Arc::clone(name), self.tracker.clone()))
            });
            Arc::clone(table)
        };
        assert_lock_order(&tables, LockLevel::Table);
        let table = table.exclusive().await;
        std::mem::drop(tables);

        table.write().get_or_create_partition(partition_key)
    }
}
