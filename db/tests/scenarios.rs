//! End-to-end behavior of concurrent readers, writers and lifecycle actions, plus recovery
//! after a crash at either side of a catalog commit.
use std::{sync::Arc, time::Duration};

use data_types::{
    chunk_metadata::{ChunkAddr, ChunkId, ChunkStorage, PartitionAddr},
    write::{FieldValue, Row},
};
use db::{
    Db,
    catalog::chunk::ChunkSummary,
    chunk::{ChunkData, ChunkView},
    config::CatalogConfig,
};
use object_store::{ObjectStore, local::LocalFileSystem, memory::InMemory};
use pretty_assertions::assert_eq;
use preserved_catalog::interface::ArtifactInfo;
use test_log::test;
use tracker::{LockError, LockLevel, LockMode};

const TABLE: &str = "sensors";
const PARTITION: &str = "2023-01-01";

fn rows(times: &[i64]) -> Vec<Row> {
    times
        .iter()
        .map(|t| Row::new(*t).with_field("temp", FieldValue::F64(20.0 + *t as f64)))
        .collect()
}

async fn load(object_store: &Arc<dyn ObjectStore>) -> Db {
    Db::load(Arc::clone(object_store), CatalogConfig::new_testing())
        .await
        .unwrap()
}

async fn views(db: &Db) -> Vec<(ChunkId, ChunkView)> {
    db.get_snapshot_or_reference(TABLE, |_| true, |_: &ChunkSummary| true)
        .await
}

fn times(view: &ChunkView) -> Vec<i64> {
    view.rows().iter().map(|r| r.time).collect()
}

/// Assert that `handle` does not complete within a short grace period
async fn assert_blocked<T: std::fmt::Debug>(handle: &mut tokio::task::JoinHandle<T>) {
    let res = tokio::time::timeout(Duration::from_millis(50), handle).await;
    assert!(res.is_err(), "task should still be waiting for its lock");
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn writer_waits_for_table_reader() {
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let db = Arc::new(load(&object_store).await);
    db.write(TABLE, PARTITION, &rows(&[1])).await.unwrap();

    let reader = db.catalog().table_shared(TABLE).await.unwrap();

    let mut writer = {
        let db = Arc::clone(&db);
        tokio::spawn(async move { db.write(TABLE, PARTITION, &rows(&[2])).await })
    };
    assert_blocked(&mut writer).await;

    std::mem::drop(reader);
    let summary = writer.await.unwrap().unwrap();
    assert_eq!(summary.sequence, 2);
    assert!(db.lock_tracker().exclusive_wait_nanos() > 0);
}

#[test(tokio::test)]
async fn readers_share_with_lifecycle_action() {
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let db = Arc::new(load(&object_store).await);
    db.write(TABLE, PARTITION, &rows(&[1, 2])).await.unwrap();
    let catalog = db.catalog();

    let table = catalog.table_shared(TABLE).await.unwrap();
    let action = catalog
        .partition_shared_exclusive(&table, PARTITION)
        .await
        .unwrap();

    // two readers get in next to the lifecycle action
    let reader_1 = catalog.partition_shared(&table, PARTITION).await.unwrap();
    let reader_2 = catalog.partition_shared(&table, PARTITION).await.unwrap();
    let snapshot_1 = views(&db).await;
    let snapshot_2 = views(&db).await;

    let action = action.upgrade();
    assert_eq!(
        action.lockable().try_shared().unwrap_err(),
        LockError::WouldBlock {
            level: LockLevel::Partition,
            mode: LockMode::Shared
        }
    );

    // the readers keep working with what they already hold
    assert_eq!(reader_1.read().chunk_ids(), reader_2.read().chunk_ids());
    assert_eq!(times(&snapshot_1[0].1), vec![1, 2]);
    assert_eq!(times(&snapshot_2[0].1), vec![1, 2]);

    std::mem::drop(action);
    std::mem::drop(reader_1);
    std::mem::drop(reader_2);
    std::mem::drop(table);

    db.write(TABLE, PARTITION, &rows(&[3])).await.unwrap();
    assert_eq!(times(&snapshot_1[0].1), vec![1, 2]);
    assert_eq!(times(&views(&db).await[0].1), vec![1, 2, 3]);
    assert_eq!(db.lock_tracker().upgrade_count(), 1);
}

#[test(tokio::test)]
async fn compaction_crash_before_commit() {
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let db = load(&object_store).await;

    db.write(TABLE, PARTITION, &rows(&[1])).await.unwrap();
    let c1 = db.persist_partition(TABLE, PARTITION).await.unwrap().unwrap();
    db.write(TABLE, PARTITION, &rows(&[2])).await.unwrap();
    let c2 = db.persist_partition(TABLE, PARTITION).await.unwrap().unwrap();

    // the compacted artifact is written but the process dies before the transaction commits
    let inputs: Vec<_> = views(&db)
        .await
        .into_iter()
        .map(|(_, view)| match view {
            ChunkView::Reference(r) => Arc::clone(r.data()),
            ChunkView::Snapshot(_) => panic!("expected persisted chunks"),
        })
        .collect();
    let c3 = ChunkAddr::new(&PartitionAddr::new(TABLE, PARTITION), ChunkId::new());
    let (orphan, _) = db
        .artifact_store()
        .write(&c3, &ChunkData::merge(&inputs))
        .await
        .unwrap();
    std::mem::drop(inputs);
    std::mem::drop(db);

    let db = load(&object_store).await;
    let mut live: Vec<_> = views(&db).await.into_iter().map(|(id, _)| id).collect();
    live.sort();
    let mut expected = vec![c1, c2];
    expected.sort();
    assert_eq!(live, expected);

    assert_eq!(db.cleanup_unreferenced_files().await.unwrap(), 1);
    assert!(db.artifact_store().read::<ChunkData>(&orphan).await.is_err());
    assert_eq!(db.preserved_catalog().state().len(), 2);

    // live artifacts are untouched
    for info in db.preserved_catalog().state().iter() {
        db.artifact_store()
            .read::<ChunkData>(&info.path)
            .await
            .unwrap();
    }
}

#[test(tokio::test)]
async fn compaction_crash_after_commit() {
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let db = load(&object_store).await;

    db.write(TABLE, PARTITION, &rows(&[2])).await.unwrap();
    db.persist_partition(TABLE, PARTITION).await.unwrap().unwrap();
    db.write(TABLE, PARTITION, &rows(&[1])).await.unwrap();
    db.persist_partition(TABLE, PARTITION).await.unwrap().unwrap();

    let old: Vec<_> = db.preserved_catalog().state().iter().cloned().collect();
    let inputs: Vec<_> = views(&db)
        .await
        .into_iter()
        .filter_map(|(_, view)| match view {
            ChunkView::Reference(r) => Some(Arc::clone(r.data())),
            ChunkView::Snapshot(_) => None,
        })
        .collect();
    let data = ChunkData::merge(&inputs);
    std::mem::drop(inputs);

    // commit the compaction but die before the in-memory swap
    let addr = ChunkAddr::new(&PartitionAddr::new(TABLE, PARTITION), ChunkId::new());
    let (path, file_size_bytes) = db.artifact_store().write(&addr, &data).await.unwrap();
    let mut transaction = db.preserved_catalog().open_transaction().await;
    for info in &old {
        transaction.stage_remove(&info.path).unwrap();
    }
    transaction
        .stage_add(ArtifactInfo {
            path,
            table_name: TABLE.to_string(),
            partition_key: PARTITION.to_string(),
            chunk_id: addr.chunk_id,
            row_count: data.row_count(),
            file_size_bytes,
            time_range: data.time_range(),
            sequence: data.sequence(),
        })
        .unwrap();
    transaction.commit().await.unwrap();
    std::mem::drop(db);

    let db = load(&object_store).await;
    let live = views(&db).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].0, addr.chunk_id);
    assert_eq!(live[0].1.storage(), ChunkStorage::ObjectStoreChunk);
    assert_eq!(times(&live[0].1), vec![1, 2]);

    let summary = db.partition_summary(TABLE, PARTITION).await.unwrap();
    assert_eq!(summary.persisted.unwrap().max_sequence, 2);

    std::mem::drop(live);
    assert_eq!(db.cleanup_unreferenced_files().await.unwrap(), old.len());
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn snapshot_is_isolated_from_later_writes() {
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let db = Arc::new(load(&object_store).await);
    db.write(TABLE, PARTITION, &rows(&[1])).await.unwrap();
    let catalog = db.catalog();

    let table = catalog.table_shared(TABLE).await.unwrap();
    let partition = catalog.partition_shared(&table, PARTITION).await.unwrap();
    let chunk = partition.read().open_chunk().unwrap();
    let chunk = catalog.chunk_shared(&partition, &chunk).await.unwrap();
    let snapshot = chunk.read().snapshot_or_reference();
    assert_eq!(snapshot.storage(), ChunkStorage::OpenMutableBuffer);
    std::mem::drop(partition);
    std::mem::drop(table);

    // the writer gets through to the partition but has to wait for the chunk
    let mut writer = {
        let db = Arc::clone(&db);
        tokio::spawn(async move { db.write(TABLE, PARTITION, &rows(&[2])).await })
    };
    assert_blocked(&mut writer).await;

    std::mem::drop(chunk);
    writer.await.unwrap().unwrap();

    assert_eq!(times(&snapshot), vec![1]);
    assert_eq!(times(&views(&db).await[0].1), vec![1, 2]);
}

#[test(tokio::test)]
async fn reference_keeps_compacted_artifact() {
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let db = load(&object_store).await;

    db.write(TABLE, PARTITION, &rows(&[1])).await.unwrap();
    let c1 = db.persist_partition(TABLE, PARTITION).await.unwrap().unwrap();
    db.write(TABLE, PARTITION, &rows(&[2])).await.unwrap();
    let c2 = db.persist_partition(TABLE, PARTITION).await.unwrap().unwrap();

    let held = views(&db).await;
    db.compact_object_store_chunks(TABLE, PARTITION, &[c1, c2])
        .await
        .unwrap();

    // the references still point at the old artifacts
    assert_eq!(db.cleanup_unreferenced_files().await.unwrap(), 0);
    for (_, view) in &held {
        let ChunkView::Reference(r) = view else {
            panic!("persisted chunks are referenced");
        };
        let path = r.artifact_path().unwrap();
        assert!(db.pins().is_pinned(path));
        db.artifact_store().read::<ChunkData>(path).await.unwrap();
    }

    std::mem::drop(held);
    assert_eq!(db.cleanup_unreferenced_files().await.unwrap(), 2);
    assert_eq!(views(&db).await.len(), 1);
}

#[test(tokio::test)]
async fn restart_from_local_file_system() {
    let dir = tempfile::tempdir().unwrap();
    let object_store: Arc<dyn ObjectStore> =
        Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());

    let db = load(&object_store).await;
    db.write(TABLE, PARTITION, &rows(&[3, 1])).await.unwrap();
    db.write(TABLE, "2023-01-02", &rows(&[5])).await.unwrap();
    let persisted = db.persist_partition(TABLE, PARTITION).await.unwrap().unwrap();
    let revision_counter = db.preserved_catalog().revision_counter();
    std::mem::drop(db);
    std::mem::drop(object_store);

    let object_store: Arc<dyn ObjectStore> =
        Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
    let db = load(&object_store).await;
    assert_eq!(db.preserved_catalog().revision_counter(), revision_counter);

    let live = views(&db).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].0, persisted);
    assert_eq!(times(&live[0].1), vec![1, 3]);

    // writes continue after the persisted sequence numbers
    let summary = db.write(TABLE, PARTITION, &rows(&[4])).await.unwrap();
    assert_eq!(summary.sequence, 2);
    assert_eq!(db.cleanup_unreferenced_files().await.unwrap(), 0);
}
