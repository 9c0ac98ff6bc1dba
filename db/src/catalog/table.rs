//! The catalog representation of a Table
use std::{collections::HashMap, sync::Arc};

use data_types::chunk_metadata::PartitionAddr;
use tracker::{LockLevel, LockTracker, LockableObject};

use super::partition::Partition;

/// A `Table` is a collection of `Partition` each of which is a collection of `Chunk`
#[derive(Debug)]
pub struct Table {
    name: Arc<str>,

    /// key is partition key
    partitions: HashMap<Arc<str>, Arc<LockableObject<Partition>>>,

    tracker: LockTracker,
}

impl Table {
    pub(super) fn new(name: Arc<str>, tracker: LockTracker) -> Self {
        Self {
            name,
            partitions: Default::default(),
            tracker,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn partition(&self, partition_key: &str) -> Option<Arc<LockableObject<Partition>>> {
        self.partitions.get(partition_key).map(Arc::clone)
    }

    /// Partitions ordered by key
    pub fn partitions(&self) -> Vec<(Arc<str>, Arc<LockableObject<Partition>>)> {
        let mut partitions: Vec<_> = self
            .partitions
            .iter()
            .map(|(key, p)| (Arc::clone(key), Arc::clone(p)))
            .collect();
        partitions.sort_by(|a, b| a.0.cmp(&b.0));
        partitions
    }

    pub fn partition_keys(&self) -> Vec<Arc<str>> {
        self.partitions().into_iter().map(|(key, _)| key).collect()
    }

    pub fn get_or_create_partition(&mut self, partition_key: &str) -> Arc<LockableObject<Partition>> {
        if let Some(partition) = self.partitions.get(partition_key) {
            return Arc::clone(partition);
        }

        let key: Arc<str> = Arc::from(partition_key);
        let addr = PartitionAddr::new(Arc::clone(&self.name), Arc::clone(&key));
        let partition = self
            .tracker
            .new_lock(LockLevel::Partition, Partition::new(addr, self.tracker.clone()));
        self.partitions.insert(key, Arc::clone(&partition));
        partition
    }
}
