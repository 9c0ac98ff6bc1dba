//! Reference counting of artifacts that are still being read.
//!
//! Removing an artifact from the catalog is only a soft-delete. Every holder of an
//! [`ArtifactPin`] keeps the file alive: the cleanup sweep skips pinned paths, so the bytes
//! stay readable until the last pin for the path is dropped. Dropping the last pin also
//! removes the path from the registry.
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::paths::ArtifactPath;

type PinMap = Mutex<HashMap<ArtifactPath, Weak<ArtifactPin>>>;

/// A counted claim on an artifact path. The path is pinned while any clone of the
/// surrounding `Arc` is alive.
#[derive(Debug)]
pub struct ArtifactPin {
    path: ArtifactPath,
    registry: Weak<PinMap>,
}

impl ArtifactPin {
    pub fn path(&self) -> &ArtifactPath {
        &self.path
    }
}

impl Drop for ArtifactPin {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut pins = registry.lock();

        // a new pin for the same path may already have replaced this entry
        if pins
            .get(&self.path)
            .is_some_and(|pin| pin.strong_count() == 0)
        {
            pins.remove(&self.path);
        }
    }
}

/// Registry of all currently pinned artifacts.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: Arc<PinMap>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `path`. Pins of the same path share one counter.
    pub fn pin(&self, path: &ArtifactPath) -> Arc<ArtifactPin> {
        let mut pins = self.pins.lock();
        if let Some(pin) = pins.get(path).and_then(Weak::upgrade) {
            return pin;
        }

        let pin = Arc::new(ArtifactPin {
            path: path.clone(),
            registry: Arc::downgrade(&self.pins),
        });
        pins.insert(path.clone(), Arc::downgrade(&pin));
        pin
    }

    pub fn is_pinned(&self, path: &ArtifactPath) -> bool {
        self.pins
            .lock()
            .get(path)
            .map(|pin| pin.strong_count() > 0)
            .unwrap_or(false)
    }

    pub fn pinned_paths(&self) -> Vec<ArtifactPath> {
        self.pins
            .lock()
            .iter()
            .filter(|(_, pin)| pin.strong_count() > 0)
            .map(|(path, _)| path.clone())
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pins.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use data_types::chunk_metadata::{ChunkAddr, ChunkId, PartitionAddr};
    use uuid::Uuid;

    use super::*;
    use crate::paths::CatalogPrefix;

    fn path(id: u128) -> ArtifactPath {
        let addr = ChunkAddr::new(&PartitionAddr::new("t", "p"), ChunkId::new_test(id));
        ArtifactPath::new(&CatalogPrefix::new("c"), &addr, Uuid::from_u128(id))
    }

    #[test]
    fn test_pin_lifetime() {
        let registry = PinRegistry::new();
        assert!(!registry.is_pinned(&path(1)));

        let p1 = registry.pin(&path(1));
        let p1_again = registry.pin(&path(1));
        assert!(Arc::ptr_eq(&p1, &p1_again));
        assert_eq!(p1.path(), &path(1));

        let p2 = registry.pin(&path(2));
        let mut pinned = registry.pinned_paths();
        pinned.sort();
        assert_eq!(pinned, vec![path(1), path(2)]);

        drop(p1);
        assert!(registry.is_pinned(&path(1)));
        drop(p1_again);
        assert!(!registry.is_pinned(&path(1)));

        drop(p2);
        assert!(registry.pinned_paths().is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_dropped_pins_are_forgotten() {
        let registry = PinRegistry::new();

        // only touched through `pin` and drop, never swept
        for id in 0..1_000 {
            let pin = registry.pin(&path(id));
            assert!(registry.is_pinned(pin.path()));
        }
        assert_eq!(registry.len(), 0);

        // pins of one path share the entry, it goes away with the last of them
        let old = registry.pin(&path(1));
        let again = registry.pin(&path(1));
        drop(old);
        assert_eq!(registry.len(), 1);
        drop(again);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_pin_outlives_registry() {
        let registry = PinRegistry::new();
        let pin = registry.pin(&path(1));
        drop(registry);
        assert_eq!(pin.path(), &path(1));
        drop(pin);
    }
}
