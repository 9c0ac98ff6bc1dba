//! CLI config for the chunk catalog

use std::time::Duration;

/// CLI config for the chunk catalog, its durable log and the cleanup worker
#[derive(Debug, Clone, clap::Parser)]
pub struct CatalogConfig {
    /// Path below which transaction files and chunk artifacts are stored in the object
    /// store.
    #[clap(
        long = "object-store-prefix",
        env = "CATALOG_OBJECT_STORE_PREFIX",
        default_value = "catalog",
        action
    )]
    pub object_store_prefix: String,

    /// Time the background worker sleeps between two cleanup sweeps.
    #[clap(
        long = "cleanup-interval",
        env = "CATALOG_CLEANUP_INTERVAL",
        default_value = "60s",
        value_parser = humantime::parse_duration,
    )]
    pub cleanup_interval: Duration,

    /// Maximum number of unreferenced artifacts removed by a single cleanup sweep.
    ///
    /// Bounds the time the sweep holds the cleanup lock exclusively.
    #[clap(
        long = "cleanup-max-files",
        env = "CATALOG_CLEANUP_MAX_FILES",
        default_value = "1000",
        action
    )]
    pub cleanup_max_files: usize,

    /// Give up on lifecycle operations (persist, compaction, drop) that wait longer than this
    /// for a catalog lock. Waits forever if unset.
    #[clap(
        long = "lock-wait-timeout",
        env = "CATALOG_LOCK_WAIT_TIMEOUT",
        value_parser = humantime::parse_duration,
    )]
    pub lock_wait_timeout: Option<Duration>,
}

impl CatalogConfig {
    /// Config for tests: short cleanup interval, no lock timeout
    pub fn new_testing() -> Self {
        Self {
            object_store_prefix: "catalog".to_string(),
            cleanup_interval: Duration::from_millis(10),
            cleanup_max_files: 1_000,
            lock_wait_timeout: None,
        }
    }
}
