//! Functionality to load a [`Catalog`](crate::catalog::Catalog) from a
//! [`PreservedCatalog`](preserved_catalog::core::PreservedCatalog).
use std::sync::Arc;

use object_store::ObjectStore;
use persistence_windows::PersistedWatermark;
use preserved_catalog::{
    core::PreservedCatalog, interface::LiveArtifacts, paths::CatalogPrefix, pin::PinRegistry,
    storage::ArtifactStore,
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{catalog::Catalog, chunk::ChunkData};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cannot load preserved catalog: {}", source))]
    LoadPreservedCatalog {
        source: preserved_catalog::core::Error,
    },

    #[snafu(display("Cannot read chunk artifact: {}", source))]
    ReadArtifact {
        source: preserved_catalog::storage::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Load preserved catalog state from store.
///
/// If no catalog exists yet, a new one will be created. Nothing is written until the first
/// transaction commits.
pub async fn load_or_create_preserved_catalog(
    object_store: Arc<dyn ObjectStore>,
    prefix: CatalogPrefix,
) -> Result<PreservedCatalog<LiveArtifacts>> {
    match PreservedCatalog::load(Arc::clone(&object_store), prefix.clone(), ())
        .await
        .context(LoadPreservedCatalogSnafu)?
    {
        Some(catalog) => {
            info!(
                %prefix,
                revision_counter=?catalog.revision_counter(),
                "found existing preserved catalog"
            );
            Ok(catalog)
        }
        None => {
            info!(%prefix, "found no existing preserved catalog, creating new one");
            Ok(PreservedCatalog::new_empty(object_store, prefix, ()))
        }
    }
}

/// Register an object store chunk in `catalog` for every live artifact of
/// `preserved_catalog`.
///
/// Restores the persisted watermark of every partition and makes sure new writes are
/// sequenced after everything that was persisted. Artifacts that already have a chunk are
/// skipped.
pub async fn rebuild_catalog(
    catalog: &Catalog,
    preserved_catalog: &PreservedCatalog<LiveArtifacts>,
    artifact_store: &ArtifactStore,
    pins: &PinRegistry,
) -> Result<()> {
    let state = preserved_catalog.state();

    for info in state.iter() {
        let data: ChunkData = artifact_store
            .read(&info.path)
            .await
            .context(ReadArtifactSnafu)?;

        let partition = catalog
            .get_or_create_partition(&info.table_name, &info.partition_key)
            .await;
        let partition = partition.exclusive().await;
        let mut partition = partition.write();

        if partition.has_artifact(&info.path) {
            debug!(path=%info.path, "artifact already in catalog");
            continue;
        }

        partition.insert_object_store_chunk(
            info.chunk_id,
            Arc::new(data),
            Arc::new(info.clone()),
            pins.pin(&info.path),
        );

        if let (Some(sequence), Some(time_range)) = (info.sequence, info.time_range) {
            partition
                .persistence_window_mut()
                .mark_persisted(PersistedWatermark {
                    max_sequence: sequence.max(),
                    max_time: time_range.max(),
                });
            catalog.advance_sequence(sequence.max());
        }
    }

    info!(
        n_artifacts=state.len(),
        revision_counter=?preserved_catalog.revision_counter(),
        "catalog rebuilt from preserved catalog"
    );

    Ok(())
}
