//! Errors that can occur during lifecycle actions
use crate::catalog;
use data_types::chunk_metadata::{ChunkAddr, PartitionAddr};
use snafu::Snafu;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Snafu)]
// Export the snafu "selectors" so they can be used in other modules
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(context(false), display("{}", source))]
    CatalogError { source: catalog::Error },

    #[snafu(context(false), display("{}", source))]
    PartitionError { source: catalog::partition::Error },

    #[snafu(context(false), display("{}", source))]
    ChunkError { source: catalog::chunk::Error },

    #[snafu(context(false), display("{}", source))]
    LockError { source: tracker::LockError },

    #[snafu(display("Error reading from object store: {}", source))]
    ReadingObjectStore {
        source: preserved_catalog::storage::Error,
    },

    #[snafu(display("Error writing to object store: {}", source))]
    WritingToObjectStore {
        source: preserved_catalog::storage::Error,
    },

    #[snafu(display("Error while commiting transaction on preserved catalog: {}", source))]
    CommitError {
        source: preserved_catalog::core::Error,
    },

    #[snafu(display("Cannot drop open chunk: {}", addr))]
    CannotDropOpenChunk { addr: ChunkAddr },

    #[snafu(display("No object store chunks provided for compacting"))]
    EmptyChunks {},

    #[snafu(display("Cannot compact chunks because at least one is not yet persisted"))]
    ChunksNotPersisted {},

    #[snafu(display("A persist of {} is already in progress", partition))]
    PersistInProgress { partition: PartitionAddr },
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
