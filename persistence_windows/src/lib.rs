//! Tracking of what has been written to a partition and what of it is known
//! to be durable.
pub mod min_max_sequence;
pub mod persistence_windows;

pub use persistence_windows::{FlushHandle, PersistedWatermark, PersistenceWindow};
