//! Contains an in memory mutable buffer that stores incoming rows in
//! a structure that is designed to be quickly appended to, and hands out
//! detached snapshots for queries.

mod chunk;
pub use chunk::*;
