//! This crate contains the data types that are shared between the catalog,
//! the preserved (durable) catalog and the lifecycle code: how chunks are
//! addressed, which storage class a chunk is in, and what a row looks like.

pub mod chunk_metadata;
pub mod timestamp;
pub mod write;
