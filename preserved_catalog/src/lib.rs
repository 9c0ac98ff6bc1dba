//! Durable catalog of chunk artifacts.
//!
//! The [`PreservedCatalog`] is an append-only log of transactions in the object store. Each
//! transaction adds and removes chunk artifacts; replaying the log in revision order yields the
//! set of live artifacts. Removals are soft: an artifact stays in the store until a cleanup
//! sweep finds it neither live nor [pinned](pin::PinRegistry).
//!
//! [`PreservedCatalog`]: core::PreservedCatalog

pub mod cleanup;
pub mod core;
pub mod interface;
mod internals;
pub mod paths;
pub mod pin;
pub mod storage;

pub use internals::serialize::Error as SerializeError;
