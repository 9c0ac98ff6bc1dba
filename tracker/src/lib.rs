//! Locking primitives for the catalog.
//!
//! The [`LockableObject`] implements the three lock modes used by the catalog
//! hierarchy:
//!
//! * **shared (S):** any number of readers
//! * **shared-exclusive (SX):** a single "read, then maybe write" holder that
//!   tolerates concurrent shared readers and can [upgrade] to exclusive at any
//!   time without waiting for them
//! * **exclusive (X):** a single writer
//!
//! Acquisitions are futures. A request that cannot be granted parks until a
//! release makes it compatible, and dropping the future abandons the request
//! without touching the lock state.
//!
//! [upgrade]: SharedExclusiveGuard::upgrade

pub mod lock;

pub use lock::{
    ExclusiveGuard, HeldLock, LockError, LockLevel, LockTracker, LockableObject,
    SharedExclusiveGuard, SharedGuard, assert_lock_order,
    state::{Denied, LockEvent, LockMode, LockState},
    with_lock_timeout,
};
