//! The [`LockableObject`] and its guards.
//!
//! Logical lock state lives in a small [`parking_lot::Mutex`] that is only
//! ever held for the duration of a single [`LockState::transition`]. Waiters
//! park on a [`tokio::sync::Notify`] and re-check after every release.
//!
//! The protected value sits behind a separate [`parking_lot::RwLock`]. Because
//! an exclusive holder that got there by upgrading coexists with the shared
//! holders that were already present, the guards do not hand out long-lived
//! references: callers borrow the value through [`SharedGuard::read`] or
//! [`ExclusiveGuard::write`] and must drop that borrow before the next
//! `.await`.
use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error};

pub mod state;

use state::{Denied, LockEvent, LockMode, LockState};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("shared-exclusive lock on {level} is already held")]
    SharedExclusiveContended { level: LockLevel },

    #[error("{mode} lock on {level} is not available without waiting")]
    WouldBlock { level: LockLevel, mode: LockMode },

    #[error("timed out after {timeout:?} waiting for {mode} lock on {level}")]
    Timeout {
        level: LockLevel,
        mode: LockMode,
        timeout: Duration,
    },
}

/// Position of a lock in the global acquisition order.
///
/// Locks must be acquired in increasing level. The cleanup lock is never held
/// together with a catalog lock and therefore sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    Cleanup,
    Tables,
    Table,
    Partition,
    Chunk,
}

impl LockLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::Tables => "tables",
            Self::Table => "table",
            Self::Partition => "partition",
            Self::Chunk => "chunk",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every guard so that child acquisitions can check they are
/// made under the right parent
pub trait HeldLock {
    fn level(&self) -> LockLevel;

    fn mode(&self) -> LockMode;
}

/// Panics in debug builds if a lock at `child` is about to be taken while
/// `parent` is held out of order.
#[track_caller]
pub fn assert_lock_order(parent: &dyn HeldLock, child: LockLevel) {
    debug_assert!(
        parent.level() < child,
        "lock order violation: acquiring {child} while holding {} {}",
        parent.mode(),
        parent.level(),
    );
}

/// Await `acquire`, giving up after `timeout` if one is set.
///
/// Dropping the acquisition on timeout is side-effect free.
pub async fn with_lock_timeout<G, F>(
    timeout: Option<Duration>,
    level: LockLevel,
    mode: LockMode,
    acquire: F,
) -> Result<G, LockError>
where
    F: Future<Output = G> + Send,
{
    match timeout {
        None => Ok(acquire.await),
        Some(timeout) => tokio::time::timeout(timeout, acquire)
            .await
            .map_err(|_| LockError::Timeout {
                level,
                mode,
                timeout,
            }),
    }
}

/// Counts acquisitions and time spent waiting across all locks created from
/// it.
#[derive(Default, Debug, Clone)]
pub struct LockTracker {
    inner: Arc<LockTrackerShared>,
}

#[derive(Debug, Default)]
struct LockTrackerShared {
    shared_count: AtomicU64,
    shared_exclusive_count: AtomicU64,
    exclusive_count: AtomicU64,
    upgrade_count: AtomicU64,
    contended_count: AtomicU64,
    shared_wait_nanos: AtomicU64,
    shared_exclusive_wait_nanos: AtomicU64,
    exclusive_wait_nanos: AtomicU64,
}

impl LockTracker {
    pub fn new_lock<T>(&self, level: LockLevel, t: T) -> Arc<LockableObject<T>> {
        Arc::new(LockableObject {
            level,
            state: Mutex::new(LockState::Unlocked),
            notify: Notify::new(),
            tracker: self.clone(),
            data: RwLock::new(t),
        })
    }

    pub fn shared_count(&self) -> u64 {
        self.inner.shared_count.load(Ordering::Relaxed)
    }

    pub fn shared_exclusive_count(&self) -> u64 {
        self.inner.shared_exclusive_count.load(Ordering::Relaxed)
    }

    pub fn exclusive_count(&self) -> u64 {
        self.inner.exclusive_count.load(Ordering::Relaxed)
    }

    pub fn upgrade_count(&self) -> u64 {
        self.inner.upgrade_count.load(Ordering::Relaxed)
    }

    /// Number of shared-exclusive requests refused because another
    /// shared-exclusive holder was present
    pub fn contended_count(&self) -> u64 {
        self.inner.contended_count.load(Ordering::Relaxed)
    }

    pub fn shared_wait_nanos(&self) -> u64 {
        self.inner.shared_wait_nanos.load(Ordering::Relaxed)
    }

    pub fn shared_exclusive_wait_nanos(&self) -> u64 {
        self.inner.shared_exclusive_wait_nanos.load(Ordering::Relaxed)
    }

    pub fn exclusive_wait_nanos(&self) -> u64 {
        self.inner.exclusive_wait_nanos.load(Ordering::Relaxed)
    }

    fn record(&self, mode: LockMode, waited: Option<Duration>) {
        let (count, wait) = match mode {
            LockMode::Shared => (&self.inner.shared_count, &self.inner.shared_wait_nanos),
            LockMode::SharedExclusive => (
                &self.inner.shared_exclusive_count,
                &self.inner.shared_exclusive_wait_nanos,
            ),
            LockMode::Exclusive => (&self.inner.exclusive_count, &self.inner.exclusive_wait_nanos),
        };
        count.fetch_add(1, Ordering::Relaxed);
        if let Some(waited) = waited {
            // saturating
            let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
            let _ = wait.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_add(nanos))
            });
        }
    }
}

/// A value guarded by an S/SX/X lock.
///
/// Always used through an `Arc` so that guards can be owned and moved across
/// tasks.
pub struct LockableObject<T> {
    level: LockLevel,
    state: Mutex<LockState>,
    notify: Notify,
    tracker: LockTracker,
    data: RwLock<T>,
}

impl<T> fmt::Debug for LockableObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockableObject")
            .field("level", &self.level)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl<T> LockableObject<T> {
    /// Create an untracked lock
    pub fn new(level: LockLevel, t: T) -> Arc<Self> {
        LockTracker::default().new_lock(level, t)
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Current logical state, for introspection only
    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    fn apply(&self, event: LockEvent) -> Result<(), Denied> {
        let mut state = self.state.lock();
        *state = state.transition(event)?;
        Ok(())
    }

    fn release(&self, mode: LockMode) {
        if let Err(e) = self.apply(LockEvent::Release(mode)) {
            error!(lock_level=%self.level, %mode, ?e, "released a lock that was not held");
            debug_assert!(false, "released {mode} lock on {} that was not held", self.level);
        }
        self.notify.notify_waiters();
    }
}

impl<T: Send + Sync> LockableObject<T> {
    fn try_acquire(self: &Arc<Self>, mode: LockMode) -> Result<Held<T>, LockError> {
        match self.apply(LockEvent::Acquire(mode)) {
            Ok(()) => {
                self.tracker.record(mode, None);
                Ok(Held {
                    lock: Arc::clone(self),
                    mode,
                })
            }
            Err(Denied::SharedExclusiveOutstanding) => {
                self.tracker
                    .inner
                    .contended_count
                    .fetch_add(1, Ordering::Relaxed);
                Err(LockError::SharedExclusiveContended { level: self.level })
            }
            Err(Denied::Incompatible | Denied::NotHeld) => Err(LockError::WouldBlock {
                level: self.level,
                mode,
            }),
        }
    }

    /// Wait until `mode` can be granted.
    ///
    /// The lock state is only touched at the instant of the grant, so the
    /// returned future can be dropped at any await point.
    async fn acquire(self: &Arc<Self>, mode: LockMode) -> Result<Held<T>, LockError> {
        let mut started: Option<Instant> = None;

        loop {
            // register interest before checking so a release in between
            // cannot be missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.apply(LockEvent::Acquire(mode)) {
                Ok(()) => {
                    self.tracker.record(mode, started.map(|s| s.elapsed()));
                    return Ok(Held {
                        lock: Arc::clone(self),
                        mode,
                    });
                }
                Err(Denied::Incompatible) => {
                    if started.is_none() {
                        debug!(lock_level=%self.level, %mode, "waiting for lock");
                        started = Some(Instant::now());
                    }
                    notified.await;
                }
                Err(Denied::SharedExclusiveOutstanding) => {
                    self.tracker
                        .inner
                        .contended_count
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(LockError::SharedExclusiveContended { level: self.level });
                }
                Err(Denied::NotHeld) => unreachable!("acquire never releases"),
            }
        }
    }

    /// Acquire a shared lock, waiting for any exclusive holder to release
    pub async fn shared(self: &Arc<Self>) -> SharedGuard<T> {
        match self.acquire(LockMode::Shared).await {
            Ok(held) => SharedGuard { held },
            Err(e) => unreachable!("shared acquisition cannot be refused: {e}"),
        }
    }

    /// Acquire a shared-exclusive lock.
    ///
    /// Waits for an exclusive holder, but fails immediately with
    /// [`LockError::SharedExclusiveContended`] if another shared-exclusive
    /// holder is present.
    pub async fn shared_exclusive(self: &Arc<Self>) -> Result<SharedExclusiveGuard<T>, LockError> {
        let held = self.acquire(LockMode::SharedExclusive).await?;
        Ok(SharedExclusiveGuard { held })
    }

    /// Acquire an exclusive lock, waiting for all other holders to release
    pub async fn exclusive(self: &Arc<Self>) -> ExclusiveGuard<T> {
        match self.acquire(LockMode::Exclusive).await {
            Ok(held) => ExclusiveGuard { held },
            Err(e) => unreachable!("exclusive acquisition cannot be refused: {e}"),
        }
    }

    pub fn try_shared(self: &Arc<Self>) -> Result<SharedGuard<T>, LockError> {
        let held = self.try_acquire(LockMode::Shared)?;
        Ok(SharedGuard { held })
    }

    pub fn try_shared_exclusive(self: &Arc<Self>) -> Result<SharedExclusiveGuard<T>, LockError> {
        let held = self.try_acquire(LockMode::SharedExclusive)?;
        Ok(SharedExclusiveGuard { held })
    }

    pub fn try_exclusive(self: &Arc<Self>) -> Result<ExclusiveGuard<T>, LockError> {
        let held = self.try_acquire(LockMode::Exclusive)?;
        Ok(ExclusiveGuard { held })
    }
}

/// A granted lock, released on drop
struct Held<T> {
    lock: Arc<LockableObject<T>>,
    mode: LockMode,
}

impl<T> Drop for Held<T> {
    fn drop(&mut self) {
        self.lock.release(self.mode)
    }
}

impl<T> fmt::Debug for Held<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Held")
            .field("level", &self.lock.level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// An owned shared (S) lock
pub struct SharedGuard<T> {
    held: Held<T>,
}

/// An owned shared-exclusive (SX) lock
pub struct SharedExclusiveGuard<T> {
    held: Held<T>,
}

/// An owned exclusive (X) lock
pub struct ExclusiveGuard<T> {
    held: Held<T>,
}

macro_rules! guard_common {
    ($guard:ident) => {
        impl<T> $guard<T> {
            /// Borrow the protected value. Drop the borrow before awaiting.
            pub fn read(&self) -> RwLockReadGuard<'_, T> {
                self.held.lock.data.read()
            }

            /// The lock this guard was granted on
            pub fn lockable(&self) -> &Arc<LockableObject<T>> {
                &self.held.lock
            }
        }

        impl<T> HeldLock for $guard<T> {
            fn level(&self) -> LockLevel {
                self.held.lock.level
            }

            fn mode(&self) -> LockMode {
                self.held.mode
            }
        }

        impl<T> fmt::Debug for $guard<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($guard))
                    .field("held", &self.held)
                    .finish()
            }
        }
    };
}

guard_common!(SharedGuard);
guard_common!(SharedExclusiveGuard);
guard_common!(ExclusiveGuard);

impl<T> SharedExclusiveGuard<T> {
    /// Convert into an exclusive lock.
    ///
    /// Never waits: shared holders present at this point keep their locks
    /// until they release them, while new shared requests queue behind the
    /// exclusive holder.
    pub fn upgrade(self) -> ExclusiveGuard<T> {
        let Self { mut held } = self;

        if let Err(e) = held.lock.apply(LockEvent::Upgrade) {
            // the guard proves SX is held so the state machine cannot refuse
            unreachable!("upgrade of held shared-exclusive lock refused: {e:?}");
        }
        held.lock.tracker.inner.upgrade_count.fetch_add(1, Ordering::Relaxed);
        held.mode = LockMode::Exclusive;

        ExclusiveGuard { held }
    }
}

impl<T> ExclusiveGuard<T> {
    /// Mutably borrow the protected value. Drop the borrow before awaiting.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.held.lock.data.write()
    }
}
