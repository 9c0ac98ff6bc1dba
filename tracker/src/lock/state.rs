//! The per-object lock state machine.
//!
//! Holds no waiting and no data: it only answers "given
//! the current state, what does this event turn it into?" so that the
//! compatibility rules can be tested in isolation.
use std::fmt;

/// The mode a lock is requested or held in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared (S): any number of concurrent holders
    Shared,

    /// Shared-exclusive (SX): a single holder that tolerates concurrent S
    /// holders and may upgrade to X
    SharedExclusive,

    /// Exclusive (X): a single holder
    Exclusive,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::SharedExclusive => "shared_exclusive",
            Self::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if a request for `request` can be granted while the
/// strongest mode currently held is `held`.
///
/// | held → / request ↓ | none | S | SX | X |
/// |---|---|---|---|---|
/// | S  | grant | grant | grant | deny |
/// | SX | grant | grant | deny  | deny |
/// | X  | grant | deny  | deny  | deny |
pub fn compatible(request: LockMode, held: Option<LockMode>) -> bool {
    use LockMode::*;

    match (request, held) {
        (_, None) => true,
        (Shared, Some(Shared | SharedExclusive)) => true,
        (SharedExclusive, Some(Shared)) => true,
        _ => false,
    }
}

/// State of a single lockable object.
///
/// `readers` counts shared holders. In [`LockState::Exclusive`] it is only
/// ever non-zero if the exclusive holder got there by upgrading from
/// shared-exclusive while shared holders were still active: those holders
/// keep their (detached) view until they release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,

    /// `readers` is always > 0
    Shared { readers: usize },

    SharedExclusive { readers: usize },

    Exclusive { readers: usize },
}

/// An input to [`LockState::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquire(LockMode),

    /// SX → X by the SX holder
    Upgrade,

    Release(LockMode),
}

/// Why a transition was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// The request is incompatible with the current holders, retry once
    /// something is released
    Incompatible,

    /// A shared-exclusive request met an outstanding shared-exclusive holder.
    /// This is not queued.
    SharedExclusiveOutstanding,

    /// Upgrade or release of a mode that is not held: a bug in the caller
    NotHeld,
}

impl LockState {
    /// The strongest mode currently held, if any
    pub fn held(&self) -> Option<LockMode> {
        match self {
            Self::Unlocked => None,
            Self::Shared { .. } => Some(LockMode::Shared),
            Self::SharedExclusive { .. } => Some(LockMode::SharedExclusive),
            Self::Exclusive { .. } => Some(LockMode::Exclusive),
        }
    }

    /// Number of shared holders
    pub fn readers(&self) -> usize {
        match self {
            Self::Unlocked => 0,
            Self::Shared { readers }
            | Self::SharedExclusive { readers }
            | Self::Exclusive { readers } => *readers,
        }
    }

    /// Apply `event` to this state
    pub fn transition(self, event: LockEvent) -> Result<Self, Denied> {
        use LockEvent::*;
        use LockMode::*;

        match (self, event) {
            // an outstanding SX is refused outright rather than queued
            (Self::SharedExclusive { .. }, Acquire(SharedExclusive)) => {
                Err(Denied::SharedExclusiveOutstanding)
            }
            (state, Acquire(mode)) if !compatible(mode, state.held()) => Err(Denied::Incompatible),

            (Self::Unlocked, Acquire(Shared)) => Ok(Self::Shared { readers: 1 }),
            (Self::Unlocked, Acquire(SharedExclusive)) => Ok(Self::SharedExclusive { readers: 0 }),
            (Self::Unlocked, Acquire(Exclusive)) => Ok(Self::Exclusive { readers: 0 }),
            (Self::Shared { readers }, Acquire(Shared)) => Ok(Self::Shared {
                readers: readers + 1,
            }),
            (Self::Shared { readers }, Acquire(SharedExclusive)) => {
                Ok(Self::SharedExclusive { readers })
            }
            (Self::SharedExclusive { readers }, Acquire(Shared)) => Ok(Self::SharedExclusive {
                readers: readers + 1,
            }),
            (_, Acquire(_)) => Err(Denied::Incompatible),

            // upgrade never waits for shared holders
            (Self::SharedExclusive { readers }, Upgrade) => Ok(Self::Exclusive { readers }),
            (_, Upgrade) => Err(Denied::NotHeld),

            (Self::Shared { readers: 1 }, Release(Shared)) => Ok(Self::Unlocked),
            (Self::Shared { readers }, Release(Shared)) => Ok(Self::Shared {
                readers: readers - 1,
            }),
            (Self::SharedExclusive { readers }, Release(Shared)) if readers > 0 => {
                Ok(Self::SharedExclusive {
                    readers: readers - 1,
                })
            }
            (Self::Exclusive { readers }, Release(Shared)) if readers > 0 => Ok(Self::Exclusive {
                readers: readers - 1,
            }),
            (Self::SharedExclusive { readers: 0 }, Release(SharedExclusive))
            | (Self::Exclusive { readers: 0 }, Release(Exclusive)) => Ok(Self::Unlocked),
            (Self::SharedExclusive { readers }, Release(SharedExclusive))
            | (Self::Exclusive { readers }, Release(Exclusive)) => Ok(Self::Shared { readers }),
            (_, Release(_)) => Err(Denied::NotHeld),
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => write!(f, "unlocked"),
            Self::Shared { readers } => write!(f, "S({readers})"),
            Self::SharedExclusive { readers } => write!(f, "SX+S({readers})"),
            Self::Exclusive { readers } => write!(f, "X+S({readers})"),
        }
    }
}
