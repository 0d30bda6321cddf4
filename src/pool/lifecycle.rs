use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting calls
    Open,
    /// `close()` was called; in-flight calls finish, new ones are refused
    Closed,
    /// `terminate()` was called; terminal
    Terminated,
}

impl PoolState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PoolState::Open,
            1 => PoolState::Closed,
            _ => PoolState::Terminated,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Open => "open",
            PoolState::Closed => "closed",
            PoolState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Shared view of a pool's state, also held by its async handles
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == PoolState::Open
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == PoolState::Terminated
    }

    /// Open → Closed; false in any other state
    pub fn close(&self) -> bool {
        self.state
            .compare_exchange(
                PoolState::Open as u8,
                PoolState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Anything → Terminated; false if already terminated
    pub fn terminate(&self) -> bool {
        let previous = self.state.swap(PoolState::Terminated as u8, Ordering::AcqRel);
        previous != PoolState::Terminated as u8
    }
}
