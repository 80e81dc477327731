//! Teardown phases of a unit host.
//!
//! Uses `ArcSwap` for lock-free reads of the current phase. Phases only move
//! forward.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Host teardown state.
///
/// State machine: Running -> StoppingWorkers -> UnitsCleared -> Released
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TeardownPhase {
    /// Load, unload and list are available.
    Running,
    /// The front-end is gone; the worker pool is draining and joining.
    StoppingWorkers,
    /// Workers have exited and every unit has been destroyed.
    UnitsCleared,
    /// The worker pool itself has been released.
    Released,
}

impl fmt::Display for TeardownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::StoppingWorkers => "stopping-workers",
            Self::UnitsCleared => "units-cleared",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// Shared, monotonic teardown phase. Clones observe the same phase.
#[derive(Debug, Clone)]
pub struct TeardownState {
    phase: Arc<ArcSwap<TeardownPhase>>,
}

impl TeardownState {
    /// Creates a state in [`TeardownPhase::Running`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Arc::new(ArcSwap::from_pointee(TeardownPhase::Running)),
        }
    }

    #[must_use]
    pub fn phase(&self) -> TeardownPhase {
        **self.phase.load()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase() == TeardownPhase::Running
    }

    /// Moves to `next` if it lies ahead of the current phase. Returns `true`
    /// if this call made the transition.
    pub fn advance(&self, next: TeardownPhase) -> bool {
        let previous = self.phase.rcu(|current| {
            if next > **current {
                Arc::new(next)
            } else {
                Arc::clone(current)
            }
        });
        next > *previous
    }
}

impl Default for TeardownState {
    fn default() -> Self {
        Self::new()
    }
}
