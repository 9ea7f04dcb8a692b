//! Shared state between producers, the intake worker, and the loop closer.
//!
//! Two independent exclusivity guarantees protect the mutable state, and
//! they are never held together:
//! - the **queue** mutex guards only the frame intake queue and is held
//!   briefly for enqueue/dequeue;
//! - the **graph** mutex guards the pose graph (vertices, edges, indices)
//!   and is held for the full duration of every structural operation,
//!   including a complete optimization pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::map::{Frame, PoseGraph};

/// Lifecycle of a graph manager instance.
///
/// `Stopped` is terminal; no further mutation is accepted once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Uninitialized = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// State shared by every thread touching the back-end.
pub struct SharedState {
    /// The pose graph. Graph exclusivity guarantee.
    pub graph: Mutex<PoseGraph>,

    /// Frames awaiting conversion into vertices. Queue exclusivity
    /// guarantee; producers append, the worker consumes.
    pub frame_queue: Mutex<VecDeque<Frame>>,

    /// Lifecycle state.
    state: AtomicU8,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            graph: Mutex::new(PoseGraph::new()),
            frame_queue: Mutex::new(VecDeque::new()),
            state: AtomicU8::new(ManagerState::Uninitialized as u8),
        })
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ManagerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// Request a cooperative shutdown.
    ///
    /// Only the `Running → ShuttingDown` transition is performed; returns
    /// whether this call made it. The intake loop observes the flag between
    /// iterations and finalizes the transition to `Stopped`.
    pub fn request_shutdown(&self) -> bool {
        self.state
            .compare_exchange(
                ManagerState::Running as u8,
                ManagerState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        matches!(
            self.state(),
            ManagerState::ShuttingDown | ManagerState::Stopped
        )
    }

    pub fn mark_stopped(&self) {
        self.set_state(ManagerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let shared = SharedState::new();
        assert_eq!(shared.state(), ManagerState::Uninitialized);

        shared.set_state(ManagerState::Running);
        assert!(shared.is_running());
        assert!(!shared.is_shutdown_requested());

        assert!(shared.request_shutdown());
        assert_eq!(shared.state(), ManagerState::ShuttingDown);
        assert!(shared.is_shutdown_requested());

        // A second request is a no-op
        assert!(!shared.request_shutdown());

        shared.mark_stopped();
        assert_eq!(shared.state(), ManagerState::Stopped);
    }

    #[test]
    fn test_shutdown_request_requires_running() {
        let shared = SharedState::new();
        assert!(!shared.request_shutdown());
        assert_eq!(shared.state(), ManagerState::Uninitialized);
    }
}
