//! Background worker lifecycle state
//!
//! The LRU list is owned by at most one worker thread at a time. Whether that
//! worker exists is tracked by a three-state atomic flag:
//!
//! | from        | to          | who      | when                                          |
//! |-------------|-------------|----------|-----------------------------------------------|
//! | `Stopped`   | `Running`   | enqueuer | no worker exists; the enqueuer spawns one     |
//! | `Running`   | `DoNotStop` | enqueuer | worker alive; forces at least one more loop   |
//! | `DoNotStop` | `Running`   | worker   | top of every loop iteration                   |
//! | `Running`   | `Stopped`   | worker   | queue empty and idle timeout elapsed          |
//!
//! The `Running -> Stopped` exchange fails if an enqueuer slipped in a
//! `DoNotStop` after the worker saw an empty queue, so no action is lost.

use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No worker thread exists
    Stopped = 0,
    /// A worker thread is looping
    Running = 1,
    /// A worker exists and must not exit on its next idle check
    DoNotStop = 2,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerState::Running,
            2 => WorkerState::DoNotStop,
            _ => WorkerState::Stopped,
        }
    }
}

/// Atomic cell holding a [`WorkerState`]
#[derive(Debug)]
pub struct AtomicWorkerState(AtomicU8);

impl AtomicWorkerState {
    pub fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Stopped as u8))
    }

    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `current` to `new`; returns true if the exchange happened
    pub fn transition(&self, current: WorkerState, new: WorkerState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicWorkerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_stopped() {
        let state = AtomicWorkerState::new();
        assert_eq!(state.load(), WorkerState::Stopped);
    }

    #[test]
    fn test_enqueuer_keeps_running_worker_alive() {
        let state = AtomicWorkerState::new();
        assert!(state.transition(WorkerState::Stopped, WorkerState::Running));

        // Enqueuer marks the live worker
        assert!(state.transition(WorkerState::Running, WorkerState::DoNotStop));

        // Worker's exit attempt fails and it loops again
        assert!(!state.transition(WorkerState::Running, WorkerState::Stopped));
        state.store(WorkerState::Running);
        assert!(state.transition(WorkerState::Running, WorkerState::Stopped));
    }

    #[test]
    fn test_only_one_starter_wins() {
        let state = AtomicWorkerState::new();
        assert!(state.transition(WorkerState::Stopped, WorkerState::Running));
        assert!(!state.transition(WorkerState::Stopped, WorkerState::Running));
    }
}
