//! Connection state machine.

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

/// Lifecycle state of a connection.
///
/// Transitions only move forward: `Open -> ShuttingDown -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake completed; channels may be opened.
    Open,
    /// A close is in progress.
    ShuttingDown,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Open => "open",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Guards [`ConnectionState`] so that check-and-transition is atomic.
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<ConnectionState>,
    #[cfg(test)]
    finished: AtomicUsize,
}

impl StateMachine {
    /// A machine in the `Open` state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Open),
            #[cfg(test)]
            finished: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.lock()
    }

    /// `Open -> ShuttingDown`.
    ///
    /// Returns true only for the single caller that performed the
    /// transition; every later caller gets false.
    pub fn try_begin_shutdown(&self) -> bool {
        let mut state = self.lock();
        match *state {
            ConnectionState::Open => {
                *state = ConnectionState::ShuttingDown;
                true
            }
            ConnectionState::ShuttingDown | ConnectionState::Closed => false,
        }
    }

    /// `ShuttingDown -> Closed`.
    ///
    /// Returns false, leaving the state untouched, when called from any
    /// other state.
    pub fn finish_shutdown(&self) -> bool {
        let mut state = self.lock();
        match *state {
            ConnectionState::ShuttingDown => {
                *state = ConnectionState::Closed;
                #[cfg(test)]
                self.finished.fetch_add(1, Ordering::SeqCst);
                true
            }
            ConnectionState::Open | ConnectionState::Closed => {
                warn!(state = state.as_str(), "finish_shutdown outside of shutdown");
                false
            }
        }
    }

    /// Number of `ShuttingDown -> Closed` transitions performed.
    #[cfg(test)]
    pub(crate) fn finish_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        // The guarded value is a plain enum; a poisoned lock still holds a valid state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn forward_transitions() {
        let machine = StateMachine::new();
        assert_eq!(machine.current(), ConnectionState::Open);

        assert!(machine.try_begin_shutdown());
        assert_eq!(machine.current(), ConnectionState::ShuttingDown);

        assert!(machine.finish_shutdown());
        assert_eq!(machine.current(), ConnectionState::Closed);
    }

    #[test]
    fn transitions_happen_at_most_once() {
        let machine = StateMachine::new();
        assert!(machine.try_begin_shutdown());
        assert!(!machine.try_begin_shutdown());
        assert!(machine.finish_shutdown());
        assert!(!machine.finish_shutdown());
        assert!(!machine.try_begin_shutdown());
        assert_eq!(machine.current(), ConnectionState::Closed);
        assert_eq!(machine.finish_count(), 1);
    }

    #[test]
    fn finish_without_begin_is_rejected() {
        let machine = StateMachine::new();
        assert!(!machine.finish_shutdown());
        assert_eq!(machine.current(), ConnectionState::Open);
    }

    #[test]
    fn exactly_one_concurrent_caller_wins() {
        let machine = Arc::new(StateMachine::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let machine = Arc::clone(&machine);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if machine.try_begin_shutdown() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(machine.current(), ConnectionState::ShuttingDown);
    }
}
