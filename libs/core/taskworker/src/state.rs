//! The activation currently executing on this thread.
//!
//! A child executor runs one handler at a time on a blocking thread, so the
//! slot is thread-local. [`CurrentTaskGuard`] clears it on every exit path,
//! including unwinding out of a panicking handler.

use crate::activation::{retries_remaining, TaskActivation};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentTaskState {
    pub id: String,
    pub namespace: String,
    pub taskname: String,
    pub attempt: u32,
    pub processing_deadline_duration: Duration,
    pub retries_remaining: bool,
}

impl CurrentTaskState {
    pub fn from_activation(activation: &TaskActivation) -> Self {
        Self {
            id: activation.id.clone(),
            namespace: activation.namespace.clone(),
            taskname: activation.taskname.clone(),
            attempt: activation.retry_state.attempts,
            processing_deadline_duration: activation.deadline(),
            retries_remaining: retries_remaining(
                activation.retry_state.attempts,
                activation.retry_state.max_attempts,
            ),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentTaskState>> = const { RefCell::new(None) };
}

pub fn current() -> Option<CurrentTaskState> {
    CURRENT.with(|slot| slot.borrow().clone())
}

pub fn set_current(activation: &TaskActivation) {
    set_current_state(CurrentTaskState::from_activation(activation));
}

pub fn set_current_state(state: CurrentTaskState) {
    CURRENT.with(|slot| *slot.borrow_mut() = Some(state));
}

pub fn clear_current() {
    CURRENT.with(|slot| *slot.borrow_mut() = None);
}

/// Holds the current-task slot for one execution.
#[must_use = "the task state is cleared as soon as the guard is dropped"]
pub struct CurrentTaskGuard {
    _private: (),
}

impl CurrentTaskGuard {
    pub fn enter(state: CurrentTaskState) -> Self {
        set_current_state(state);
        Self { _private: () }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        clear_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::activation;
    use std::panic;

    #[test]
    fn test_set_and_clear() {
        clear_current();
        assert_eq!(current(), None);

        set_current(&activation("abc", 1, 3));
        let state = current().unwrap();
        assert_eq!(state.id, "abc");
        assert_eq!(state.attempt, 1);
        assert!(state.retries_remaining);

        clear_current();
        assert_eq!(current(), None);
    }

    #[test]
    fn test_last_attempt_has_no_retries() {
        let state = CurrentTaskState::from_activation(&activation("abc", 2, 3));
        assert!(!state.retries_remaining);
        let state = CurrentTaskState::from_activation(&activation("abc", 0, 1));
        assert!(!state.retries_remaining);
    }

    #[test]
    fn test_guard_clears_on_drop() {
        {
            let _guard = CurrentTaskGuard::enter(CurrentTaskState::from_activation(&activation(
                "abc", 0, 1,
            )));
            assert_eq!(current().map(|s| s.id).as_deref(), Some("abc"));
        }
        assert_eq!(current(), None);
    }

    #[test]
    fn test_guard_clears_on_panic() {
        let result = panic::catch_unwind(|| {
            let _guard = CurrentTaskGuard::enter(CurrentTaskState::from_activation(&activation(
                "abc", 0, 1,
            )));
            panic!("handler blew up");
        });
        assert!(result.is_err());
        assert_eq!(current(), None);
    }

    #[test]
    fn test_slots_are_per_thread() {
        set_current(&activation("main", 0, 1));
        let seen = std::thread::spawn(current).join().unwrap();
        assert_eq!(seen, None);
        assert_eq!(current().map(|s| s.id).as_deref(), Some("main"));
        clear_current();
    }
}
