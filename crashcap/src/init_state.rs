// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crashcap_common::MutexExt;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationState {
    Uninitialized,
    Initializing,
    Initialized(bool),
}

/// Runs a fallible setup at most once per guard.
///
/// The first caller moves the state to `Initializing` and runs the closure outside the lock.
/// Everybody else, concurrent or late, blocks until the terminal state is reached and gets the
/// same result. Nobody observes `Initializing` through [`InitGuard::run_once`].
#[derive(Debug)]
pub struct InitGuard {
    state: Mutex<InitializationState>,
    finished: Condvar,
}

impl Default for InitGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the attempt failed if the winning closure unwinds, so waiters are not stranded.
struct FinishOnDrop<'a> {
    guard: &'a InitGuard,
    result: bool,
}

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        *self.guard.state.lock_or_recover() = InitializationState::Initialized(self.result);
        self.guard.finished.notify_all();
    }
}

impl InitGuard {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(InitializationState::Uninitialized),
            finished: Condvar::new(),
        }
    }

    pub fn state(&self) -> InitializationState {
        *self.state.lock_or_recover()
    }

    pub fn run_once(&self, f: impl FnOnce() -> bool) -> bool {
        {
            let mut state = self.state.lock_or_recover();
            loop {
                match *state {
                    InitializationState::Initialized(result) => return result,
                    InitializationState::Initializing => {
                        state = self
                            .finished
                            .wait(state)
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                    }
                    InitializationState::Uninitialized => {
                        *state = InitializationState::Initializing;
                        break;
                    }
                }
            }
        }

        let mut finish = FinishOnDrop {
            guard: self,
            result: false,
        };
        finish.result = f();
        finish.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_runs_once_and_caches_result() {
        let guard = InitGuard::new();
        assert_eq!(guard.state(), InitializationState::Uninitialized);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let result = guard.run_once(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            });
            assert!(!result);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.state(), InitializationState::Initialized(false));
    }

    #[test]
    fn test_concurrent_callers_see_the_winner() {
        const THREADS: usize = 16;
        let guard = Arc::new(InitGuard::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    guard.run_once(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        true
                    })
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_attempt_counts_as_failure() {
        let guard = Arc::new(InitGuard::new());
        let guard_clone = Arc::clone(&guard);
        let result = std::thread::spawn(move || guard_clone.run_once(|| panic!("setup failed")))
            .join();
        assert!(result.is_err());
        assert_eq!(guard.state(), InitializationState::Initialized(false));
        assert!(!guard.run_once(|| true));
    }
}
