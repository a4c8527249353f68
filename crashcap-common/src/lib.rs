// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Low-level process helpers used on the crash path.
//!
//! Everything in [`unix_utils`] is written so that it can be called after a crash signal has
//! been delivered: no locks, and no heap allocation unless stated otherwise on the item.

pub mod timeout;
pub mod unix_utils;

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// Lock helpers for plain-data state that stays usable after a panicking holder.
pub trait MutexExt<T> {
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
    /// `None` only if the lock is currently held.
    fn try_lock_or_recover(&self) -> Option<MutexGuard<'_, T>>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline(always)]
    fn try_lock_or_recover(&self) -> Option<MutexGuard<'_, T>> {
        match self.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_or_recover_after_panic() {
        let data = Arc::new(Mutex::new(5));
        let data_clone = Arc::clone(&data);
        let result = std::thread::spawn(move || {
            let mut num = data_clone.lock_or_recover();
            *num += 1;
            panic!("poison the lock");
        })
        .join();
        assert!(result.is_err());
        assert!(data.is_poisoned());
        assert_eq!(*data.lock_or_recover(), 6);
    }

    #[test]
    fn test_try_lock_or_recover_when_held() {
        let data = Mutex::new(());
        let _held = data.lock_or_recover();
        assert!(data.try_lock_or_recover().is_none());
    }
}
