// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Tracks a single deadline shared by the successive waits of a crash sequence (monitor unwind,
/// handler hang-up, child reaping).
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    // 4ms per sched slice, give ~4x10 slices for reaping
    pub const MINIMUM_REAP_TIME: Duration = Duration::from_millis(160);

    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    /// Time left before the deadline, never less than [`Self::MINIMUM_REAP_TIME`] so a late
    /// caller still gets a chance to collect its children.
    pub fn remaining(&self) -> Duration {
        self.timeout
            .saturating_sub(self.start_time.elapsed())
            .max(Self::MINIMUM_REAP_TIME)
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining_strict(&self) -> Duration {
        self.timeout.saturating_sub(self.start_time.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.start_time.elapsed() >= self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_is_floored_by_reap_time() {
        let manager = TimeoutManager::new(Duration::from_millis(50));
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_REAP_TIME);
    }

    #[test]
    fn test_remaining_strict_reaches_zero() {
        let manager = TimeoutManager::new(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert!(manager.expired());
        assert_eq!(manager.remaining_strict(), Duration::ZERO);
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_REAP_TIME);
    }

    #[test]
    fn test_fresh_manager_is_not_expired() {
        let manager = TimeoutManager::new(Duration::from_secs(5));
        assert!(!manager.expired());
        assert!(manager.remaining_strict() > Duration::from_secs(4));
        let debug_str = format!("{manager:?}");
        assert!(debug_str.contains("remaining"));
    }
}
