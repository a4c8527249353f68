// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The key/value table attached to every report.
//!
//! One mutex serializes every mutation, whether it comes from application threads, from
//! initialization, or from the dump path. The table itself is only allocated on first write.
//! Report generation after a crash reads it with [`AnnotationStore::try_snapshot`] so that a lock
//! held by the crashed thread can never deadlock the collector.

use crashcap_common::MutexExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct AnnotationStore {
    table: Mutex<Option<HashMap<String, String>>>,
}

/// Exclusive access to the table, for callers that need several updates to appear together.
pub struct AnnotationGuard<'a> {
    guard: MutexGuard<'a, Option<HashMap<String, String>>>,
}

impl AnnotationGuard<'_> {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.guard
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.guard.as_mut()?.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.guard.as_ref()?.get(key).map(String::as_str)
    }
}

impl AnnotationStore {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> AnnotationGuard<'_> {
        AnnotationGuard {
            guard: self.table.lock_or_recover(),
        }
    }

    /// Last write wins.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().set(key, value);
    }

    /// Removing from a table that was never written is a no-op and does not create it.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).map(str::to_owned)
    }

    /// Whether anything was ever written.
    pub fn is_created(&self) -> bool {
        self.table.lock_or_recover().is_some()
    }

    /// A sorted copy of the table; empty if it was never created.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        copy_table(&self.table.lock_or_recover())
    }

    /// Like [`Self::snapshot`], but gives up instead of waiting if the lock is held.
    pub fn try_snapshot(&self) -> Option<BTreeMap<String, String>> {
        self.table
            .try_lock_or_recover()
            .map(|table| copy_table(&table))
    }
}

fn copy_table(table: &Option<HashMap<String, String>>) -> BTreeMap<String, String> {
    table
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_table_is_created_lazily() {
        let store = AnnotationStore::new();
        assert!(!store.is_created());
        assert_eq!(store.remove("missing"), None);
        assert!(!store.is_created());
        store.set("a", "1");
        assert!(store.is_created());
        assert_eq!(store.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn test_last_write_wins() {
        let store = AnnotationStore::new();
        store.set("key", "first");
        store.set("key", "second");
        assert_eq!(store.snapshot().get("key").map(String::as_str), Some("second"));
        assert_eq!(store.remove("key").as_deref(), Some("second"));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_try_snapshot_gives_up_while_locked() {
        let store = AnnotationStore::new();
        store.set("a", "1");
        {
            let mut guard = store.lock();
            guard.set("b", "2");
            assert_eq!(guard.get("a"), Some("1"));
            assert!(store.try_snapshot().is_none());
        }
        let snapshot = store.try_snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(AnnotationStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        store.set(format!("t{i}.{j}"), j.to_string());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.snapshot().len(), 800);
    }
}
