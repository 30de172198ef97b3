//! # Snapshot-Based Shared State (RCU)
//!
//! Readers take a reference-counted immutable snapshot; a writer clones the
//! current value, mutates the copy, and publishes it atomically. Old
//! snapshots are freed when the last reader drops its `Arc`. Reads never
//! block on writes, which is the right trade for the client registry:
//! registration churn is rare next to send/receive volume.

use std::sync::Arc;

use parking_lot::RwLock;

/// A copy-on-write cell with lock-free-read snapshot semantics.
///
/// Writers serialize behind the internal write lock; each `update` sees the
/// latest published value.
#[derive(Debug)]
pub struct Rcu<T> {
    current: RwLock<Arc<T>>,
}

impl<T: Clone> Rcu<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// Returns the current snapshot. The snapshot stays consistent for as
    /// long as the caller holds it, regardless of concurrent updates.
    pub fn snapshot(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Clones the current value, applies `mutate`, and publishes the result.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.current.write();
        let mut copy = T::clone(&guard);
        let result = mutate(&mut copy);
        *guard = Arc::new(copy);
        result
    }
}

impl<T: Clone + Default> Default for Rcu<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_snapshot_isolated_from_later_updates() {
        let cell = Rcu::new(HashMap::from([(1u32, "a")]));
        let before = cell.snapshot();
        cell.update(|map| {
            map.insert(2, "b");
        });
        assert_eq!(before.len(), 1);
        assert_eq!(cell.snapshot().len(), 2);
    }

    #[test]
    fn test_update_returns_mutator_result() {
        let cell = Rcu::new(Vec::<u32>::new());
        let len = cell.update(|v| {
            v.push(7);
            v.len()
        });
        assert_eq!(len, 1);
    }

    #[test]
    fn test_concurrent_readers_see_some_published_value() {
        let cell = Arc::new(Rcu::new(0u64));
        let mut handles = Vec::new();
        for i in 1..=8u64 {
            let cell = Arc::clone(&cell);
            handles.push(std::thread::spawn(move || {
                cell.update(|v| *v = (*v).max(i));
                *cell.snapshot()
            }));
        }
        for handle in handles {
            let seen = handle.join().unwrap();
            assert!(seen >= 1 && seen <= 8);
        }
        assert_eq!(*cell.snapshot(), 8);
    }
}
