//! Named locks for shared cache slots.
//!
//! Concurrent fetches of the same repository (or downloads of the same URL)
//! share one cache slot and must not observe a partially written clone.
//! Each slot is guarded by its own async mutex, so unrelated slots never
//! contend. Slots nobody holds or waits on are dropped the next time any
//! lock is taken, so the map stays as small as the set of busy keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard holding a named lock until dropped.
pub type KeyGuard = OwnedMutexGuard<()>;

/// A set of async locks addressed by key.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    /// Create an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting while another holder has it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            // A poisoned map only means a holder panicked mid-insert; the map itself is intact.
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        tracing::trace!(%key, "Waiting for cache lock");
        slot.lock_owned().await
    }

    /// Number of slots currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_default()
    }

    /// Whether no slot is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = KeyedLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("repo").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
        assert!(!locks.is_empty());
    }

    #[tokio::test]
    async fn test_released_slots_are_pruned() {
        let locks = KeyedLocks::new();
        for key in ["kubectl", "helm", "kustomize"] {
            drop(locks.lock(key).await);
        }
        assert_eq!(locks.len(), 1);

        let held = locks.lock("terraform").await;
        let _other = locks.lock("go").await;
        assert_eq!(locks.len(), 2);

        drop(held);
        drop(locks.lock("go-again").await);
        assert_eq!(locks.len(), 2);
    }
}
