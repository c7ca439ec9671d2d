//! Per-key async mutual exclusion with automatic cleanup
//!
//! The orchestrator uses this to make the read-check-write step on a single
//! host atomic while operations on different hosts run in parallel. Entries
//! are stored as weak references and dropped as soon as the last guard for a
//! key goes away, so hosts that are idle hold no lock state.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = DashMap<K, Weak<Mutex<()>>>;

/// Guard for a single key; the key is released when this is dropped.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<Mutex<()>>,
    key: K,
    locks: Arc<LockMap<K>>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // The predicate runs under the shard write lock, which `get_or_create`
        // also needs, so nobody can upgrade the weak entry between the count
        // check and the removal.
        let mutex = &self.mutex;
        self.locks.remove_if(&self.key, |_, weak| {
            Arc::strong_count(mutex) == 1 && std::ptr::eq(weak.as_ptr(), Arc::as_ptr(mutex))
        });
    }
}

/// Serializes async sections per key.
///
/// ```rust,ignore
/// let locks = KeyedAsyncLock::<String>::new();
/// let guard = locks.lock(&"host-1".to_string()).await;
/// // check status and write the in-progress marker
/// drop(guard);
/// ```
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<LockMap<K>>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Waits until `key` is free and takes it.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let mutex = self.get_or_create(key);
        let guard = Arc::clone(&mutex).lock_owned().await;
        KeyedLockGuard {
            guard: Some(guard),
            mutex,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn get_or_create(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn same_key_sections_do_not_interleave() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let _guard = locks.lock(&"host-a".to_string()).await;
                    let seen = counter.load(Ordering::SeqCst);
                    sleep(Duration::from_millis(1)).await;
                    counter.store(seen + 1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyedAsyncLock::<String>::new();
        let _held = locks.lock(&"host-a".to_string()).await;

        let other = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&"host-b".to_string()),
        )
        .await;
        assert!(other.is_ok(), "unrelated host should not wait");
    }

    #[tokio::test]
    async fn entries_are_removed_when_last_guard_drops() {
        let locks = KeyedAsyncLock::<u32>::new();

        {
            let _a = locks.lock(&1).await;
            let _b = locks.lock(&2).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);

        for i in 0..500 {
            let _guard = locks.lock(&i).await;
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(KeyedAsyncLock::<u32>::new());
        let first = locks.lock(&7).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(&7).await;
            })
        };
        tokio::task::yield_now().await;
        drop(first);
        waiter.await.unwrap();

        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn only_one_concurrent_check_then_transition_wins() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let states = Arc::new(std::sync::Mutex::new(HashMap::from([(
            "h1".to_string(),
            "Pending",
        )])));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let states = Arc::clone(&states);
                let winners = Arc::clone(&winners);
                tokio::spawn(async move {
                    let _guard = locks.lock(&"h1".to_string()).await;
                    let current = states.lock().unwrap()["h1"];
                    tokio::task::yield_now().await;
                    if current == "Pending" {
                        states.lock().unwrap().insert("h1".to_string(), "Provisioning");
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }
}
