//! Per-identity serialization.
//!
//! Every dispatch holds its identity's gate for the whole cycle, so two
//! events for the same identity run one after another in arrival order
//! (tokio mutexes are fair), while different identities proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

type EntryMap = Arc<StdMutex<HashMap<String, GateEntry>>>;

struct GateEntry {
    lock: Arc<Mutex<()>>,
    /// Holders plus waiters; only changed under the map lock.
    permits: usize,
}

/// Map of identity -> async lock, pruned when unused.
#[derive(Clone, Default)]
pub struct IdentityGate {
    inner: EntryMap,
}

/// Held while an identity's dispatch runs.
pub struct IdentityGuard {
    _lock_guard: OwnedMutexGuard<()>,
    _permit: GatePermit,
}

struct GatePermit {
    key: String,
    inner: EntryMap,
}

impl IdentityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> IdentityGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = map.entry(key.to_string()).or_insert_with(|| GateEntry {
                lock: Arc::new(Mutex::new(())),
                permits: 0,
            });
            entry.permits += 1;
            Arc::clone(&entry.lock)
        };
        // Built before awaiting so a cancelled acquire still releases its permit.
        let permit = GatePermit {
            key: key.to_string(),
            inner: Arc::clone(&self.inner),
        };
        let lock_guard = lock.lock_owned().await;
        IdentityGuard {
            _lock_guard: lock_guard,
            _permit: permit,
        }
    }

    /// Number of identities currently holding or waiting on the gate.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&self.key) {
            entry.permits = entry.permits.saturating_sub(1);
            if entry.permits == 0 {
                map.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_identity_is_serialized() {
        let gate = IdentityGate::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let first = gate.acquire("alice").await;
        let waiter = {
            let gate = gate.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = gate.acquire("alice").await;
                order.lock().unwrap().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        order.lock().unwrap().push("first");
        drop(first);
        waiter.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn different_identities_do_not_block() {
        let gate = IdentityGate::new();
        let _alice = gate.acquire("alice").await;
        let bob = tokio::time::timeout(Duration::from_millis(200), gate.acquire("bob")).await;
        assert!(bob.is_ok());
        assert_eq!(gate.active(), 2);
    }

    #[tokio::test]
    async fn entries_are_pruned_after_release() {
        let gate = IdentityGate::new();
        {
            let _guard = gate.acquire("alice").await;
            assert_eq!(gate.active(), 1);
        }
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churn_never_admits_two_holders() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let gate = IdentityGate::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let inside = Arc::clone(&inside);
            let violations = Arc::clone(&violations);
            tasks.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let _guard = gate.acquire("alice").await;
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_releases_permit() {
        let gate = IdentityGate::new();
        let held = gate.acquire("alice").await;
        let attempt = tokio::time::timeout(Duration::from_millis(20), gate.acquire("alice")).await;
        assert!(attempt.is_err());
        drop(held);
        assert_eq!(gate.active(), 0);
    }
}
