//! Per-key single-flight locks.
//!
//! A lock exists only while someone holds or waits for it: acquiring bumps a
//! refcount and creates the slot on first use, releasing decrements and
//! removes the slot at zero. The table never retains entries with no
//! waiters, so it stays small no matter how many distinct keys pass through.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

struct LockSlot {
    refs: usize,
    lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, LockSlot>>,
}

impl KeyedLocks {
    pub fn new() -> KeyedLocks {
        KeyedLocks::default()
    }

    /// Wait for exclusive access to `key`. The returned guard releases on
    /// drop; it must not be held across calls that re-acquire the same key.
    pub async fn acquire(&self, key: &str) -> KeyedGuard<'_> {
        let lock = {
            let mut map = self.inner.lock();
            let slot = map.entry(key.to_string()).or_insert_with(|| LockSlot {
                refs: 0,
                lock: Arc::new(tokio::sync::Mutex::new(())),
            });
            slot.refs += 1;
            Arc::clone(&slot.lock)
        };
        let guard = lock.lock_owned().await;
        KeyedGuard {
            table: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of live slots; zero when nothing is in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut map = self.inner.lock();
        if let Some(slot) = map.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                map.remove(key);
            }
        }
    }
}

pub struct KeyedGuard<'a> {
    table: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex before touching the refcount so a waiter that
        // wakes up still finds the slot present.
        self.guard.take();
        self.table.release(&self.key);
    }
}
