//! Per-thread write locks
//!
//! All mutations of one thread go through its lock, which is what makes
//! version allocation linearizable. Different threads never contend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct ThreadLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of a mutation
pub(crate) struct ThreadGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ThreadLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, thread_id: &str) -> ThreadGuard {
        let lock = {
            let mut locks = self.locks.lock();
            // Entries nobody else references are idle and can go
            if locks.len() > 1024 {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        ThreadGuard {
            _guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
