//! Per-session mutual exclusion.
//!
//! The price-tick and fill handlers of one session never run concurrently;
//! different sessions never contend. Entries are created on first use and
//! removed only by [`SessionLocks::remove`] once the session has stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use log::debug;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async locks keyed by session id
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for a session
    fn entry(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to a session. Released when the guard drops,
    /// including on early returns and errors.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.entry(session_id);
        lock.lock_owned().await
    }

    /// Drop the lock for a stopped session. Holders of an existing guard are
    /// unaffected.
    pub fn remove(&self, session_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let removed = locks.remove(session_id).is_some();
        if removed {
            debug!("Removed session lock for {}", session_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
