//! Per-node mutual-exclusion leases.
//!
//! No two remediation attempts, and no remediation attempt and detection
//! read, may touch the same node concurrently. A lease is held for the whole
//! duration of an attempt or a per-node collection; a second caller for the
//! same node queues until release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held lease for one node. Released on drop.
pub type NodeLease = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct NodeLeases {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl NodeLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lease for `node`, waiting if another holder is active.
    pub async fn acquire(&self, node: &str) -> NodeLease {
        let mutex = {
            let mut map = self.inner.lock().expect("lease map poisoned");
            map.entry(node.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}
