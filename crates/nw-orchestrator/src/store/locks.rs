//! Per-router write locks

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use nw_core::types::DeviceId;

/// Serializes state document updates for each router within this process
#[derive(Default)]
pub struct DeviceLocks {
    locks: DashMap<DeviceId, Arc<Mutex<()>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a router's state document
    pub async fn acquire(&self, device: &DeviceId) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the DashMap shard lock is released before awaiting
        let lock = self
            .locks
            .entry(device.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
