//! Notification registry.
//!
//! Device backends register an object to signal when the guest notifies a
//! given address. Lookups happen on every guest notification, registrations
//! almost never, so the table is copy-on-write: readers clone the current
//! snapshot under the lock and search it unlocked, and a registration swaps in
//! a new snapshot. The old one is freed when its last reader drops it.
use crate::VmError;
use crossbeam_channel::Sender;
use spin_lock::SpinLock;
use std::sync::Arc;

/// Something the host can signal.
pub trait EventNotifier: Send + Sync {
    /// Wake whoever waits on the notifier.
    fn signal(&self);
}

impl EventNotifier for Sender<u32> {
    fn signal(&self) {
        // A full or disconnected channel already has a pending wakeup or
        // nobody to wake.
        let _ = self.try_send(1);
    }
}

#[derive(Clone)]
struct EventEntry {
    addr: u32,
    notifier: Arc<dyn EventNotifier>,
}

/// Map from guest notification address to notifier.
pub struct EventRegistry {
    map: SpinLock<Arc<[EventEntry]>>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            map: SpinLock::new(Arc::from(Vec::new())),
        }
    }

    /// Register `notifier` for `addr`.
    pub fn attach(&self, addr: u32, notifier: Arc<dyn EventNotifier>) -> Result<(), VmError> {
        if addr == 0 {
            return Err(VmError::InvalidEvent(addr));
        }
        let mut map = self.map.lock();
        let mut next = map.to_vec();
        next.push(EventEntry { addr, notifier });
        *map = next.into();
        log::debug!("event: attached {:#x}, {} entries", addr, map.len());
        Ok(())
    }

    /// Signal the notifier of `addr`. Returns whether one was registered.
    pub fn signal(&self, addr: u32) -> bool {
        let snapshot = self.map.lock().clone();
        match snapshot.iter().find(|e| e.addr == addr) {
            Some(entry) => {
                entry.notifier.signal();
                true
            }
            None => false,
        }
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
