//! Per-service backend address pool.

use parking_lot::RwLock;

/// Ordered set of backend addresses (`host:port`) safe for concurrent
/// read/write. The pool imposes no ordering; callers order a snapshot
/// per request.
#[derive(Debug, Default)]
pub struct BackendPool {
    addrs: RwLock<Vec<String>>,
}

impl BackendPool {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs: RwLock::new(addrs),
        }
    }

    /// Atomically replace the address list.
    pub fn update(&self, addrs: Vec<String>) {
        *self.addrs.write() = addrs;
    }

    /// Independent copy of the current list. Readers never alias live state.
    pub fn snapshot(&self) -> Vec<String> {
        self.addrs.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.read().is_empty()
    }
}
