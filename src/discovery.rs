//! Service-discovery interface and an in-memory implementation.
//!
//! Discovery is an external collaborator: it owns backend health and
//! membership. The proxy copies the current address list from the handle
//! on each request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// A live subscription to one service's address set.
pub trait ServiceHandle: Send + Sync {
    /// Current `host:port` addresses for the service.
    fn addrs(&self) -> Vec<String>;

    /// Release the subscription. Must be idempotent.
    fn close(&self);
}

/// The discovery collaborator: yields a handle per service name.
pub trait ServiceDiscovery: Send + Sync {
    fn service(&self, name: &str) -> Arc<dyn ServiceHandle>;
}

/// In-memory `ServiceDiscovery` used by the test suite and the demo binary.
/// Address sets are shared with handed-out handles, so `set_addrs` is
/// visible to services immediately.
#[derive(Default)]
pub struct MemoryDiscovery {
    services: RwLock<HashMap<String, Arc<RwLock<Vec<String>>>>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the address set for `name`.
    pub fn set_addrs(&self, name: &str, addrs: Vec<String>) {
        let entry = {
            let services = self.services.read();
            services.get(name).cloned()
        };
        match entry {
            Some(list) => *list.write() = addrs,
            None => {
                self.services
                    .write()
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
                    .write()
                    .clone_from(&addrs);
            }
        }
    }
}

impl ServiceDiscovery for MemoryDiscovery {
    fn service(&self, name: &str) -> Arc<dyn ServiceHandle> {
        let addrs = self
            .services
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone();
        Arc::new(MemoryHandle {
            addrs,
            closed: AtomicBool::new(false),
        })
    }
}

struct MemoryHandle {
    addrs: Arc<RwLock<Vec<String>>>,
    closed: AtomicBool,
}

impl ServiceHandle for MemoryHandle {
    fn addrs(&self) -> Vec<String> {
        if self.closed.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.addrs.read().clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_visible_through_existing_handles() {
        let discovery = MemoryDiscovery::new();
        let handle = discovery.service("web");
        assert!(handle.addrs().is_empty());

        discovery.set_addrs("web", vec!["127.0.0.1:9001".into()]);
        assert_eq!(handle.addrs(), vec!["127.0.0.1:9001"]);
    }

    #[test]
    fn closed_handles_yield_nothing() {
        let discovery = MemoryDiscovery::new();
        discovery.set_addrs("web", vec!["127.0.0.1:9001".into()]);

        let handle = discovery.service("web");
        handle.close();
        handle.close();
        assert!(handle.addrs().is_empty());

        // a fresh handle is unaffected
        assert_eq!(discovery.service("web").addrs(), vec!["127.0.0.1:9001"]);
    }
}
