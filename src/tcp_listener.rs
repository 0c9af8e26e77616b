//! Raw TCP listener for port-keyed routes.
//!
//! Each TCP route binds its own reuse-port listener. Accepted connections
//! are spliced to the first reachable backend of the route's service, with
//! the same shuffle-and-dial ordering the HTTP transport uses.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::backend::BackendPool;
use crate::discovery::{ServiceDiscovery, ServiceHandle};
use crate::error::RouteError;
use crate::route::Route;
use crate::store::RouteStore;
use crate::sync::{self, Slot, SyncHandle};
use crate::transport::dial_first;
use crate::watch::{Event, WatchManager};

/// A named upstream for TCP routes: the discovery subscription and the
/// backend pool, without any HTTP machinery.
pub struct TcpService {
    name: String,
    handle: Arc<dyn ServiceHandle>,
    pool: BackendPool,
    closed: AtomicBool,
}

impl TcpService {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refresh the pool from discovery and return a shuffled snapshot.
    fn ordered_backends(&self) -> Vec<String> {
        self.pool.update(self.handle.addrs());
        let mut backends = self.pool.snapshot();
        backends.shuffle(&mut rand::thread_rng());
        backends
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.handle.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A bound TCP route. Dropping the entry closes its accept loop.
pub struct TcpEntry {
    pub route: Route,
    pub service: Arc<TcpService>,
    // Closing this channel stops the accept loop.
    _stop: watch::Sender<bool>,
}

struct TcpServiceRef {
    service: Arc<TcpService>,
    refs: usize,
}

#[derive(Default)]
struct TcpInner {
    routes: HashMap<String, Arc<TcpEntry>>,
    ports: HashMap<u16, Arc<TcpEntry>>,
    services: HashMap<String, TcpServiceRef>,
    closed: bool,
}

/// The in-memory projection of the TCP route store, keyed by port.
pub struct TcpRouteTable {
    inner: RwLock<TcpInner>,
    discovery: Arc<dyn ServiceDiscovery>,
    watch: Arc<WatchManager>,
}

impl TcpRouteTable {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>, watch: Arc<WatchManager>) -> Self {
        Self {
            inner: RwLock::new(TcpInner::default()),
            discovery,
            watch,
        }
    }

    /// Install or replace a TCP route, binding its port and starting the
    /// accept loop. A replaced entry's old loop stops when it is dropped.
    pub fn set(&self, route: Route) -> Result<(), RouteError> {
        let listener = bind_route_port(route.port)
            .map_err(|e| RouteError::Listen(format!("port {}: {}", route.port, e)))?;

        let id = route.id.clone();
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(RouteError::Closed);
            }

            let prev = inner.routes.get(&id).cloned();
            let needs_ref = match &prev {
                Some(entry) if entry.service.name() == route.service => false,
                Some(entry) => {
                    let old = entry.service.name().to_string();
                    release_service(&mut inner, &old);
                    true
                }
                None => true,
            };

            let service = match inner.services.entry(route.service.clone()) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    if needs_ref {
                        occupied.get_mut().refs += 1;
                    }
                    occupied.get().service.clone()
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    let handle = self.discovery.service(&route.service);
                    let service = Arc::new(TcpService {
                        name: route.service.clone(),
                        handle,
                        pool: BackendPool::default(),
                        closed: AtomicBool::new(false),
                    });
                    vacant.insert(TcpServiceRef {
                        service: service.clone(),
                        refs: 1,
                    });
                    service
                }
            };

            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(accept_loop(listener, service.clone(), stop_rx));

            let port = route.port;
            let entry = Arc::new(TcpEntry {
                route,
                service,
                _stop: stop_tx,
            });

            if let Some(prev) = &prev {
                if prev.route.port != port {
                    if let Some(bound) = inner.ports.get(&prev.route.port) {
                        if Arc::ptr_eq(bound, prev) {
                            inner.ports.remove(&prev.route.port);
                        }
                    }
                }
            }
            inner.routes.insert(id.clone(), entry.clone());
            inner.ports.insert(port, entry);
        }

        self.watch.send(Event::set(id));
        Ok(())
    }

    /// Drop a TCP route, stopping its accept loop and releasing its
    /// service reference.
    pub fn remove(&self, id: &str) -> Result<(), RouteError> {
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(RouteError::Closed);
            }

            let entry = inner.routes.remove(id).ok_or(RouteError::NotFound)?;
            let name = entry.service.name().to_string();
            release_service(&mut inner, &name);

            if let Some(bound) = inner.ports.get(&entry.route.port) {
                if Arc::ptr_eq(bound, &entry) {
                    inner.ports.remove(&entry.route.port);
                }
            }
        }

        self.watch.send(Event::remove(id));
        Ok(())
    }

    pub fn route_for_port(&self, port: u16) -> Option<Arc<TcpEntry>> {
        self.inner.read().ports.get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().routes.is_empty()
    }

    pub fn service_refs(&self, name: &str) -> Option<usize> {
        self.inner.read().services.get(name).map(|s| s.refs)
    }

    pub fn service(&self, name: &str) -> Option<Arc<TcpService>> {
        self.inner
            .read()
            .services
            .get(name)
            .map(|s| s.service.clone())
    }

    /// Close every service, drop every entry, and reject further mutations.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for sref in inner.services.values() {
            sref.service.close();
        }
        inner.routes.clear();
        inner.ports.clear();
    }

    pub fn successor(&self) -> Self {
        let services = {
            let inner = self.inner.read();
            inner
                .services
                .iter()
                .map(|(name, sref)| {
                    (
                        name.clone(),
                        TcpServiceRef {
                            service: sref.service.clone(),
                            refs: 0,
                        },
                    )
                })
                .collect()
        };

        Self {
            inner: RwLock::new(TcpInner {
                routes: HashMap::new(),
                ports: HashMap::new(),
                services,
                closed: false,
            }),
            discovery: self.discovery.clone(),
            watch: self.watch.clone(),
        }
    }

    pub fn finish_priming(&self) {
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .services
            .iter()
            .filter(|(_, sref)| sref.refs == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(sref) = inner.services.remove(&name) {
                sref.service.close();
                info!(service = %name, "closed service with no remaining routes");
            }
        }
    }
}

impl crate::sync::SyncTable for TcpRouteTable {
    fn apply_set(&self, route: Route) -> Result<(), RouteError> {
        self.set(route)
    }

    fn apply_remove(&self, id: &str) -> Result<(), RouteError> {
        self.remove(id)
    }

    fn successor(&self) -> Self {
        TcpRouteTable::successor(self)
    }

    fn finish_priming(&self) {
        TcpRouteTable::finish_priming(self)
    }
}

fn release_service(inner: &mut TcpInner, name: &str) {
    let remove = match inner.services.get_mut(name) {
        Some(sref) => {
            sref.refs -= 1;
            sref.refs == 0
        }
        None => false,
    };
    if remove {
        if let Some(sref) = inner.services.remove(name) {
            sref.service.close();
        }
    }
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    service: Arc<TcpService>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    let service = service.clone();
                    tokio::spawn(splice_to_backend(service, stream, remote));
                }
                Err(e) => {
                    error!(error = %e, "failed to accept tcp connection");
                }
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

async fn splice_to_backend(service: Arc<TcpService>, mut client: TcpStream, remote: SocketAddr) {
    let backends = service.ordered_backends();
    match dial_first(&backends).await {
        Ok((mut backend, addr)) => {
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((from_client, from_backend)) => {
                    debug!(
                        remote = %remote,
                        backend = %addr,
                        from_client,
                        from_backend,
                        "tcp splice finished"
                    );
                }
                Err(e) => {
                    debug!(remote = %remote, backend = %addr, error = %e, "tcp splice ended with error");
                }
            }
        }
        Err(e) => {
            error!(remote = %remote, service = %service.name, error = %e, "tcp proxy error");
        }
    }
}

fn bind_route_port(port: u16) -> std::io::Result<tokio::net::TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    tokio::net::TcpListener::from_std(socket.into())
}

/// The TCP front door: per-route accept loops plus the sync loop and
/// mutation API, mirroring the HTTP listener.
pub struct TcpListener {
    slot: Slot<TcpRouteTable>,
    store: Arc<dyn RouteStore>,
    watch: Arc<WatchManager>,
    sync: Mutex<Option<SyncHandle>>,
    closed: AtomicBool,
}

impl TcpListener {
    /// Prime the port table from the store and start accepting on every
    /// route's port.
    pub async fn start(
        store: Arc<dyn RouteStore>,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> anyhow::Result<Arc<Self>> {
        let watch_manager = Arc::new(WatchManager::new());
        let table = TcpRouteTable::new(discovery, watch_manager.clone());
        let slot = Slot::new(table);

        let sync_handle = sync::start(store.clone(), slot.clone()).await?;
        info!(table = store.table_name(), "tcp listener started");

        Ok(Arc::new(Self {
            slot,
            store,
            watch: watch_manager,
            sync: Mutex::new(Some(sync_handle)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn table(&self) -> Arc<TcpRouteTable> {
        self.slot.current()
    }

    pub async fn add_route(&self, route: &mut Route) -> Result<(), RouteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouteError::Closed);
        }
        self.store.add(route).await.map_err(RouteError::from)
    }

    pub async fn update_route(&self, route: &mut Route) -> Result<(), RouteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouteError::Closed);
        }
        self.store.set(route).await.map_err(RouteError::from)
    }

    pub async fn remove_route(&self, id: &str) -> Result<(), RouteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouteError::Closed);
        }
        self.store.remove(id).await.map_err(RouteError::from)
    }

    pub fn watch(&self, capacity: usize) -> (u64, mpsc::Receiver<Event>) {
        self.watch.subscribe(capacity)
    }

    pub fn unwatch(&self, id: u64) {
        self.watch.unsubscribe(id);
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sync_handle = self.sync.lock().take();
        if let Some(handle) = sync_handle {
            handle.stop().await;
        }
        self.slot.current().close();
        info!("tcp listener closed");
    }
}
