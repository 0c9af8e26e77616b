//! Host-to-route table and service bookkeeping.
//!
//! Three mappings live under one writer lock: route id to entry, lowercase
//! domain to entry, and service name to a refcounted shared service. TLS
//! material is parsed before the lock is taken and never retained as PEM.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response};
use parking_lot::RwLock;
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::CertifiedKey;
use tracing::info;

use crate::crypto::CookieBox;
use crate::discovery::{ServiceDiscovery, ServiceHandle};
use crate::error::RouteError;
use crate::route::Route;
use crate::sticky::StickyProxy;
use crate::transport::{is_websocket_request, ProxyBody, ReverseProxy};
use crate::watch::{Event, WatchManager};

/// Wildcard lookups walk suffix domains at most this many labels deep.
const MAX_WILDCARD_DEPTH: usize = 5;

/// Plain or sticky transport behind a common dispatch surface.
pub enum ServiceProxy {
    Plain(ReverseProxy),
    Sticky(StickyProxy),
}

impl ServiceProxy {
    pub fn update_backends(&self, addrs: Vec<String>) {
        match self {
            ServiceProxy::Plain(p) => p.update_backends(addrs),
            ServiceProxy::Sticky(p) => p.update_backends(addrs),
        }
    }

    pub async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if is_websocket_request(&req) {
            match self {
                ServiceProxy::Plain(p) => p.serve_websocket(req).await,
                ServiceProxy::Sticky(p) => p.serve_websocket(req).await,
            }
        } else {
            match self {
                ServiceProxy::Plain(p) => p.serve_http(req).await,
                ServiceProxy::Sticky(p) => p.serve_http(req).await,
            }
        }
    }
}

/// A named upstream shared by every route that references its name. Owns
/// the discovery subscription and the transport.
pub struct Service {
    name: String,
    handle: Arc<dyn ServiceHandle>,
    proxy: ServiceProxy,
    closed: AtomicBool,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refresh the backend list from discovery and dispatch the request.
    pub async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        self.proxy.update_backends(self.handle.addrs());
        self.proxy.serve(req).await
    }

    /// Release the discovery subscription. Idempotent.
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

/// A routed domain: the route row, its parsed certificate, and the shared
/// service it forwards to.
pub struct RouteEntry {
    pub route: Route,
    pub keypair: Option<Arc<CertifiedKey>>,
    pub service: Arc<Service>,
}

struct ServiceRef {
    service: Arc<Service>,
    refs: usize,
}

#[derive(Default)]
struct TableInner {
    routes: HashMap<String, Arc<RouteEntry>>,
    domains: HashMap<String, Arc<RouteEntry>>,
    services: HashMap<String, ServiceRef>,
    closed: bool,
}

/// The in-memory projection of the HTTP route store.
pub struct RouteTable {
    inner: RwLock<TableInner>,
    discovery: Arc<dyn ServiceDiscovery>,
    cookie_box: CookieBox,
    watch: Arc<WatchManager>,
}

impl RouteTable {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        cookie_box: CookieBox,
        watch: Arc<WatchManager>,
    ) -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
            discovery,
            cookie_box,
            watch,
        }
    }

    /// Install or replace a route. Parses TLS material up front so a bad
    /// keypair fails the operation without mutating the table.
    pub fn set(&self, mut route: Route) -> Result<(), RouteError> {
        let keypair = if !route.tls_cert.is_empty() && !route.tls_key.is_empty() {
            Some(parse_keypair(&route.tls_cert, &route.tls_key)?)
        } else {
            None
        };
        route.tls_cert.clear();
        route.tls_key.clear();

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
                Entry::Occupied(mut occupied) => {
                    if needs_ref {
                        occupied.get_mut().refs += 1;
                    }
                    occupied.get().service.clone()
                }
                Entry::Vacant(vacant) => {
                    let handle = self.discovery.service(&route.service);
                    let proxy = if route.sticky {
                        ServiceProxy::Sticky(StickyProxy::new(self.cookie_box.clone()))
                    } else {
                        ServiceProxy::Plain(ReverseProxy::new())
                    };
                    let service = Arc::new(Service {
                        name: route.service.clone(),
                        handle,
                        proxy,
                        closed: AtomicBool::new(false),
                    });
                    vacant.insert(ServiceRef {
                        service: service.clone(),
                        refs: 1,
                    });
                    service
                }
            };

            let domain_key = route.domain.to_lowercase();
            let entry = Arc::new(RouteEntry {
                route,
                keypair,
                service,
            });

            if let Some(prev) = &prev {
                let prev_key = prev.route.domain.to_lowercase();
                if prev_key != domain_key {
                    if let Some(bound) = inner.domains.get(&prev_key) {
                        if Arc::ptr_eq(bound, prev) {
                            inner.domains.remove(&prev_key);
                        }
                    }
                }
            }
            inner.routes.insert(id.clone(), entry.clone());
            inner.domains.insert(domain_key, entry);
        }

        self.watch.send(Event::set(id));
        Ok(())
    }

    /// Drop a route by id, releasing its service reference.
    pub fn remove(&self, id: &str) -> Result<(), RouteError> {
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(RouteError::Closed);
            }

            let entry = inner.routes.remove(id).ok_or(RouteError::NotFound)?;
            let name = entry.service.name().to_string();
            release_service(&mut inner, &name);

            let domain_key = entry.route.domain.to_lowercase();
            if let Some(bound) = inner.domains.get(&domain_key) {
                if Arc::ptr_eq(bound, &entry) {
                    inner.domains.remove(&domain_key);
                }
            }
        }

        self.watch.send(Event::remove(id));
        Ok(())
    }

    /// Match a request host: exact domain first, then wildcard suffixes
    /// from most- to least-specific.
    pub fn lookup(&self, host: &str) -> Option<Arc<RouteEntry>> {
        let host = host.to_lowercase();
        let host = host.split(':').next().unwrap_or(host.as_str());

        let inner = self.inner.read();
        if let Some(entry) = inner.domains.get(host) {
            return Some(entry.clone());
        }

        let labels: Vec<&str> = host.splitn(MAX_WILDCARD_DEPTH, '.').collect();
        for i in (1..labels.len()).rev() {
            let candidate = format!("*.{}", labels[labels.len() - i..].join("."));
            if let Some(entry) = inner.domains.get(&candidate) {
                return Some(entry.clone());
            }
        }
        None
    }

    pub fn get(&self, id: &str) -> Option<Arc<RouteEntry>> {
        self.inner.read().routes.get(id).cloned()
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.inner.read().routes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().routes.is_empty()
    }

    /// Reference count for a service, if it exists.
    pub fn service_refs(&self, name: &str) -> Option<usize> {
        self.inner.read().services.get(name).map(|s| s.refs)
    }

    /// The shared service object registered under `name`.
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.inner
            .read()
            .services
            .get(name)
            .map(|s| s.service.clone())
    }

    /// Close every service subscription and reject further mutations.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for sref in inner.services.values() {
            sref.service.close();
        }
    }

    /// A fresh table for rebuilding after a sync failure. The existing
    /// service objects are carried across with their reference counts reset,
    /// so routes primed into the new table keep their live transports.
    pub fn successor(&self) -> Self {
        let services = {
            let inner = self.inner.read();
            inner
                .services
                .iter()
                .map(|(name, sref)| {
                    (
                        name.clone(),
                        ServiceRef {
                            service: sref.service.clone(),
                            refs: 0,
                        },
                    )
                })
                .collect()
        };

        Self {
            inner: RwLock::new(TableInner {
                routes: HashMap::new(),
                domains: HashMap::new(),
                services,
                closed: false,
            }),
            discovery: self.discovery.clone(),
            cookie_box: self.cookie_box.clone(),
            watch: self.watch.clone(),
        }
    }

    /// After priming a rebuilt table, close carried services that no route
    /// references any more.
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

impl crate::sync::SyncTable for RouteTable {
    fn apply_set(&self, route: Route) -> Result<(), RouteError> {
        self.set(route)
    }

    fn apply_remove(&self, id: &str) -> Result<(), RouteError> {
        self.remove(id)
    }

    fn successor(&self) -> Self {
        RouteTable::successor(self)
    }

    fn finish_priming(&self) {
        RouteTable::finish_priming(self)
    }
}

fn release_service(inner: &mut TableInner, name: &str) {
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

/// Parse a PEM certificate chain and private key into a rustls keypair.
pub fn parse_keypair(cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>, RouteError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RouteError::Tls(format!("failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(RouteError::Tls("no certificates found".to_string()));
    }

    let key = read_private_key(key_pem)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| RouteError::Tls(format!("unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn read_private_key(key_pem: &str) -> Result<PrivateKeyDer<'static>, RouteError> {
    let mut reader = BufReader::new(key_pem.as_bytes());
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(key.into()),
            Ok(Some(_)) => continue,
            Ok(None) => return Err(RouteError::Tls("no private key found".to_string())),
            Err(e) => return Err(RouteError::Tls(format!("failed to parse key: {}", e))),
        }
    }
}
