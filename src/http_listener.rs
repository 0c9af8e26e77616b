//! HTTP and HTTPS listeners.
//!
//! Both ports share one route table. Each request gets forwarding headers
//! appended, is matched by `Host`, stamped with a request id and start
//! time, and handed to the route's service. The TLS side selects
//! certificates by SNI against the same table.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::crypto::CookieBox;
use crate::discovery::ServiceDiscovery;
use crate::error::{json_error_response, ProxyErrorCode, RouteError};
use crate::route::Route;
use crate::store::RouteStore;
use crate::sync::{self, Slot, SyncHandle};
use crate::table::RouteTable;
use crate::transport::{is_websocket_request, ProxyBody};
use crate::watch::{Event, WatchManager};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PORT: &str = "x-forwarded-port";
const X_REQUEST_START: &str = "x-request-start";
const X_REQUEST_ID: &str = "x-request-id";

/// Configuration for an HTTP/HTTPS listener pair.
pub struct HttpListenerConfig {
    /// Plain HTTP bind address.
    pub http_addr: SocketAddr,
    /// TLS bind address, or `None` to serve plain HTTP only.
    pub https_addr: Option<SocketAddr>,
    /// Keypair served to TLS clients that send no SNI.
    pub default_keypair: Option<Arc<CertifiedKey>>,
    /// Key for sticky-session cookies.
    pub cookie_box: CookieBox,
}

/// The HTTP/HTTPS front door: accept loops, route dispatch, the sync loop
/// keeping the table current, and the route mutation API.
pub struct HttpListener {
    slot: Slot<RouteTable>,
    store: Arc<dyn RouteStore>,
    watch: Arc<WatchManager>,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    sync: Mutex<Option<SyncHandle>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl HttpListener {
    /// Bind the listen sockets, prime the route table from the store, and
    /// start accepting. Errors binding or priming are returned before any
    /// connection is served.
    pub async fn start(
        config: HttpListenerConfig,
        store: Arc<dyn RouteStore>,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> anyhow::Result<Arc<Self>> {
        let watch_manager = Arc::new(WatchManager::new());
        let table = RouteTable::new(discovery, config.cookie_box, watch_manager.clone());
        let slot = Slot::new(table);

        let listener = bind_reuseport(config.http_addr)?;
        let http_addr = listener.local_addr()?;

        let tls = match config.https_addr {
            Some(addr) => {
                let tls_listener = bind_reuseport(addr)?;
                let bound = tls_listener.local_addr()?;
                let resolver = Arc::new(SniResolver {
                    slot: slot.clone(),
                    default: config.default_keypair,
                });
                let tls_config = rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_cert_resolver(resolver);
                let acceptor = TlsAcceptor::from(Arc::new(tls_config));
                Some((tls_listener, acceptor, bound))
            }
            None => None,
        };

        let sync_handle = sync::start(store.clone(), slot.clone()).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_plain(
            listener,
            slot.clone(),
            http_addr.port(),
            shutdown_rx.clone(),
        ));

        let https_addr = tls.map(|(tls_listener, acceptor, bound)| {
            tokio::spawn(accept_tls(
                tls_listener,
                acceptor,
                slot.clone(),
                bound.port(),
                shutdown_rx,
            ));
            bound
        });

        info!(
            http = %http_addr,
            https = ?https_addr,
            table = store.table_name(),
            "http listener started"
        );

        Ok(Arc::new(Self {
            slot,
            store,
            watch: watch_manager,
            http_addr,
            https_addr,
            sync: Mutex::new(Some(sync_handle)),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
        }))
    }

    /// Actual plain-HTTP bind address.
    pub fn addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Actual TLS bind address, if TLS is enabled.
    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// The live route table.
    pub fn table(&self) -> Arc<RouteTable> {
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

    pub async fn get_route(&self, id: &str) -> Result<Route, RouteError> {
        self.store.get(id).await.map_err(RouteError::from)
    }

    pub async fn list_routes(&self) -> Result<Vec<Route>, RouteError> {
        self.store.list().await.map_err(RouteError::from)
    }

    /// Subscribe to route-table change events.
    pub fn watch(&self, capacity: usize) -> (u64, mpsc::Receiver<Event>) {
        self.watch.subscribe(capacity)
    }

    pub fn unwatch(&self, id: u64) {
        self.watch.unsubscribe(id);
    }

    /// Stop the sync loop, close every service, and stop accepting.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sync_handle = self.sync.lock().take();
        if let Some(handle) = sync_handle {
            handle.stop().await;
        }
        self.slot.current().close();
        let _ = self.shutdown.send(true);
        info!(http = %self.http_addr, "http listener closed");
    }
}

async fn accept_plain(
    listener: tokio::net::TcpListener,
    slot: Slot<RouteTable>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    let slot = slot.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, remote, slot, "http", port).await {
                            debug!(remote = %remote, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn accept_tls(
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    slot: Slot<RouteTable>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    let slot = slot.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                if let Err(e) =
                                    serve_connection(tls_stream, remote, slot, "https", port).await
                                {
                                    debug!(remote = %remote, error = %e, "tls connection error");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %remote, error = %e, "tls handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept tls connection");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    remote: SocketAddr,
    slot: Slot<RouteTable>,
    proto: &'static str,
    port: u16,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let slot = slot.clone();
        async move { handle_request(req, slot, remote, proto, port).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    slot: Slot<RouteTable>,
    remote: SocketAddr,
    proto: &'static str,
    port: u16,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let start = SystemTime::now();

    set_forwarded_headers(req.headers_mut(), remote.ip(), proto, port);

    let entry = request_host(&req).and_then(|host| slot.current().lookup(&host));
    let Some(entry) = entry else {
        let mut res = json_error_response(ProxyErrorCode::RouteNotFound, "no route for host");
        if is_websocket_request(&req) {
            res.headers_mut()
                .insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
        }
        return Ok(res);
    };

    let start_ms = start
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    if let Ok(value) = HeaderValue::from_str(&start_ms.to_string()) {
        req.headers_mut().insert(X_REQUEST_START, value);
    }
    if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    Ok(entry.service.serve(req).await)
}

/// Host to route by: the `Host` header, or the URI authority for HTTP/2
/// requests that carry none.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        return Some(host.to_string());
    }
    req.uri().host().map(|h| h.to_string())
}

/// Append the client to `X-Forwarded-For` and the listener's proto/port to
/// their headers. Prior proxy values are folded into one comma-separated
/// header.
fn set_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, proto: &str, port: u16) {
    append_folded(headers, X_FORWARDED_FOR, &client_ip.to_string());
    append_folded(headers, X_FORWARDED_PROTO, proto);
    append_folded(headers, X_FORWARDED_PORT, &port.to_string());
}

fn append_folded(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let folded = {
        let prior: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if prior.is_empty() {
            value.to_string()
        } else {
            format!("{}, {}", prior.join(", "), value)
        }
    };
    if let Ok(value) = HeaderValue::from_str(&folded) {
        headers.insert(name, value);
    }
}

/// Bind a nonblocking listener with reuse-addr and reuse-port so workers
/// can overlap across rolling restarts.
fn bind_reuseport(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

/// Certificate selection against the live route table. No SNI falls back
/// to the process default; an SNI name with no TLS-bearing route fails the
/// handshake.
struct SniResolver {
    slot: Slot<RouteTable>,
    default: Option<Arc<CertifiedKey>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SniResolver")
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        select_certificate(
            &self.slot.current(),
            client_hello.server_name(),
            &self.default,
        )
    }
}

fn select_certificate(
    table: &RouteTable,
    server_name: Option<&str>,
    default: &Option<Arc<CertifiedKey>>,
) -> Option<Arc<CertifiedKey>> {
    match server_name {
        Some(name) => {
            let keypair = table.lookup(name).and_then(|entry| entry.keypair.clone());
            if keypair.is_none() {
                debug!(host = name, "route not found or TLS not configured");
            }
            keypair
        }
        None => default.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;

    #[test]
    fn forwarded_headers_append_to_prior_values() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        headers.append(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        set_forwarded_headers(&mut headers, "192.168.1.9".parse().unwrap(), "http", 80);

        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "10.0.0.1, 192.168.1.9"
        );
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https, http");
        assert_eq!(headers.get(X_FORWARDED_PORT).unwrap(), "80");
        // folded into a single header value
        assert_eq!(headers.get_all(X_FORWARDED_FOR).iter().count(), 1);
    }

    #[test]
    fn request_host_prefers_the_host_header() {
        let req = Request::builder()
            .uri("http://authority.example.com/path")
            .header("host", "header.example.com")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("header.example.com"));

        let req = Request::builder()
            .uri("http://authority.example.com/path")
            .body(())
            .unwrap();
        assert_eq!(
            request_host(&req).as_deref(),
            Some("authority.example.com")
        );

        let req = Request::builder().uri("/path").body(()).unwrap();
        assert!(request_host(&req).is_none());
    }

    #[test]
    fn certificate_selection_against_the_table() {
        let table = RouteTable::new(
            Arc::new(MemoryDiscovery::new()),
            CookieBox::new(&CookieBox::generate_key()),
            Arc::new(WatchManager::new()),
        );

        let cert = rcgen::generate_simple_self_signed(vec!["secure.example.com".to_string()])
            .unwrap();
        let mut route = Route::http("web", "secure.example.com")
            .with_tls(&cert.cert.pem(), &cert.key_pair.serialize_pem());
        route.id = "r1".to_string();
        table.set(route).unwrap();

        let mut plain = Route::http("web", "plain.example.com");
        plain.id = "r2".to_string();
        table.set(plain).unwrap();

        let selected = select_certificate(&table, Some("secure.example.com"), &None);
        assert!(selected.is_some());

        // route exists but has no TLS material
        assert!(select_certificate(&table, Some("plain.example.com"), &None).is_none());
        // no route at all
        assert!(select_certificate(&table, Some("unknown.example.com"), &None).is_none());

        // no SNI falls back to the default keypair
        let default = select_certificate(&table, Some("secure.example.com"), &None);
        assert!(select_certificate(&table, None, &default).is_some());
        assert!(select_certificate(&table, None, &None).is_none());
    }
}
