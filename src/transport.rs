//! Per-service reverse-proxy transport.
//!
//! Each request orders a snapshot of the backend pool (uniform shuffle,
//! sticky hint first) and walks it through a long-lived pooled HTTP
//! client: failure to connect is retriable, any other error aborts the
//! request. WebSocket requests are handshaked on a raw connection and the
//! two byte streams spliced.

use std::borrow::Cow;
use std::io;
use std::time::Duration;

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::backend::BackendPool;
use crate::error::{json_error_response, ProxyError, ProxyErrorCode};

/// Response body type produced by the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// TCP dial timeout per backend attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
/// TCP keepalive on backend connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
/// Maximum idle pooled connections per backend.
const POOL_MAX_IDLE_PER_HOST: usize = 10;
/// Idle pooled connection timeout.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Upper bound on a backend's response header block during a WebSocket
/// handshake.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;
/// Upper bound on a relayed handshake-refusal body.
const MAX_REFUSAL_BODY: usize = 1024 * 1024;

/// Hop-by-hop headers, removed when forwarding in either direction.
/// RFC 2616 section 13.5.1.
pub(crate) const HTTP_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Hop-by-hop headers for the WebSocket handshake, which must retain
/// `Connection` and `Upgrade`.
pub(crate) const WS_HOP_HEADERS: &[&str] = &[
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

/// Backend hint decrypted from a sticky cookie, attached to the request
/// before dispatch and read here when ordering the snapshot.
#[derive(Debug, Clone)]
pub struct StickyBackend(pub String);

/// HTTP and WebSocket transport over a mutable backend set. HTTP requests
/// go through one long-lived pooled client, so connections to a backend
/// are reused across requests.
pub struct ReverseProxy {
    pool: BackendPool,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl ReverseProxy {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        connector.set_keepalive(Some(TCP_KEEPALIVE));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self {
            pool: BackendPool::default(),
            client,
        }
    }

    pub fn update_backends(&self, addrs: Vec<String>) {
        self.pool.update(addrs);
    }

    /// Snapshot the pool, shuffle it, and move the sticky hint (if any and
    /// still present) to the front.
    fn ordered_backends(&self, sticky: Option<&str>) -> Vec<String> {
        let mut backends = self.pool.snapshot();
        backends.shuffle(&mut rand::thread_rng());
        if let Some(addr) = sticky {
            swap_to_front(&mut backends, addr);
        }
        backends
    }

    /// Forward `req` to the first reachable backend. Returns the response
    /// and the address that served it. A connect-classified failure moves
    /// on to the next address; any other error aborts at once.
    pub(crate) async fn round_trip(
        &self,
        req: Request<Incoming>,
    ) -> Result<(Response<Incoming>, String), ProxyError> {
        let sticky = req
            .extensions()
            .get::<StickyBackend>()
            .map(|b| b.0.clone());
        let backends = self.ordered_backends(sticky.as_deref());

        let (parts, body) = req.into_parts();
        let mut headers = scrub_hop_headers(&parts.headers, HTTP_HOP_HEADERS).into_owned();
        if !headers.contains_key(hyper::header::HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    headers.insert(hyper::header::HOST, value);
                }
            }
        }

        // Collected once so an attempt that fails to connect can be
        // retried without re-reading the client's stream.
        let body = body
            .collect()
            .await
            .map_err(ProxyError::upstream)?
            .to_bytes();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        for addr in backends {
            let uri = format!("http://{}{}", addr, path);
            let mut outbound = Request::builder()
                .method(parts.method.clone())
                .uri(uri)
                .version(hyper::Version::HTTP_11)
                .body(Full::new(body.clone()))
                .map_err(ProxyError::upstream)?;
            *outbound.headers_mut() = headers.clone();

            match self.client.request(outbound).await {
                Ok(res) => return Ok((res, addr)),
                Err(e) if e.is_connect() => {
                    debug!(backend = %addr, error = %e, "backend dial failed, trying next");
                }
                Err(e) => return Err(ProxyError::upstream(e)),
            }
        }
        Err(ProxyError::NoBackends)
    }

    /// Forward an ordinary HTTP request, rendering transport failures as
    /// JSON error responses.
    pub async fn serve_http(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.round_trip(req).await {
            Ok((res, _)) => scrub_response(res, HTTP_HOP_HEADERS),
            Err(err) => proxy_error_response(&err),
        }
    }

    /// Handshake a WebSocket request against a backend and, on success,
    /// splice the connections. Returns the client-facing response and the
    /// backend address when the handshake succeeded.
    pub(crate) async fn websocket_exchange(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<(Response<ProxyBody>, Option<String>), ProxyError> {
        let sticky = req
            .extensions()
            .get::<StickyBackend>()
            .map(|b| b.0.clone());
        let backends = self.ordered_backends(sticky.as_deref());

        let (mut stream, addr) = dial_first(&backends).await?;

        let head = build_ws_request(&req);
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(ProxyError::upstream)?;
        stream.flush().await.map_err(ProxyError::upstream)?;

        let (res_head, leftover) = read_response_head(&mut stream)
            .await
            .map_err(ProxyError::upstream)?;

        if !websocket_handshake_success(&res_head) {
            // Not switching protocols: drain the refusal body, relay it,
            // and drop the backend connection.
            let mut body = leftover;
            if let Some(len) = res_head
                .header("content-length")
                .and_then(|v| v.parse::<usize>().ok())
            {
                let len = len.min(MAX_REFUSAL_BODY);
                let mut chunk = [0u8; 4096];
                while body.len() < len {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => body.extend_from_slice(&chunk[..n]),
                    }
                }
                body.truncate(len);
            }

            let mut builder = Response::builder().status(res_head.status);
            for (name, value) in res_head.headers_without(WS_HOP_HEADERS) {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder
                .header("Connection", "close")
                .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
                .map_err(ProxyError::upstream)?;
            return Ok((response, None));
        }

        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in res_head.headers_without(WS_HOP_HEADERS) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .map_err(ProxyError::upstream)?;

        let upgrade = hyper::upgrade::on(&mut req);
        let backend = addr.clone();
        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    error!(backend = %backend, error = %e, "client upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);
            if !leftover.is_empty() {
                if let Err(e) = client.write_all(&leftover).await {
                    debug!(backend = %backend, error = %e, "splice ended writing buffered bytes");
                    return;
                }
            }
            match tokio::io::copy_bidirectional(&mut client, &mut stream).await {
                Ok((from_client, from_backend)) => {
                    debug!(backend = %backend, from_client, from_backend, "splice finished");
                }
                Err(e) => {
                    debug!(backend = %backend, error = %e, "splice ended with error");
                }
            }
        });

        Ok((response, Some(addr)))
    }

    /// Forward a WebSocket upgrade, rendering transport failures as JSON
    /// error responses.
    pub async fn serve_websocket(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.websocket_exchange(req).await {
            Ok((res, _)) => res,
            Err(err) => proxy_error_response(&err),
        }
    }
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a transport failure. Dial exhaustion and upstream errors are both
/// server-side failures; the distinction only matters for retry, which has
/// already happened by now.
pub(crate) fn proxy_error_response(err: &ProxyError) -> Response<ProxyBody> {
    error!(error = %err, "proxy error");
    match err {
        ProxyError::NoBackends => {
            json_error_response(ProxyErrorCode::NoBackends, "no backends available")
        }
        ProxyError::Upstream(_) => {
            json_error_response(ProxyErrorCode::UpstreamError, "upstream exchange failed")
        }
    }
}

/// Walk the ordered list and return the first backend that accepts a
/// connection. Only dial failures are retriable.
pub(crate) async fn dial_first(backends: &[String]) -> Result<(TcpStream, String), ProxyError> {
    for addr in backends {
        match dial_backend(addr).await {
            Ok(stream) => return Ok((stream, addr.clone())),
            Err(e) => {
                debug!(backend = %addr, error = %e, "backend dial failed, trying next");
            }
        }
    }
    Err(ProxyError::NoBackends)
}

async fn dial_backend(addr: &str) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(&stream);
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;
    Ok(stream)
}

/// Strip hop-by-hop headers from a backend response and hand the body
/// through for streaming.
pub(crate) fn scrub_response(res: Response<Incoming>, hop: &[&str]) -> Response<ProxyBody> {
    let (mut parts, body) = res.into_parts();
    for name in hop {
        parts.headers.remove(*name);
    }
    Response::from_parts(parts, body.boxed())
}

/// Remove hop-by-hop headers. The original map is left untouched: when no
/// hop header is present it is borrowed as-is, otherwise a scrubbed copy is
/// returned.
pub(crate) fn scrub_hop_headers<'a>(headers: &'a HeaderMap, hop: &[&str]) -> Cow<'a, HeaderMap> {
    if hop.iter().any(|name| headers.contains_key(*name)) {
        let mut copy = headers.clone();
        for name in hop {
            copy.remove(*name);
        }
        Cow::Owned(copy)
    } else {
        Cow::Borrowed(headers)
    }
}

/// Whether the inbound request asks for a WebSocket upgrade.
pub fn is_websocket_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    let upgrade_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && upgrade_websocket
}

fn swap_to_front(backends: &mut [String], addr: &str) {
    if let Some(pos) = backends.iter().position(|b| b == addr) {
        backends.swap(0, pos);
    }
}

/// Serialize the WebSocket handshake request for the backend, with the
/// WebSocket hop set scrubbed.
fn build_ws_request(req: &Request<Incoming>) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    let headers = scrub_hop_headers(req.headers(), WS_HOP_HEADERS);
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    head.push_str("\r\n");
    head
}

/// Parsed status line and headers of a backend response.
#[derive(Debug)]
pub(crate) struct BackendResponseHead {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
}

impl BackendResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn headers_without<'a>(
        &'a self,
        hop: &'a [&str],
    ) -> impl Iterator<Item = &'a (String, String)> {
        self.headers
            .iter()
            .filter(move |(name, _)| !hop.iter().any(|h| name.eq_ignore_ascii_case(h)))
    }
}

/// Read one HTTP/1-framed response head from the backend. Returns the
/// parsed head and any bytes read past the header block, which belong to
/// the upgraded stream.
async fn read_response_head(
    stream: &mut TcpStream,
) -> io::Result<(BackendResponseHead, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf) {
            let head = parse_response_head(&buf[..end]).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "malformed backend response")
            })?;
            return Ok((head, buf.split_off(end)));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "backend response header block too large",
            ));
        }
    }
}

/// Position just past the `\r\n\r\n` header terminator, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_response_head(data: &[u8]) -> Option<BackendResponseHead> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    // status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some(BackendResponseHead { status, headers })
}

fn websocket_handshake_success(head: &BackendResponseHead) -> bool {
    head.status == StatusCode::SWITCHING_PROTOCOLS
        && head
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        && head
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("upgrade"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn scrub_borrows_when_no_hop_headers_present() {
        let headers = header_map(&[("host", "example.com"), ("accept", "*/*")]);
        let scrubbed = scrub_hop_headers(&headers, HTTP_HOP_HEADERS);
        assert!(matches!(scrubbed, Cow::Borrowed(_)));
    }

    #[test]
    fn scrub_removes_hop_headers_without_touching_the_original() {
        let headers = header_map(&[
            ("host", "example.com"),
            ("connection", "close"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "h2c"),
        ]);

        let scrubbed = scrub_hop_headers(&headers, HTTP_HOP_HEADERS);
        assert!(matches!(scrubbed, Cow::Owned(_)));
        assert!(scrubbed.contains_key("host"));
        assert!(!scrubbed.contains_key("connection"));
        assert!(!scrubbed.contains_key("transfer-encoding"));
        assert!(!scrubbed.contains_key("upgrade"));

        // the caller's map is unmodified
        assert!(headers.contains_key("connection"));
        assert!(headers.contains_key("transfer-encoding"));
        assert!(headers.contains_key("upgrade"));
    }

    #[test]
    fn ws_hop_set_retains_connection_and_upgrade() {
        let headers = header_map(&[
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
            ("keep-alive", "timeout=5"),
        ]);

        let scrubbed = scrub_hop_headers(&headers, WS_HOP_HEADERS);
        assert!(scrubbed.contains_key("connection"));
        assert!(scrubbed.contains_key("upgrade"));
        assert!(!scrubbed.contains_key("keep-alive"));
    }

    #[test]
    fn websocket_detection() {
        let make = |pairs: &[(&str, &str)]| {
            let mut req = Request::builder().uri("/");
            for (name, value) in pairs {
                req = req.header(*name, *value);
            }
            req.body(()).unwrap()
        };

        assert!(is_websocket_request(&make(&[
            ("connection", "Upgrade"),
            ("upgrade", "WebSocket"),
        ])));
        assert!(is_websocket_request(&make(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(!is_websocket_request(&make(&[("upgrade", "websocket")])));
        assert!(!is_websocket_request(&make(&[
            ("connection", "Upgrade"),
            ("upgrade", "h2c"),
        ])));
        assert!(!is_websocket_request(&make(&[])));
    }

    #[test]
    fn swap_to_front_moves_present_addresses_only() {
        let mut backends = vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()];
        swap_to_front(&mut backends, "c:3");
        assert_eq!(backends[0], "c:3");

        let before = backends.clone();
        swap_to_front(&mut backends, "missing:0");
        assert_eq!(backends, before);
    }

    #[test]
    fn parses_response_head_and_leftover_boundary() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nframe";
        let end = find_header_end(raw).unwrap();
        assert_eq!(&raw[end..], b"frame");

        let head = parse_response_head(&raw[..end]).unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.header("upgrade"), Some("websocket"));
        assert!(websocket_handshake_success(&head));
    }

    #[test]
    fn handshake_requires_the_upgrade_echo() {
        let head = BackendResponseHead {
            status: StatusCode::SWITCHING_PROTOCOLS,
            headers: vec![("Upgrade".into(), "websocket".into())],
        };
        assert!(!websocket_handshake_success(&head));

        let head = BackendResponseHead {
            status: StatusCode::OK,
            headers: vec![
                ("Upgrade".into(), "websocket".into()),
                ("Connection".into(), "upgrade".into()),
            ],
        };
        assert!(!websocket_handshake_success(&head));
    }

    #[test]
    fn malformed_heads_are_rejected() {
        assert!(parse_response_head(b"junk").is_none());
        assert!(parse_response_head(b"HTTP/1.1 xyz\r\n").is_none());
        assert!(find_header_end(b"HTTP/1.1 200 OK\r\n").is_none());
    }
}
