//! Sticky-session layer over the plain transport.
//!
//! The pinned backend travels in an encrypted `_backend` cookie. A cookie
//! that fails to decode or decrypt is ignored and the request proceeds
//! unpinned.

use base64::Engine;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use hyper::{Request, Response};

use crate::crypto::CookieBox;
use crate::transport::{
    proxy_error_response, scrub_response, ProxyBody, ReverseProxy, StickyBackend,
    HTTP_HOP_HEADERS,
};

/// Cookie carrying the encrypted backend address.
pub const STICKY_COOKIE: &str = "_backend";

/// Transport variant that pins clients to the backend recorded in their
/// cookie and re-pins them when a different backend serves the request.
pub struct StickyProxy {
    inner: ReverseProxy,
    cookie_box: CookieBox,
}

impl StickyProxy {
    pub fn new(cookie_box: CookieBox) -> Self {
        Self {
            inner: ReverseProxy::new(),
            cookie_box,
        }
    }

    pub fn update_backends(&self, addrs: Vec<String>) {
        self.inner.update_backends(addrs);
    }

    pub async fn serve_http(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let hint = self.cookie_backend(req.headers());
        if let Some(addr) = &hint {
            req.extensions_mut().insert(StickyBackend(addr.clone()));
        }

        match self.inner.round_trip(req).await {
            Ok((res, addr)) => {
                let mut res = scrub_response(res, HTTP_HOP_HEADERS);
                if hint.as_deref() != Some(addr.as_str()) {
                    self.append_cookie(res.headers_mut(), &addr);
                }
                res
            }
            Err(err) => proxy_error_response(&err),
        }
    }

    pub async fn serve_websocket(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let hint = self.cookie_backend(req.headers());
        if let Some(addr) = &hint {
            req.extensions_mut().insert(StickyBackend(addr.clone()));
        }

        match self.inner.websocket_exchange(req).await {
            Ok((mut res, Some(addr))) => {
                if hint.as_deref() != Some(addr.as_str()) {
                    self.append_cookie(res.headers_mut(), &addr);
                }
                res
            }
            Ok((res, None)) => res,
            Err(err) => proxy_error_response(&err),
        }
    }

    /// Decrypt the backend address from the request's `_backend` cookie.
    /// Anything invalid yields `None`.
    fn cookie_backend(&self, headers: &HeaderMap) -> Option<String> {
        for value in headers.get_all(COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for pair in raw.split(';') {
                let Some((name, encoded)) = pair.trim().split_once('=') else {
                    continue;
                };
                if name != STICKY_COOKIE {
                    continue;
                }
                let Ok(data) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                    continue;
                };
                let Some(plain) = self.cookie_box.open(&data) else {
                    continue;
                };
                if let Ok(addr) = String::from_utf8(plain) {
                    return Some(addr);
                }
            }
        }
        None
    }

    fn append_cookie(&self, headers: &mut HeaderMap, backend: &str) {
        let Ok(sealed) = self.cookie_box.seal(backend.as_bytes()) else {
            return;
        };
        let value = format!(
            "{}={}; Path=/",
            STICKY_COOKIE,
            base64::engine::general_purpose::STANDARD.encode(sealed)
        );
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(SET_COOKIE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sticky() -> StickyProxy {
        StickyProxy::new(CookieBox::new(&CookieBox::generate_key()))
    }

    fn cookie_header(proxy: &StickyProxy, backend: &str) -> String {
        let mut headers = HeaderMap::new();
        proxy.append_cookie(&mut headers, backend);
        let set_cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        set_cookie.strip_suffix("; Path=/").unwrap().to_string()
    }

    #[test]
    fn cookie_round_trip() {
        let proxy = sticky();
        let cookie = cookie_header(&proxy, "10.0.0.5:8080");

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
        assert_eq!(
            proxy.cookie_backend(&headers).as_deref(),
            Some("10.0.0.5:8080")
        );
    }

    #[test]
    fn cookie_is_found_among_other_cookies() {
        let proxy = sticky();
        let cookie = cookie_header(&proxy, "10.0.0.5:8080");

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("session=abc; {}; theme=dark", cookie)).unwrap(),
        );
        assert_eq!(
            proxy.cookie_backend(&headers).as_deref(),
            Some("10.0.0.5:8080")
        );
    }

    #[test]
    fn garbled_cookies_are_ignored() {
        let proxy = sticky();

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("_backend=not-base64!!; other=1"),
        );
        assert!(proxy.cookie_backend(&headers).is_none());

        // valid base64 but sealed under another key
        let other = sticky();
        let foreign = cookie_header(&other, "10.0.0.5:8080");
        headers.insert(COOKIE, HeaderValue::from_str(&foreign).unwrap());
        assert!(proxy.cookie_backend(&headers).is_none());
    }

    #[test]
    fn no_cookie_means_no_hint() {
        let proxy = sticky();
        assert!(proxy.cookie_backend(&HeaderMap::new()).is_none());
    }
}
