//! Error types and JSON error responses for the data plane.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes surfaced to clients on the data plane.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route matches the request host
    RouteNotFound,
    /// Every backend failed to accept a connection
    NoBackends,
    /// A backend was reached but the exchange failed
    UpstreamError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoBackends => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::NoBackends => "NO_BACKENDS",
            ProxyErrorCode::UpstreamError => "UPSTREAM_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Errors from route-table and listener mutations.
#[derive(Debug)]
pub enum RouteError {
    /// No route with the given id
    NotFound,
    /// The listener has been closed and rejects mutations
    Closed,
    /// The route carries TLS material that failed to parse
    Tls(String),
    /// The route's listen port could not be bound
    Listen(String),
    /// The backing store rejected the operation
    Store(StoreError),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::NotFound => write!(f, "route not found"),
            RouteError::Closed => write!(f, "listener has been closed"),
            RouteError::Tls(msg) => write!(f, "invalid TLS material: {}", msg),
            RouteError::Listen(msg) => write!(f, "failed to bind route port: {}", msg),
            RouteError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for RouteError {}

impl From<StoreError> for RouteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => RouteError::NotFound,
            other => RouteError::Store(other),
        }
    }
}

/// Errors from the route store.
#[derive(Debug)]
pub enum StoreError {
    /// No row with the given id (or the row is soft-deleted)
    NotFound,
    /// The caller supplied an id on insert; ids are store-generated
    PresetId,
    /// The store or its notification channel is unreachable
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "route not found"),
            StoreError::PresetId => write!(f, "route ids are assigned by the store"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from a proxied exchange with a backend.
#[derive(Debug)]
pub enum ProxyError {
    /// Every backend in the snapshot failed to accept a connection
    NoBackends,
    /// The exchange failed after a connection was established
    Upstream(Box<dyn std::error::Error + Send + Sync>),
}

impl ProxyError {
    pub fn upstream(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ProxyError::Upstream(Box::new(err))
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::NoBackends => write!(f, "no backends available"),
            ProxyError::Upstream(e) => write!(f, "upstream error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::RouteNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::NoBackends.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::UpstreamError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::NoBackends, "no backends available");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "NO_BACKENDS"
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::RouteNotFound, "no route for example.com");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"ROUTE_NOT_FOUND\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_store_error_conversion() {
        assert!(matches!(
            RouteError::from(StoreError::NotFound),
            RouteError::NotFound
        ));
        assert!(matches!(
            RouteError::from(StoreError::PresetId),
            RouteError::Store(StoreError::PresetId)
        ));
    }
}
