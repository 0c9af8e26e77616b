//! Route definitions shared by the listeners and the route store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminator for the two route families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// Routed by the `Host` header on the HTTP/HTTPS listeners.
    Http,
    /// Routed by listen port on the TCP listener.
    Tcp,
}

impl RouteKind {
    /// Name of the store table (and notification channel) for this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            RouteKind::Http => "http_routes",
            RouteKind::Tcp => "tcp_routes",
        }
    }
}

/// A rule binding a host or port to a named upstream service.
///
/// Mirrors the persisted row: HTTP routes use `domain`, the TLS pair and
/// `sticky`; TCP routes use `port`. The id and timestamps are assigned by
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "type")]
    pub kind: RouteKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_ref: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Host to match. May begin with `*.` for a wildcard domain.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// Optional PEM certificate chain. Cleared once parsed into the table.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_cert: String,
    /// Optional PEM private key. Cleared once parsed into the table.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_key: String,
    #[serde(default)]
    pub sticky: bool,

    /// Listen port for TCP routes.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl Route {
    /// New HTTP route for `domain` backed by `service`.
    pub fn http(service: &str, domain: &str) -> Self {
        Self {
            kind: RouteKind::Http,
            id: String::new(),
            parent_ref: String::new(),
            service: service.to_string(),
            created_at: None,
            updated_at: None,
            domain: domain.to_string(),
            tls_cert: String::new(),
            tls_key: String::new(),
            sticky: false,
            port: 0,
        }
    }

    /// New TCP route for `port` backed by `service`.
    pub fn tcp(service: &str, port: u16) -> Self {
        Self {
            kind: RouteKind::Tcp,
            id: String::new(),
            parent_ref: String::new(),
            service: service.to_string(),
            created_at: None,
            updated_at: None,
            domain: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            sticky: false,
            port,
        }
    }

    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn with_tls(mut self, cert_pem: &str, key_pem: &str) -> Self {
        self.tls_cert = cert_pem.to_string();
        self.tls_key = key_pem.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names() {
        assert_eq!(RouteKind::Http.table_name(), "http_routes");
        assert_eq!(RouteKind::Tcp.table_name(), "tcp_routes");
    }

    #[test]
    fn serializes_with_type_tag() {
        let route = Route::http("web", "example.com").with_sticky(true);
        let json = serde_json::to_string(&route).unwrap();
        assert!(json.contains("\"type\":\"http\""));
        assert!(json.contains("\"sticky\":true"));
        assert!(!json.contains("\"port\""));

        let back: Route = serde_json::from_str(&json).unwrap();
        assert_eq!(back, route);
    }
}
