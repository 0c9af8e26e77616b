//! TOML configuration for the routegate binary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::route::{Route, RouteKind};

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Static service address lists seeding the in-process discovery
    #[serde(default)]
    pub services: HashMap<String, Vec<String>>,

    /// Routes installed into the store at startup
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Plain HTTP bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// TLS bind address; unset disables HTTPS
    pub https_addr: Option<String>,

    /// Path to the default TLS certificate served without SNI (PEM)
    pub default_tls_cert: Option<String>,

    /// Path to the default TLS private key (PEM)
    pub default_tls_key: Option<String>,

    /// Base64 32-byte key for sticky cookies. The ROUTEGATE_COOKIE_KEY
    /// environment variable overrides this; if neither is set a random
    /// key is generated at startup.
    pub cookie_key: Option<String>,
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: None,
            default_tls_cert: None,
            default_tls_key: None,
            cookie_key: None,
        }
    }
}

/// A route definition in the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    #[serde(rename = "type", default = "default_route_kind")]
    pub kind: RouteKind,
    pub service: String,

    /// Host to match (HTTP routes)
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub sticky: bool,
    /// Path to this route's TLS certificate (PEM)
    pub tls_cert_file: Option<String>,
    /// Path to this route's TLS private key (PEM)
    pub tls_key_file: Option<String>,

    /// Listen port (TCP routes)
    #[serde(default)]
    pub port: u16,
}

fn default_route_kind() -> RouteKind {
    RouteKind::Http
}

impl RouteConfig {
    /// Materialize the route, reading any referenced PEM files.
    pub fn to_route(&self) -> anyhow::Result<Route> {
        match self.kind {
            RouteKind::Http => {
                let mut route = Route::http(&self.service, &self.domain).with_sticky(self.sticky);
                if let (Some(cert_path), Some(key_path)) =
                    (&self.tls_cert_file, &self.tls_key_file)
                {
                    let cert = std::fs::read_to_string(cert_path).map_err(|e| {
                        anyhow::anyhow!("failed to read {}: {}", cert_path, e)
                    })?;
                    let key = std::fs::read_to_string(key_path)
                        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", key_path, e))?;
                    route = route.with_tls(&cert, &key);
                }
                Ok(route)
            }
            RouteKind::Tcp => Ok(Route::tcp(&self.service, self.port)),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self.kind {
            RouteKind::Http => {
                if self.domain.is_empty() {
                    return Err(format!(
                        "http route for service '{}' is missing a domain",
                        self.service
                    ));
                }
                if self.tls_cert_file.is_some() != self.tls_key_file.is_some() {
                    return Err(format!(
                        "route '{}' must set both tls_cert_file and tls_key_file",
                        self.domain
                    ));
                }
            }
            RouteKind::Tcp => {
                if self.port == 0 {
                    return Err(format!(
                        "tcp route for service '{}' is missing a port",
                        self.service
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.http_addr.parse::<SocketAddr>().is_err() {
            errors.push(format!("invalid http_addr '{}'", self.server.http_addr));
        }
        if let Some(addr) = &self.server.https_addr {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("invalid https_addr '{}'", addr));
            }
        }
        if self.server.default_tls_cert.is_some() != self.server.default_tls_key.is_some() {
            errors.push("default_tls_cert and default_tls_key must be set together".to_string());
        }

        for route in &self.routes {
            if let Err(e) = route.validate() {
                errors.push(e);
            }
            if !self.services.contains_key(&route.service) {
                errors.push(format!(
                    "route references undefined service '{}'",
                    route.service
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    pub fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .http_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid http_addr: {}", e))
    }

    pub fn https_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        match &self.server.https_addr {
            Some(addr) => Ok(Some(
                addr.parse()
                    .map_err(|e| anyhow::anyhow!("invalid https_addr: {}", e))?,
            )),
            None => Ok(None),
        }
    }

    /// Cookie key from the environment or the config file, in that order.
    pub fn cookie_key(&self) -> Option<String> {
        std::env::var("ROUTEGATE_COOKIE_KEY")
            .ok()
            .or_else(|| self.server.cookie_key.clone())
    }
}
