use std::path::PathBuf;
use std::sync::Arc;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use routegate::config::Config;
use routegate::crypto::CookieBox;
use routegate::discovery::MemoryDiscovery;
use routegate::http_listener::{HttpListener, HttpListenerConfig};
use routegate::route::RouteKind;
use routegate::store::{MemoryRouteStore, RouteStore};
use routegate::table::parse_keypair;
use routegate::tcp_listener::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // Cookie key for sticky sessions
    let cookie_box = match config.cookie_key() {
        Some(encoded) => CookieBox::from_base64(&encoded)?,
        None => {
            info!("Generated ephemeral cookie key; set cookie_key to keep sticky sessions across restarts");
            CookieBox::new(&CookieBox::generate_key())
        }
    };

    // Seed the in-process discovery and stores from the config. A real
    // deployment wires external collaborators through the library API.
    let discovery = Arc::new(MemoryDiscovery::new());
    for (name, addrs) in &config.services {
        discovery.set_addrs(name, addrs.clone());
    }

    let http_store = Arc::new(MemoryRouteStore::new(RouteKind::Http));
    let tcp_store = Arc::new(MemoryRouteStore::new(RouteKind::Tcp));
    for route_config in &config.routes {
        let mut route = route_config.to_route()?;
        match route.kind {
            RouteKind::Http => http_store.add(&mut route).await?,
            RouteKind::Tcp => tcp_store.add(&mut route).await?,
        }
        info!(
            id = %route.id,
            service = %route.service,
            domain = %route.domain,
            port = route.port,
            "Route installed"
        );
    }

    // Default keypair for TLS clients that send no SNI
    let https_addr = config.https_addr()?;
    let default_keypair = match (
        &config.server.default_tls_cert,
        &config.server.default_tls_key,
    ) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read_to_string(cert_path)?;
            let key = std::fs::read_to_string(key_path)?;
            info!(cert = %cert_path, key = %key_path, "Default TLS keypair loaded");
            Some(parse_keypair(&cert, &key)?)
        }
        _ if https_addr.is_some() => {
            let CertifiedKey { cert, key_pair } =
                generate_simple_self_signed(vec!["localhost".to_string()])?;
            warn!("HTTPS enabled without a default keypair, using a self-signed certificate");
            Some(parse_keypair(&cert.pem(), &key_pair.serialize_pem())?)
        }
        _ => None,
    };

    // Start the listeners
    let http_listener = HttpListener::start(
        HttpListenerConfig {
            http_addr: config.http_addr()?,
            https_addr,
            default_keypair,
            cookie_box,
        },
        http_store.clone() as Arc<dyn RouteStore>,
        discovery.clone(),
    )
    .await?;

    let tcp_listener = TcpListener::start(
        tcp_store.clone() as Arc<dyn RouteStore>,
        discovery.clone(),
    )
    .await?;

    info!(
        http = %http_listener.addr(),
        https = ?http_listener.tls_addr(),
        "Proxy running"
    );

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    http_listener.close().await;
    tcp_listener.close().await;

    info!("Shutdown complete");
    Ok(())
}
