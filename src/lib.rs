//! Routegate - a host-routing HTTP/HTTPS/TCP reverse proxy
//!
//! This library provides a reverse-proxy front end that:
//! - Routes HTTP traffic by `Host` header, including wildcard domains
//! - Keeps its route table synced to an external durable store and
//!   rebuilds it without downtime when the notification stream is lost
//! - Resolves backend address sets through a service-discovery collaborator
//! - Fails over across backends when a dial fails, within a single request
//! - Pins clients to a backend with an authenticated encrypted cookie
//! - Proxies WebSocket upgrades by splicing the raw connections
//! - Selects TLS certificates by SNI against the live route table
//! - Forwards raw TCP on per-route ports through the same pool abstraction

pub mod backend;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod http_listener;
pub mod route;
pub mod sticky;
pub mod store;
pub mod sync;
pub mod table;
pub mod tcp_listener;
pub mod transport;
pub mod watch;
