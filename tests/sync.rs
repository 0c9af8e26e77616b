//! Control-plane tests: the listener mutation API, watch events, and
//! recovery from a lost store notification stream while traffic flows.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use routegate::crypto::CookieBox;
use routegate::discovery::MemoryDiscovery;
use routegate::error::RouteError;
use routegate::http_listener::{HttpListener, HttpListenerConfig};
use routegate::route::{Route, RouteKind};
use routegate::store::{MemoryRouteStore, RouteStore};
use routegate::watch::{Event, EventKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start_proxy() -> (Arc<HttpListener>, Arc<MemoryRouteStore>, Arc<MemoryDiscovery>) {
    let store = Arc::new(MemoryRouteStore::new(RouteKind::Http));
    let discovery = Arc::new(MemoryDiscovery::new());
    let listener = HttpListener::start(
        HttpListenerConfig {
            http_addr: "127.0.0.1:0".parse().unwrap(),
            https_addr: None,
            default_keypair: None,
            cookie_box: CookieBox::new(&CookieBox::generate_key()),
        },
        store.clone() as Arc<dyn RouteStore>,
        discovery.clone(),
    )
    .await
    .unwrap();
    (listener, store, discovery)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

async fn spawn_backend(body: &'static str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

async fn get_status(addr: SocketAddr, host: &str) -> u16 {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    text.split_whitespace().nth(1).unwrap().parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn routes_added_through_the_listener_become_routable() {
    let (listener, _store, discovery) = start_proxy().await;
    let backend = spawn_backend("ok").await;
    discovery.set_addrs("web", vec![backend.to_string()]);

    let mut route = Route::http("web", "api.example.com");
    listener.add_route(&mut route).await.unwrap();
    assert!(!route.id.is_empty());
    assert!(route.created_at.is_some());

    let addr = listener.addr();
    wait_until(|| listener.table().lookup("api.example.com").is_some()).await;
    assert_eq!(get_status(addr, "api.example.com").await, 200);

    listener.remove_route(&route.id).await.unwrap();
    wait_until(|| listener.table().lookup("api.example.com").is_none()).await;
    assert_eq!(get_status(addr, "api.example.com").await, 404);

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn updates_rebind_the_domain() {
    let (listener, _store, discovery) = start_proxy().await;
    let backend = spawn_backend("ok").await;
    discovery.set_addrs("web", vec![backend.to_string()]);

    let mut route = Route::http("web", "old.example.com");
    listener.add_route(&mut route).await.unwrap();
    wait_until(|| listener.table().lookup("old.example.com").is_some()).await;

    route.domain = "new.example.com".to_string();
    listener.update_route(&mut route).await.unwrap();
    wait_until(|| listener.table().lookup("new.example.com").is_some()).await;
    wait_until(|| listener.table().lookup("old.example.com").is_none()).await;

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_subscribers_see_commits_in_order() {
    let (listener, _store, _discovery) = start_proxy().await;
    let (watch_id, mut events) = listener.watch(16);

    let mut route = Route::http("web", "watched.example.com");
    listener.add_route(&mut route).await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event, Event::set(route.id.clone()));
    // the table already reflects the event
    assert!(listener.table().get(&route.id).is_some());

    listener.remove_route(&route.id).await.unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.event, EventKind::Remove);
    assert_eq!(event.id, route.id);

    listener.unwatch(watch_id);
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_loss_is_survived_without_dropping_traffic() {
    let (listener, store, discovery) = start_proxy().await;
    let backend = spawn_backend("steady").await;
    discovery.set_addrs("web", vec![backend.to_string()]);

    let mut keep = Route::http("web", "keep.example.com");
    listener.add_route(&mut keep).await.unwrap();
    let mut doomed = Route::http("doomed", "doomed.example.com");
    listener.add_route(&mut doomed).await.unwrap();

    let addr = listener.addr();
    wait_until(|| listener.table().lookup("keep.example.com").is_some()).await;
    assert_eq!(get_status(addr, "keep.example.com").await, 200);

    let table_before = listener.table();
    let web_before = table_before.service("web").unwrap();

    // sever the stream, then mutate the store behind the proxy's back
    store.remove(&doomed.id).await.unwrap();
    store.kill_subscriptions();
    let mut added = Route::http("web", "added.example.com");
    store.add(&mut added).await.unwrap();

    wait_until(|| {
        let t = listener.table();
        t.lookup("added.example.com").is_some() && t.lookup("doomed.example.com").is_none()
    })
    .await;

    // requests flow throughout and after the rebuild
    assert_eq!(get_status(addr, "keep.example.com").await, 200);
    assert_eq!(get_status(addr, "added.example.com").await, 200);
    assert_eq!(get_status(addr, "doomed.example.com").await, 404);

    // the surviving service kept its transport object; the doomed one is gone
    let table_after = listener.table();
    assert!(Arc::ptr_eq(&table_after.service("web").unwrap(), &web_before));
    assert!(table_after.service("doomed").is_none());

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_listeners_reject_mutations() {
    let (listener, _store, _discovery) = start_proxy().await;
    listener.close().await;

    let mut route = Route::http("web", "late.example.com");
    assert!(matches!(
        listener.add_route(&mut route).await,
        Err(RouteError::Closed)
    ));
    assert!(matches!(
        listener.remove_route("nope").await,
        Err(RouteError::Closed)
    ));

    // closing again is a no-op
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn priming_failure_is_reported_synchronously() {
    // a store whose kind never matches what priming installs: simulate by
    // pre-seeding a route with TLS garbage, which the table rejects
    let store = Arc::new(MemoryRouteStore::new(RouteKind::Http));
    let mut bad = Route::http("web", "bad.example.com").with_tls("junk", "junk");
    store.add(&mut bad).await.unwrap();

    let result = HttpListener::start(
        HttpListenerConfig {
            http_addr: "127.0.0.1:0".parse().unwrap(),
            https_addr: None,
            default_keypair: None,
            cookie_box: CookieBox::new(&CookieBox::generate_key()),
        },
        store as Arc<dyn RouteStore>,
        Arc::new(MemoryDiscovery::new()),
    )
    .await;

    assert!(result.is_err());
}
