//! Durable route store interface and an in-memory implementation.
//!
//! The real store lives outside this process; the proxy only depends on the
//! trait. Rows are soft-deleted and every mutation emits a notification on
//! a channel named after the route table, payload = row id.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::route::{Route, RouteKind};

/// Queue depth for a single notification subscriber.
const SUBSCRIPTION_BUFFER: usize = 256;

/// A stream of route-change notifications. Each item is the id of the row
/// that changed. `next` returning `None` means the stream was lost and the
/// consumer must resubscribe and re-list.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// The durable route store consumed by the listeners.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Notification channel name, equal to the route table name.
    fn table_name(&self) -> &'static str;

    /// Insert a route. The store assigns the id and timestamps.
    async fn add(&self, route: &mut Route) -> Result<(), StoreError>;

    /// Update an existing route by id.
    async fn set(&self, route: &mut Route) -> Result<(), StoreError>;

    /// Fetch a live (not soft-deleted) route by id.
    async fn get(&self, id: &str) -> Result<Route, StoreError>;

    /// List all live routes.
    async fn list(&self) -> Result<Vec<Route>, StoreError>;

    /// Soft-delete a route by id. Deleting an absent row is not an error.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Open a change-notification stream.
    async fn subscribe(&self) -> Result<Subscription, StoreError>;
}

struct StoredRoute {
    route: Route,
    deleted: bool,
}

/// In-memory `RouteStore` used by the test suite and the demo binary.
pub struct MemoryRouteStore {
    kind: RouteKind,
    rows: Mutex<HashMap<String, StoredRoute>>,
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
}

impl MemoryRouteStore {
    pub fn new(kind: RouteKind) -> Self {
        Self {
            kind,
            rows: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, id: &str) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(id.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Sever every open subscription, as if the listener connection to the
    /// store dropped. Consumers observe end-of-stream and must resubscribe.
    pub fn kill_subscriptions(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    fn table_name(&self) -> &'static str {
        self.kind.table_name()
    }

    async fn add(&self, route: &mut Route) -> Result<(), StoreError> {
        if route.kind != self.kind {
            return Err(StoreError::Unavailable(format!(
                "route kind does not match the {} table",
                self.table_name()
            )));
        }
        if !route.id.is_empty() {
            return Err(StoreError::PresetId);
        }

        route.id = Uuid::new_v4().to_string();
        let now = Utc::now();
        route.created_at = Some(now);
        route.updated_at = Some(now);

        self.rows.lock().insert(
            route.id.clone(),
            StoredRoute {
                route: route.clone(),
                deleted: false,
            },
        );
        self.notify(&route.id);
        Ok(())
    }

    async fn set(&self, route: &mut Route) -> Result<(), StoreError> {
        {
            let mut rows = self.rows.lock();
            let row = rows
                .get_mut(&route.id)
                .filter(|r| !r.deleted)
                .ok_or(StoreError::NotFound)?;

            route.created_at = row.route.created_at;
            route.updated_at = Some(Utc::now());
            row.route = route.clone();
        }
        self.notify(&route.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Route, StoreError> {
        if id.is_empty() {
            return Err(StoreError::NotFound);
        }
        self.rows
            .lock()
            .get(id)
            .filter(|r| !r.deleted)
            .map(|r| r.route.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Route>, StoreError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| !r.deleted)
            .map(|r| r.route.clone())
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut notify = false;
        {
            let mut rows = self.rows.lock();
            if let Some(row) = rows.get_mut(id) {
                row.deleted = true;
                notify = true;
            }
        }
        if notify {
            self.notify(id);
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.lock().push(tx);
        Ok(Subscription { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_assigns_id_and_timestamps() {
        let store = MemoryRouteStore::new(RouteKind::Http);
        let mut route = Route::http("web", "example.com");

        store.add(&mut route).await.unwrap();

        assert!(!route.id.is_empty());
        assert!(route.created_at.is_some());
        assert_eq!(store.get(&route.id).await.unwrap(), route);
    }

    #[tokio::test]
    async fn add_rejects_preset_ids() {
        let store = MemoryRouteStore::new(RouteKind::Http);
        let mut route = Route::http("web", "example.com");
        route.id = "chosen-by-client".to_string();

        assert!(matches!(
            store.add(&mut route).await,
            Err(StoreError::PresetId)
        ));
    }

    #[tokio::test]
    async fn add_rejects_wrong_kind() {
        let store = MemoryRouteStore::new(RouteKind::Tcp);
        let mut route = Route::http("web", "example.com");

        assert!(matches!(
            store.add(&mut route).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn removed_routes_disappear_from_get_and_list() {
        let store = MemoryRouteStore::new(RouteKind::Http);
        let mut route = Route::http("web", "example.com");
        store.add(&mut route).await.unwrap();

        store.remove(&route.id).await.unwrap();

        assert!(matches!(
            store.get(&route.id).await,
            Err(StoreError::NotFound)
        ));
        assert!(store.list().await.unwrap().is_empty());

        // removing again is idempotent
        store.remove(&route.id).await.unwrap();
    }

    #[tokio::test]
    async fn mutations_notify_subscribers_with_the_row_id() {
        let store = MemoryRouteStore::new(RouteKind::Http);
        let mut sub = store.subscribe().await.unwrap();

        let mut route = Route::http("web", "example.com");
        store.add(&mut route).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), route.id);

        route.sticky = true;
        store.set(&mut route).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), route.id);

        store.remove(&route.id).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), route.id);
    }

    #[tokio::test]
    async fn killed_subscriptions_end_the_stream() {
        let store = MemoryRouteStore::new(RouteKind::Http);
        let mut sub = store.subscribe().await.unwrap();
        assert_eq!(store.subscriber_count(), 1);

        store.kill_subscriptions();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn set_missing_route_is_not_found() {
        let store = MemoryRouteStore::new(RouteKind::Http);
        let mut route = Route::http("web", "example.com");
        route.id = "nope".to_string();

        assert!(matches!(
            store.set(&mut route).await,
            Err(StoreError::NotFound)
        ));
    }
}
