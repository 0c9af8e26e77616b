//! Store-to-table synchronization.
//!
//! Priming subscribes to the notification stream first and then lists all
//! routes, so nothing slips between the list and the first notification.
//! If the stream is lost, a replacement table is primed off to the side
//! while the previous one keeps serving, then swapped in.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{RouteError, StoreError};
use crate::route::Route;
use crate::store::{RouteStore, Subscription};

/// Pause between rebuild attempts after a priming failure.
const REBUILD_BACKOFF: Duration = Duration::from_secs(1);

/// A route table the sync loop can drive.
pub trait SyncTable: Send + Sync + 'static {
    fn apply_set(&self, route: Route) -> Result<(), RouteError>;
    fn apply_remove(&self, id: &str) -> Result<(), RouteError>;

    /// A fresh, empty table that shares this table's live resources.
    fn successor(&self) -> Self
    where
        Self: Sized;

    /// Called once a rebuilt table is fully primed, before it goes live.
    fn finish_priming(&self);
}

/// Shared pointer to the live table. Swapped atomically on rebuild; readers
/// see either the old or the new table, never a mix.
pub struct Slot<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Slot<T> {
    pub fn new(table: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    pub fn current(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    fn swap(&self, table: Arc<T>) {
        *self.inner.write() = table;
    }
}

/// Handle to a running sync loop.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Prime the table from the store and start the sync loop. Errors during
/// priming are reported here; once this returns the table is current.
pub async fn start<T: SyncTable>(
    store: Arc<dyn RouteStore>,
    slot: Slot<T>,
) -> anyhow::Result<SyncHandle> {
    let sub = prime(store.as_ref(), slot.current().as_ref()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(store, slot, sub, shutdown_rx));
    Ok(SyncHandle {
        shutdown: shutdown_tx,
        task,
    })
}

/// Subscribe, list, and install every route. Returns the subscription that
/// was opened before the list.
async fn prime<T: SyncTable>(
    store: &dyn RouteStore,
    table: &T,
) -> anyhow::Result<Subscription> {
    let table_name = store.table_name();
    let sub = store
        .subscribe()
        .await
        .with_context(|| format!("failed to subscribe to {}", table_name))?;

    let routes = store
        .list()
        .await
        .with_context(|| format!("failed to list {}", table_name))?;

    let count = routes.len();
    for route in routes {
        let id = route.id.clone();
        table
            .apply_set(route)
            .with_context(|| format!("failed to install route {}", id))?;
    }
    info!(table = table_name, routes = count, "route table primed");
    Ok(sub)
}

async fn run<T: SyncTable>(
    store: Arc<dyn RouteStore>,
    slot: Slot<T>,
    mut sub: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    let table_name = store.table_name();

    loop {
        // steady state: apply notifications until the stream is lost
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                id = sub.next() => match id {
                    Some(id) => {
                        apply_notification(store.as_ref(), slot.current().as_ref(), &id).await;
                    }
                    None => break,
                }
            }
        }

        warn!(table = table_name, "notification stream lost, rebuilding route table");

        // rebuild: the previous table keeps serving until the swap
        loop {
            if *shutdown.borrow() {
                return;
            }
            let fresh = Arc::new(slot.current().successor());
            match prime(store.as_ref(), fresh.as_ref()).await {
                Ok(new_sub) => {
                    fresh.finish_priming();
                    slot.swap(fresh);
                    sub = new_sub;
                    info!(table = table_name, "route table rebuilt");
                    break;
                }
                Err(e) => {
                    error!(table = table_name, error = %e, "rebuild failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(REBUILD_BACKOFF) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Resolve one notification: a fetchable row is an upsert, a missing row is
/// a removal. Removal of a route we never had is fine.
async fn apply_notification<T: SyncTable>(store: &dyn RouteStore, table: &T, id: &str) {
    match store.get(id).await {
        Ok(route) => {
            if let Err(e) = table.apply_set(route) {
                error!(route = id, error = %e, "failed to apply route update");
            }
        }
        Err(StoreError::NotFound) => match table.apply_remove(id) {
            Ok(()) | Err(RouteError::NotFound) => {}
            Err(e) => error!(route = id, error = %e, "failed to remove route"),
        },
        Err(e) => error!(route = id, error = %e, "failed to fetch route"),
    }
}
