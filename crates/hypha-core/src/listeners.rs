//! Listener registration for authentication and context events.
//!
//! Callbacks run on the connection task that produced the event, so they must
//! not block. A panicking callback is logged and skipped; it never takes the
//! connection down.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use hypha_crypto::NodeId;
use parking_lot::RwLock;
use tracing::warn;

/// Called once per connection when a peer completes its handshake.
pub type AuthenticatedCallback = Arc<dyn Fn(NodeId) + Send + Sync>;
/// Called for every context payload received from an authenticated peer.
pub type ContextCallback = Arc<dyn Fn(NodeId, Bytes) + Send + Sync>;

#[derive(Default)]
struct Table {
    next_id: AtomicU64,
    authenticated: RwLock<BTreeMap<u64, AuthenticatedCallback>>,
    context: RwLock<BTreeMap<u64, ContextCallback>>,
}

#[derive(Clone, Copy, Debug)]
enum Kind {
    Authenticated,
    Context,
}

/// Shared listener registry. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct Listeners {
    table: Arc<Table>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_authenticated<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(NodeId) + Send + Sync + 'static,
    {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.authenticated.write().insert(id, Arc::new(callback));
        self.handle(id, Kind::Authenticated)
    }

    pub fn on_context<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(NodeId, Bytes) + Send + Sync + 'static,
    {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.context.write().insert(id, Arc::new(callback));
        self.handle(id, Kind::Context)
    }

    fn handle(&self, id: u64, kind: Kind) -> ListenerHandle {
        ListenerHandle {
            id,
            kind,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Invoke authentication listeners in registration order.
    pub fn notify_authenticated(&self, peer: NodeId) {
        // Clone out so callbacks may register or unregister listeners.
        let callbacks: Vec<_> = self.table.authenticated.read().values().cloned().collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(peer))).is_err() {
                warn!(%peer, "authentication listener panicked");
            }
        }
    }

    /// Invoke context listeners in registration order.
    pub fn notify_context(&self, peer: NodeId, payload: Bytes) {
        let callbacks: Vec<_> = self.table.context.read().values().cloned().collect();
        for callback in callbacks {
            let payload = payload.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(peer, payload))).is_err() {
                warn!(%peer, "context listener panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.authenticated.read().len() + self.table.context.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration token returned by [`Listeners::on_authenticated`] and
/// [`Listeners::on_context`].
///
/// Dropping the handle keeps the listener registered; call
/// [`unregister`](Self::unregister) to remove it.
#[must_use = "dropping a ListenerHandle leaves the listener registered forever"]
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    kind: Kind,
    table: Weak<Table>,
}

impl ListenerHandle {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unregister(self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        match self.kind {
            Kind::Authenticated => table.authenticated.write().remove(&self.id).is_some(),
            Kind::Context => table.context.write().remove(&self.id).is_some(),
        }
    }
}
