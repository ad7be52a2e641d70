//! Connection registry.
//!
//! New connections are held under a local id until their handshake verifies,
//! then re-keyed by the peer's node id. At most one connection per peer is
//! ever promoted. A newer one replaces the older, except that the link dialed
//! by the lower node id is always kept, so two links crossing between the
//! same pair settle on the same one at both ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hypha_crypto::NodeId;
use hypha_transport::{BoxedStream, Direction, MetricEvent};
use parking_lot::Mutex;

use crate::connection::{ConnectionContext, ConnectionHandle, PendingConnection};
use crate::errors::CloseReason;

#[derive(Default)]
struct Entries {
    pending: HashMap<u64, ConnectionHandle>,
    by_peer: HashMap<NodeId, ConnectionHandle>,
}

/// Outcome of [`ConnectionRegistry::promote`].
pub(crate) enum Promotion {
    Promoted,
    /// Promoted over this connection, which must be closed before the new
    /// one is treated as authenticated.
    Replacing(ConnectionHandle),
    /// The peer already has the preferred link; this one must close.
    Superseded,
}

/// Whether a link in `direction` was dialed by the lower of the two ids.
fn dialed_by_lower_id(local: NodeId, peer: NodeId, direction: Direction) -> bool {
    (direction == Direction::Outbound) == (local < peer)
}

/// Tracks every live connection of a node.
pub struct ConnectionRegistry {
    ctx: ConnectionContext,
    next_id: AtomicU64,
    // Never held across an await.
    entries: Mutex<Entries>,
}

impl ConnectionRegistry {
    pub fn new(ctx: ConnectionContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Entries::default()),
        })
    }

    /// Wrap a freshly discovered transport in a connection and start it.
    pub fn on_discovered(
        self: &Arc<Self>,
        stream: BoxedStream,
        direction: Direction,
        peer_hint: Option<NodeId>,
    ) -> ConnectionHandle {
        self.ctx.metrics.emit(MetricEvent::PeerJoin { peer: peer_hint });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingConnection::new(id, direction, peer_hint, &self.ctx);
        let handle = pending.handle().clone();
        // Registered before the task exists so its removal can never race ahead.
        self.entries.lock().pending.insert(id, handle.clone());
        pending.start(stream, self.ctx.clone(), self.clone());
        handle
    }

    /// Re-key `handle` by its verified peer id.
    pub(crate) fn promote(&self, peer: NodeId, handle: &ConnectionHandle) -> Promotion {
        let local = self.ctx.identity.node_id();
        let mut entries = self.entries.lock();
        if let Some(current) = entries.by_peer.get(&peer) {
            if current.id() != handle.id()
                && current.close_reason().is_none()
                && dialed_by_lower_id(local, peer, current.direction())
                && !dialed_by_lower_id(local, peer, handle.direction())
            {
                return Promotion::Superseded;
            }
        }
        entries.pending.remove(&handle.id());
        match entries.by_peer.insert(peer, handle.clone()) {
            Some(old) if old.id() != handle.id() => Promotion::Replacing(old),
            _ => Promotion::Promoted,
        }
    }

    /// Remove a closed connection. Idempotent, and leaves alone any entry
    /// that now belongs to a different connection.
    pub fn on_closed(&self, handle: &ConnectionHandle) {
        let mut entries = self.entries.lock();
        entries.pending.remove(&handle.id());
        entries.by_peer.retain(|_, h| h.id() != handle.id());
    }

    /// Connection currently registered for `peer`.
    pub fn get(&self, peer: &NodeId) -> Option<ConnectionHandle> {
        self.entries.lock().by_peer.get(peer).cloned()
    }

    /// All connections that have completed their handshake.
    pub fn authenticated(&self) -> Vec<ConnectionHandle> {
        self.entries
            .lock()
            .by_peer
            .values()
            .filter(|h| h.is_authenticated())
            .cloned()
            .collect()
    }

    /// Number of registered connections, authenticated or not.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        entries.pending.len() + entries.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<ConnectionHandle> {
        let entries = self.entries.lock();
        entries
            .pending
            .values()
            .chain(entries.by_peer.values())
            .cloned()
            .collect()
    }

    /// Close every connection and wait for each to reach `Closed`.
    pub async fn close_all(&self) {
        let handles = self.snapshot();
        for handle in &handles {
            handle.request_close(CloseReason::LocalClose);
        }
        for handle in handles {
            handle.wait_closed().await;
        }
    }

    /// Ask every connection to close without waiting.
    pub(crate) fn close_all_now(&self) {
        for handle in self.snapshot() {
            handle.request_close(CloseReason::LocalClose);
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("ConnectionRegistry")
            .field("pending", &entries.pending.len())
            .field("authenticated", &entries.by_peer.len())
            .finish()
    }
}
