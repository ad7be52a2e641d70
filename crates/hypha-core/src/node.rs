//! The node façade: one identity, one topic, many connections.

use std::sync::Arc;

use bytes::Bytes;
use hypha_crypto::{topic_hash, NodeId, NodeIdentity, TopicHash};
use hypha_transport::{Discovery, MetricEvent, MetricsEmitter, MetricsSink};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::NodeConfig;
use crate::connection::{ConnectionContext, ConnectionHandle};
use crate::errors::NodeError;
use crate::listeners::{ListenerHandle, Listeners};
use crate::registry::ConnectionRegistry;

/// A Hypha node.
///
/// Created stopped. [`start`](Self::start) joins the discovery topic and
/// accepts peers until [`stop`](Self::stop); a stopped node can be started
/// again. Listeners persist across restarts.
pub struct Node {
    identity: Arc<NodeIdentity>,
    topic: TopicHash,
    discovery: Arc<dyn Discovery>,
    metrics: MetricsEmitter,
    listeners: Listeners,
    registry: Arc<ConnectionRegistry>,
    // Serializes start/stop; `Some` while running.
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Build a node around an existing identity. `config` is validated; its
    /// seed settings are ignored.
    pub fn new(
        identity: NodeIdentity,
        config: &NodeConfig,
        discovery: Arc<dyn Discovery>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let identity = Arc::new(identity);
        let metrics = MetricsEmitter::new(sink);
        let listeners = Listeners::new();
        let registry = ConnectionRegistry::new(ConnectionContext {
            identity: identity.clone(),
            config: config.connection(),
            metrics: metrics.clone(),
            listeners: listeners.clone(),
        });
        Ok(Self {
            identity,
            topic: topic_hash(&config.topic),
            discovery,
            metrics,
            listeners,
            registry,
            accept_task: AsyncMutex::new(None),
        })
    }

    /// Validate `config` and derive the identity from its seed settings.
    pub fn from_config(
        config: &NodeConfig,
        discovery: Arc<dyn Discovery>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let identity = config.identity()?;
        Self::new(identity, config, discovery, sink)
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn topic(&self) -> TopicHash {
        self.topic
    }

    pub async fn is_running(&self) -> bool {
        self.accept_task.lock().await.is_some()
    }

    /// Join the topic and start accepting peers. No-op if already running.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            return Ok(());
        }

        let mut events = self.discovery.join(self.topic).await?;
        self.metrics.emit(MetricEvent::NodeStart {
            node_id: self.node_id(),
        });

        let registry = self.registry.clone();
        *accept_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                registry.on_discovered(event.stream, event.direction, event.peer_hint);
            }
            debug!("discovery channel closed");
        }));
        Ok(())
    }

    /// Leave the topic and close every connection. No-op if not running.
    ///
    /// When this returns, every connection is `Closed` and no timer of this
    /// node will fire again.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let mut accept_task = self.accept_task.lock().await;
        let Some(task) = accept_task.take() else {
            return Ok(());
        };

        let left = self.discovery.leave(&self.topic).await;
        if let Err(e) = &left {
            warn!(error = %e, "failed to leave discovery topic");
        }
        task.abort();
        let _ = task.await;
        self.registry.close_all().await;
        self.metrics.emit(MetricEvent::NodeStop);
        left.map_err(NodeError::from)
    }

    /// Queue `payload` for every authenticated peer.
    ///
    /// Returns how many peers accepted it. A failing peer never affects the
    /// others.
    pub fn stream_context(&self, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut sent = 0;
        for handle in self.registry.authenticated() {
            match handle.send_context(payload.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = ?handle.remote_node_id(), error = %e, "context not sent"),
            }
        }
        sent
    }

    pub fn on_authenticated<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(NodeId) + Send + Sync + 'static,
    {
        self.listeners.on_authenticated(callback)
    }

    pub fn on_context<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(NodeId, Bytes) + Send + Sync + 'static,
    {
        self.listeners.on_context(callback)
    }

    /// Node ids of all authenticated peers.
    pub fn peers(&self) -> Vec<NodeId> {
        self.registry
            .authenticated()
            .iter()
            .filter_map(ConnectionHandle::remote_node_id)
            .collect()
    }

    /// Authenticated connection to `peer`, if any.
    pub fn connection(&self, peer: &NodeId) -> Option<ConnectionHandle> {
        self.registry.get(peer).filter(ConnectionHandle::is_authenticated)
    }

    /// Number of live connections, including ones still handshaking.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
            self.registry.close_all_now();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id())
            .field("topic", &self.topic)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
