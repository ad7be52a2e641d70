//! Per-connection protocol state machine.
//!
//! Each connection is driven by one task that owns the read half of the
//! transport, the handshake deadline and the heartbeat timer. A second task
//! owns the write half and drains a byte-bounded frame queue. Everything the
//! outside world does to a connection goes through a [`ConnectionHandle`].
//!
//! ```text
//! Connecting ──send handshake──▶ AwaitingHandshake ──valid handshake──▶ Authenticated
//!      │                              │                                     │
//!      └──────────────────────────────┴──── error / timeout / close ───────┴──▶ Closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hypha_crypto::{NodeId, NodeIdentity};
use hypha_transport::{
    encode, unix_millis, BackpressureHandler, BoxedStream, ConnectionState, ConnectionStats,
    ConnectionTracker, Direction, FrameDecoder, Handshake, Message, MessageType, MetricEvent,
    MetricsEmitter,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::errors::{CloseReason, ConnectionError};
use crate::listeners::Listeners;
use crate::registry::{ConnectionRegistry, Promotion};

/// Initial capacity of the read buffer.
const READ_BUFFER: usize = 8 * 1024;

/// How long a local close waits for queued frames to reach the transport.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a connection needs from its node.
#[derive(Clone)]
pub struct ConnectionContext {
    pub identity: Arc<NodeIdentity>,
    pub config: ConnectionConfig,
    pub metrics: MetricsEmitter,
    pub listeners: Listeners,
}

enum Command {
    Close(CloseReason),
}

struct Shared {
    id: u64,
    direction: Direction,
    peer_hint: Option<NodeId>,
    config: ConnectionConfig,
    metrics: MetricsEmitter,
    tracker: ConnectionTracker,
    budget: BackpressureHandler,
    frames: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    commands: mpsc::UnboundedSender<Command>,
    close_reason: Mutex<Option<CloseReason>>,
}

impl Shared {
    /// Queue one encoded frame for the writer task.
    fn enqueue(&self, frame: Bytes) -> Result<(), CloseReason> {
        let len = frame.len();
        self.budget
            .try_reserve(len)
            .map_err(|_| CloseReason::WriteBackpressureExceeded)?;
        let frames = self.frames.lock();
        match frames.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => {
                self.budget.release(len);
                Err(self
                    .close_reason
                    .lock()
                    .clone()
                    .unwrap_or(CloseReason::TransportClosed))
            }
        }
    }

    fn request_close(&self, reason: CloseReason) {
        // The task may already be gone; `Closed` is then imminent or reached.
        let _ = self.commands.send(Command::Close(reason));
    }
}

/// Cheap, cloneable reference to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Registry-local id, unique per node.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.tracker.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Verified remote node id; `None` until the handshake completes.
    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.shared.tracker.remote()
    }

    /// Identity the discovery layer claimed for this peer. Unverified.
    pub fn peer_hint(&self) -> Option<NodeId> {
        self.shared.peer_hint
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.tracker.stats()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.lock().clone()
    }

    /// Queue a context payload for the peer.
    ///
    /// Payloads above the configured maximum are refused and the connection
    /// stays open. Overflowing the write queue closes the connection.
    pub fn send_context(&self, payload: Bytes) -> Result<(), ConnectionError> {
        let max = self.shared.config.max_context_bytes;
        let len = payload.len();
        let length = match u32::try_from(len) {
            Ok(length) if len <= max => length,
            _ => return Err(ConnectionError::PayloadTooLarge { len, max }),
        };

        match self.state() {
            ConnectionState::Authenticated => {}
            ConnectionState::Closed => {
                let reason = self.close_reason().unwrap_or(CloseReason::TransportClosed);
                return Err(ConnectionError::Closed(reason));
            }
            _ => return Err(ConnectionError::NotAuthenticated),
        }

        let frame = encode(&Message::ContextStream { length, payload });
        match self.shared.enqueue(frame) {
            Ok(()) => {
                self.shared.metrics.emit(MetricEvent::TxContext {
                    bytes: len,
                    peer: self.remote_node_id(),
                });
                Ok(())
            }
            Err(CloseReason::WriteBackpressureExceeded) => {
                self.shared.request_close(CloseReason::WriteBackpressureExceeded);
                Err(ConnectionError::Closed(CloseReason::WriteBackpressureExceeded))
            }
            Err(reason) => Err(ConnectionError::Closed(reason)),
        }
    }

    /// Close the connection and wait until it is `Closed` and deregistered.
    ///
    /// Safe to call any number of times, from any number of tasks.
    pub async fn close(&self) {
        self.close_with(CloseReason::LocalClose).await;
    }

    pub(crate) async fn close_with(&self, reason: CloseReason) {
        self.shared.request_close(reason);
        self.wait_closed().await;
    }

    pub(crate) fn request_close(&self, reason: CloseReason) {
        self.shared.request_close(reason);
    }

    /// Resolves once the connection has reached `Closed`.
    pub async fn wait_closed(&self) {
        self.shared.tracker.wait_closed().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("state", &self.state())
            .field("remote", &self.remote_node_id())
            .finish()
    }
}

/// A connection that has been created but whose task is not yet running.
pub(crate) struct PendingConnection {
    handle: ConnectionHandle,
    frames_rx: mpsc::UnboundedReceiver<Bytes>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl PendingConnection {
    pub(crate) fn new(
        id: u64,
        direction: Direction,
        peer_hint: Option<NodeId>,
        ctx: &ConnectionContext,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id,
            direction,
            peer_hint,
            config: ctx.config,
            metrics: ctx.metrics.clone(),
            tracker: ConnectionTracker::new(),
            budget: BackpressureHandler::new(ctx.config.write_queue_limit_bytes),
            frames: Mutex::new(Some(frames_tx)),
            commands: commands_tx,
            close_reason: Mutex::new(None),
        });
        Self {
            handle: ConnectionHandle { shared },
            frames_rx,
            commands_rx,
        }
    }

    pub(crate) fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Spawn the connection and writer tasks over `stream`.
    pub(crate) fn start(
        self,
        stream: BoxedStream,
        ctx: ConnectionContext,
        registry: Arc<ConnectionRegistry>,
    ) {
        let (reader, writer) = tokio::io::split(stream);
        let writer = tokio::spawn(write_loop(writer, self.frames_rx, self.handle.shared.clone()));
        let task = ConnectionTask {
            decoder: FrameDecoder::new(ctx.config.max_context_bytes),
            handle: self.handle,
            ctx,
            registry,
            commands: self.commands_rx,
            heartbeat: None,
            missed_heartbeats: 0,
            claimed_peer: None,
        };
        tokio::spawn(task.run(reader, writer));
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
) -> Result<(), CloseReason>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let len = frame.len();
        let written = writer.write_all(&frame).await;
        shared.budget.release(len);
        written?;
        shared.tracker.record_sent(len as u64);
        if frames.is_empty() {
            writer.flush().await?;
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Closes and deregisters the connection if its task ends without reaching
/// `Closed`, which only happens when it panics or its runtime shuts down.
struct CloseGuard {
    handle: ConnectionHandle,
    registry: Arc<ConnectionRegistry>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        if shared.tracker.state().is_closed() {
            return;
        }
        shared
            .close_reason
            .lock()
            .get_or_insert_with(|| CloseReason::Transport("connection task aborted".to_string()));
        shared.frames.lock().take();
        self.registry.on_closed(&self.handle);

        let peer = shared.tracker.remote().or(shared.peer_hint);
        shared.metrics.emit(MetricEvent::PeerLeave { peer });
        warn!(id = shared.id, ?peer, "connection task ended without closing");
        shared.tracker.transition(ConnectionState::Closed);
    }
}

struct ConnectionTask {
    handle: ConnectionHandle,
    ctx: ConnectionContext,
    registry: Arc<ConnectionRegistry>,
    commands: mpsc::UnboundedReceiver<Command>,
    decoder: FrameDecoder,
    heartbeat: Option<Interval>,
    missed_heartbeats: u32,
    /// Key from the peer's handshake, verified or not. Used for reporting.
    claimed_peer: Option<NodeId>,
}

impl ConnectionTask {
    fn shared(&self) -> &Shared {
        &self.handle.shared
    }

    fn emit(&self, event: MetricEvent) {
        self.ctx.metrics.emit(event);
    }

    async fn run(
        mut self,
        mut reader: ReadHalf<BoxedStream>,
        mut writer: JoinHandle<Result<(), CloseReason>>,
    ) {
        let _guard = CloseGuard {
            handle: self.handle.clone(),
            registry: self.registry.clone(),
        };
        let mut writer_done = false;
        let reason = self.drive(&mut reader, &mut writer, &mut writer_done).await;
        self.heartbeat = None;
        self.finish(reason, reader, writer, writer_done).await;
    }

    async fn drive(
        &mut self,
        reader: &mut ReadHalf<BoxedStream>,
        writer: &mut JoinHandle<Result<(), CloseReason>>,
        writer_done: &mut bool,
    ) -> CloseReason {
        let handshake = encode(&Message::Handshake(Handshake::new_signed(&self.ctx.identity)));
        let handshake_len = handshake.len();
        if let Err(reason) = self.shared().enqueue(handshake) {
            return reason;
        }
        self.emit(MetricEvent::TxHandshake { bytes: handshake_len });
        self.shared().tracker.transition(ConnectionState::AwaitingHandshake);

        let handshake_deadline = tokio::time::sleep(self.ctx.config.handshake_timeout);
        tokio::pin!(handshake_deadline);
        let mut buf = BytesMut::with_capacity(READ_BUFFER);

        loop {
            loop {
                match self.decoder.decode_stream(&mut buf) {
                    Ok(Some(message)) => {
                        if let Err(reason) = self.on_message(message).await {
                            return reason;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return CloseReason::from(e),
                }
            }

            let awaiting = self.shared().tracker.state() == ConnectionState::AwaitingHandshake;

            tokio::select! {
                command = self.commands.recv() => {
                    return match command {
                        Some(Command::Close(reason)) => reason,
                        None => CloseReason::LocalClose,
                    };
                }
                result = &mut *writer, if !*writer_done => {
                    *writer_done = true;
                    return match result {
                        Ok(Err(reason)) => reason,
                        _ => CloseReason::TransportClosed,
                    };
                }
                _ = &mut handshake_deadline, if awaiting => {
                    return CloseReason::HandshakeTimeout;
                }
                _ = next_tick(&mut self.heartbeat) => {
                    if let Err(reason) = self.on_heartbeat_tick() {
                        return reason;
                    }
                }
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) if buf.is_empty() => return CloseReason::TransportClosed,
                        Ok(0) => {
                            // EOF in the middle of a frame.
                            return match hypha_transport::decode(&buf) {
                                Err(e) => CloseReason::from(e),
                                Ok(_) => CloseReason::TransportClosed,
                            };
                        }
                        Ok(n) => self.shared().tracker.record_received(n as u64),
                        Err(e) => return CloseReason::from(e),
                    }
                }
            }
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<(), CloseReason> {
        let state = self.shared().tracker.state();
        match message {
            Message::Handshake(handshake) => match state {
                ConnectionState::Authenticated => {
                    if Some(handshake.node_id()) == self.handle.remote_node_id() {
                        debug!(id = self.handle.id(), "ignoring repeated handshake");
                        Ok(())
                    } else {
                        Err(CloseReason::UnexpectedMessage(MessageType::Handshake as u8))
                    }
                }
                _ => self.on_handshake(handshake).await,
            },
            Message::Heartbeat { timestamp_ms } => {
                if state != ConnectionState::Authenticated {
                    return Err(CloseReason::UnexpectedMessage(MessageType::Heartbeat as u8));
                }
                let latency_ms = self
                    .shared()
                    .tracker
                    .record_heartbeat_ack(unix_millis(), timestamp_ms);
                self.missed_heartbeats = 0;
                self.emit(MetricEvent::RxHeartbeat {
                    latency_ms,
                    peer: self.handle.remote_node_id(),
                });
                Ok(())
            }
            Message::ContextStream { payload, .. } => {
                let peer = match (state, self.handle.remote_node_id()) {
                    (ConnectionState::Authenticated, Some(peer)) => peer,
                    _ => {
                        return Err(CloseReason::UnexpectedMessage(
                            MessageType::ContextStream as u8,
                        ))
                    }
                };
                self.emit(MetricEvent::RxContext {
                    bytes: payload.len(),
                    peer: Some(peer),
                });
                self.ctx.listeners.notify_context(peer, payload);
                Ok(())
            }
        }
    }

    async fn on_handshake(&mut self, handshake: Handshake) -> Result<(), CloseReason> {
        let peer = handshake.node_id();
        self.claimed_peer = Some(peer);
        self.emit(MetricEvent::RxHandshake { peer });

        handshake.verify().map_err(|_| CloseReason::SignatureInvalid)?;
        if peer == self.ctx.identity.node_id() {
            return Err(CloseReason::SelfConnection);
        }

        match self.registry.promote(peer, &self.handle) {
            Promotion::Promoted => {}
            Promotion::Replacing(old) => {
                debug!(%peer, old = old.id(), new = self.handle.id(), "replacing connection");
                old.close_with(CloseReason::Replaced).await;
            }
            Promotion::Superseded => {
                debug!(%peer, id = self.handle.id(), "peer already linked, dropping duplicate");
                return Err(CloseReason::Replaced);
            }
        }

        let shared = self.shared();
        shared.tracker.set_remote(peer);
        shared.tracker.transition(ConnectionState::Authenticated);

        let period = self.ctx.config.heartbeat_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
        self.missed_heartbeats = 0;

        self.emit(MetricEvent::PeerAuthenticated { peer });
        self.send_heartbeat()?;
        self.ctx.listeners.notify_authenticated(peer);
        Ok(())
    }

    fn on_heartbeat_tick(&mut self) -> Result<(), CloseReason> {
        if self.missed_heartbeats >= self.ctx.config.max_missed_heartbeats {
            return Err(CloseReason::HeartbeatTimeout {
                missed: self.missed_heartbeats,
            });
        }
        self.missed_heartbeats += 1;
        self.send_heartbeat()
    }

    fn send_heartbeat(&self) -> Result<(), CloseReason> {
        let now = unix_millis();
        let frame = encode(&Message::Heartbeat { timestamp_ms: now });
        let len = frame.len();
        self.shared().enqueue(frame)?;
        self.shared().tracker.record_heartbeat_sent(now);
        self.emit(MetricEvent::TxHeartbeat { bytes: len });
        Ok(())
    }

    async fn finish(
        self,
        reason: CloseReason,
        reader: ReadHalf<BoxedStream>,
        mut writer: JoinHandle<Result<(), CloseReason>>,
        writer_done: bool,
    ) {
        let shared = &self.handle.shared;
        *shared.close_reason.lock() = Some(reason.clone());

        // Dropping the sender lets the writer drain what is queued and shut
        // the stream down; anything else is cut off immediately.
        let graceful = matches!(reason, CloseReason::LocalClose | CloseReason::Replaced);
        shared.frames.lock().take();
        if !writer_done {
            if !graceful || tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
                let _ = writer.await;
            }
        }
        drop(reader);

        self.registry.on_closed(&self.handle);

        let was_authenticated = shared.tracker.state() == ConnectionState::Authenticated;
        let peer = shared
            .tracker
            .remote()
            .or(self.claimed_peer)
            .or(shared.peer_hint);
        if reason.is_rejection(was_authenticated) {
            self.emit(MetricEvent::PeerRejected {
                peer,
                reason: reason.code(),
            });
        } else {
            self.emit(MetricEvent::PeerLeave { peer });
        }
        debug!(id = shared.id, ?peer, %reason, "connection closed");

        shared.tracker.transition(ConnectionState::Closed);
    }
}
