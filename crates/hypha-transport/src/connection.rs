//! Connection state tracking and dial retry backoff.

use crate::traits::TransportError;
use hypha_crypto::NodeId;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport handed over, own handshake not yet written.
    Connecting,
    /// Own handshake sent, waiting for the peer's.
    AwaitingHandshake,
    /// Peer's handshake verified; heartbeats and context flow.
    Authenticated,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

#[derive(Default)]
struct HeartbeatTimes {
    sent_ms: Option<u64>,
    ack_ms: Option<u64>,
    latency_ms: Option<u64>,
}

/// Shared view of one connection's state and counters.
///
/// Written by the task that owns the connection, read by anyone holding a
/// handle. `Closed` is terminal: later transitions are ignored.
pub struct ConnectionTracker {
    state: watch::Sender<ConnectionState>,
    opened_at: Instant,
    authenticated_at: Mutex<Option<Instant>>,
    remote: Mutex<Option<NodeId>>,
    heartbeats: Mutex<HeartbeatTimes>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            state,
            opened_at: Instant::now(),
            authenticated_at: Mutex::new(None),
            remote: Mutex::new(None),
            heartbeats: Mutex::new(HeartbeatTimes::default()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Transition to a new state, returning the previous one.
    pub fn transition(&self, new_state: ConnectionState) -> ConnectionState {
        let mut old_state = new_state;
        self.state.send_if_modified(|state| {
            old_state = *state;
            if state.is_closed() || *state == new_state {
                return false;
            }
            if new_state == ConnectionState::Authenticated {
                *self.authenticated_at.lock() = Some(Instant::now());
            }
            *state = new_state;
            true
        });
        old_state
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the connection has reached `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| state.is_closed()).await;
    }

    pub fn set_remote(&self, node_id: NodeId) {
        *self.remote.lock() = Some(node_id);
    }

    /// Verified remote node id, `None` until the handshake completes.
    pub fn remote(&self) -> Option<NodeId> {
        *self.remote.lock()
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_heartbeat_sent(&self, at_ms: u64) {
        self.heartbeats.lock().sent_ms = Some(at_ms);
    }

    /// Record a heartbeat from the peer and return the measured latency.
    ///
    /// Latency is `now - timestamp`, clamped at zero when the peer's clock
    /// runs ahead of ours.
    pub fn record_heartbeat_ack(&self, now_ms: u64, peer_timestamp_ms: u64) -> u64 {
        let latency = now_ms.saturating_sub(peer_timestamp_ms);
        let mut hb = self.heartbeats.lock();
        hb.ack_ms = Some(now_ms);
        hb.latency_ms = Some(latency);
        latency
    }

    pub fn stats(&self) -> ConnectionStats {
        let hb = self.heartbeats.lock();
        ConnectionStats {
            state: self.state(),
            remote: self.remote(),
            age: self.opened_at.elapsed(),
            authenticated_for: self.authenticated_at.lock().map(|t| t.elapsed()),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            last_heartbeat_sent_ms: hb.sent_ms,
            last_heartbeat_ack_ms: hb.ack_ms,
            last_latency_ms: hb.latency_ms,
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection statistics
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub remote: Option<NodeId>,
    pub age: Duration,
    pub authenticated_for: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_heartbeat_sent_ms: Option<u64>,
    pub last_heartbeat_ack_ms: Option<u64>,
    pub last_latency_ms: Option<u64>,
}

/// Exponential backoff for establishing an outbound transport.
///
/// Used only to get a transport up in the first place. Once a connection
/// has been handed to the protocol layer, its loss is final.
pub struct DialBackoff {
    max_attempts: Option<u32>,
    base_delay: Duration,
    max_delay: Duration,
}

impl DialBackoff {
    /// `max_attempts = None` retries until the calling task is dropped.
    pub fn new(max_attempts: Option<u32>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Call `connect_fn` until it succeeds, sleeping between failures.
    pub async fn retry<T, F, Fut>(&self, mut connect_fn: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            if let Some(max) = self.max_attempts {
                if attempt >= max {
                    return Err(TransportError::Other(format!(
                        "gave up after {attempt} dial attempts"
                    )));
                }
            }

            match connect_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = self.calculate_backoff(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "dial failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Delay before retry number `attempt`: base * 2^attempt, capped, with up
    /// to 10% random jitter.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(30) as i32;
        let delay = self.base_delay.as_secs_f64() * 2.0_f64.powi(exp);
        let delay = delay.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..=0.1);
        Duration::from_secs_f64(delay * (1.0 + jitter)).min(self.max_delay)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use hypha_crypto::NodeIdentity;
    use std::sync::Arc;

    #[test]
    fn test_state_transitions() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.state(), ConnectionState::Connecting);

        tracker.transition(ConnectionState::AwaitingHandshake);
        assert_eq!(tracker.state(), ConnectionState::AwaitingHandshake);
        assert!(tracker.stats().authenticated_for.is_none());

        let old = tracker.transition(ConnectionState::Authenticated);
        assert_eq!(old, ConnectionState::AwaitingHandshake);
        assert!(tracker.stats().authenticated_for.is_some());
    }

    #[test]
    fn test_closed_is_terminal() {
        let tracker = ConnectionTracker::new();
        tracker.transition(ConnectionState::Closed);
        assert_eq!(
            tracker.transition(ConnectionState::Authenticated),
            ConnectionState::Closed
        );
        assert_eq!(tracker.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_bytes_tracking() {
        let tracker = ConnectionTracker::new();
        tracker.record_sent(100);
        tracker.record_received(200);
        tracker.record_sent(5);

        let stats = tracker.stats();
        assert_eq!(stats.bytes_sent, 105);
        assert_eq!(stats.bytes_received, 200);
    }

    #[test]
    fn test_heartbeat_latency() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.record_heartbeat_ack(1_015, 1_000), 15);
        let stats = tracker.stats();
        assert_eq!(stats.last_latency_ms, Some(15));
        assert_eq!(stats.last_heartbeat_ack_ms, Some(1_015));

        // Peer clock ahead of ours.
        assert_eq!(tracker.record_heartbeat_ack(1_000, 2_000), 0);
    }

    #[test]
    fn test_remote_id() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.remote().is_none());
        let id = NodeIdentity::from_phrase("peer").node_id();
        tracker.set_remote(id);
        assert_eq!(tracker.stats().remote, Some(id));
    }

    #[tokio::test]
    async fn test_wait_closed() {
        let tracker = Arc::new(ConnectionTracker::new());
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_closed().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tracker.transition(ConnectionState::Closed);
        waiter.await.unwrap();

        // Already closed resolves immediately.
        tracker.wait_closed().await;
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = DialBackoff::new(None, Duration::from_millis(100), Duration::from_secs(2));
        let first = backoff.calculate_backoff(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let third = backoff.calculate_backoff(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(440));
        assert_eq!(backoff.calculate_backoff(50), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let backoff = DialBackoff::new(Some(5), Duration::from_millis(10), Duration::from_millis(50));
        let mut calls = 0;
        let result = backoff
            .retry(|| {
                calls += 1;
                let ok = calls >= 3;
                async move {
                    if ok {
                        Ok(calls)
                    } else {
                        Err(refused())
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let backoff = DialBackoff::new(Some(2), Duration::from_millis(10), Duration::from_millis(50));
        let mut calls = 0;
        let result: Result<(), _> = backoff
            .retry(|| {
                calls += 1;
                async { Err(refused()) }
            })
            .await;
        assert!(matches!(result, Err(TransportError::Other(_))));
        assert_eq!(calls, 2);
    }

    fn refused() -> TransportError {
        std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()
    }
}
