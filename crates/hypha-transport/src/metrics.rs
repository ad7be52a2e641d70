//! Line-oriented protocol metrics.
//!
//! Every observable protocol event becomes one line of the form
//! `<unix_seconds> <TAG> <fields...>`, handed to a [`MetricsSink`]. The line
//! format is consumed by external dashboards and must stay stable.

use hypha_crypto::NodeId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Target used by [`TracingSink`].
pub const METRICS_TARGET: &str = "hypha::metrics";

/// Destination for formatted metrics lines.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, line: &str);
}

/// A single protocol event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricEvent {
    NodeStart { node_id: NodeId },
    NodeStop,
    PeerJoin { peer: Option<NodeId> },
    PeerLeave { peer: Option<NodeId> },
    PeerAuthenticated { peer: NodeId },
    PeerRejected { peer: Option<NodeId>, reason: &'static str },
    TxHandshake { bytes: usize },
    RxHandshake { peer: NodeId },
    TxHeartbeat { bytes: usize },
    RxHeartbeat { latency_ms: u64, peer: Option<NodeId> },
    TxContext { bytes: usize, peer: Option<NodeId> },
    RxContext { bytes: usize, peer: Option<NodeId> },
}

impl MetricEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            MetricEvent::NodeStart { .. } => "NODE_START",
            MetricEvent::NodeStop => "NODE_STOP",
            MetricEvent::PeerJoin { .. } => "PEER_JOIN",
            MetricEvent::PeerLeave { .. } => "PEER_LEAVE",
            MetricEvent::PeerAuthenticated { .. } => "PEER_AUTHENTICATED",
            MetricEvent::PeerRejected { .. } => "PEER_REJECTED",
            MetricEvent::TxHandshake { .. } => "TX_HANDSHAKE",
            MetricEvent::RxHandshake { .. } => "RX_HANDSHAKE",
            MetricEvent::TxHeartbeat { .. } => "TX_HEARTBEAT",
            MetricEvent::RxHeartbeat { .. } => "RX_HEARTBEAT",
            MetricEvent::TxContext { .. } => "TX_CONTEXT",
            MetricEvent::RxContext { .. } => "RX_CONTEXT",
        }
    }
}

struct Peer<'a>(&'a Option<NodeId>);

impl fmt::Display for Peer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{id}"),
            None => f.write_str("unknown"),
        }
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())?;
        match self {
            MetricEvent::NodeStart { node_id } => write!(f, " ID={node_id}"),
            MetricEvent::NodeStop => Ok(()),
            MetricEvent::PeerJoin { peer } | MetricEvent::PeerLeave { peer } => {
                write!(f, " {}", Peer(peer))
            }
            MetricEvent::PeerAuthenticated { peer } => write!(f, " {peer}"),
            MetricEvent::PeerRejected { peer, reason } => {
                write!(f, " {} REASON={reason}", Peer(peer))
            }
            MetricEvent::TxHandshake { bytes } | MetricEvent::TxHeartbeat { bytes } => {
                write!(f, " {bytes}B")
            }
            MetricEvent::RxHandshake { peer } => write!(f, " PEER={peer}"),
            MetricEvent::RxHeartbeat { latency_ms, peer } => {
                write!(f, " LAT={latency_ms}ms PEER={}", Peer(peer))
            }
            MetricEvent::TxContext { bytes, peer } | MetricEvent::RxContext { bytes, peer } => {
                write!(f, " {bytes}B PEER={}", Peer(peer))
            }
        }
    }
}

/// Format one metrics line with an explicit timestamp.
pub fn format_line(unix_secs: u64, event: &MetricEvent) -> String {
    format!("{unix_secs} {event}")
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Stamps events with the wall clock and forwards them to a sink.
#[derive(Clone)]
pub struct MetricsEmitter {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsEmitter {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: MetricEvent) {
        self.sink.emit(&format_line(unix_secs(), &event));
    }
}

impl fmt::Debug for MetricsEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEmitter").finish_non_exhaustive()
    }
}

/// Forwards lines as `tracing` INFO events on [`METRICS_TARGET`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn emit(&self, line: &str) {
        tracing::info!(target: METRICS_TARGET, "{}", line);
    }
}

/// Discards every line.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn emit(&self, _line: &str) {}
}

/// Records lines in memory; used by tests to assert on the event stream.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
    notify: Notify,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All lines recorded so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Lines with the leading timestamp stripped, e.g. `"TX_HANDSHAKE 98B"`.
    pub fn events(&self) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .map(|line| match line.split_once(' ') {
                Some((_, rest)) => rest.to_string(),
                None => line.clone(),
            })
            .collect()
    }

    /// Whether any event (timestamp stripped) starts with `prefix`.
    pub fn contains(&self, prefix: &str) -> bool {
        self.events().iter().any(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// Wait until an event starting with `prefix` has been recorded.
    ///
    /// Returns the matching event, or `None` if `timeout` elapses first.
    pub async fn wait_for(&self, prefix: &str, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(found) = self.events().into_iter().find(|e| e.starts_with(prefix)) {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

impl MetricsSink for MemorySink {
    fn emit(&self, line: &str) {
        self.lines.lock().push(line.to_string());
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypha_crypto::NodeIdentity;

    fn peer() -> NodeId {
        NodeIdentity::from_phrase("peer").node_id()
    }

    #[test]
    fn test_line_formats() {
        let id = peer();
        let cases = [
            (MetricEvent::NodeStart { node_id: id }, format!("NODE_START ID={id}")),
            (MetricEvent::NodeStop, "NODE_STOP".to_string()),
            (MetricEvent::PeerJoin { peer: None }, "PEER_JOIN unknown".to_string()),
            (MetricEvent::PeerLeave { peer: Some(id) }, format!("PEER_LEAVE {id}")),
            (MetricEvent::PeerAuthenticated { peer: id }, format!("PEER_AUTHENTICATED {id}")),
            (
                MetricEvent::PeerRejected { peer: None, reason: "SIGNATURE_INVALID" },
                "PEER_REJECTED unknown REASON=SIGNATURE_INVALID".to_string(),
            ),
            (MetricEvent::TxHandshake { bytes: 98 }, "TX_HANDSHAKE 98B".to_string()),
            (MetricEvent::RxHandshake { peer: id }, format!("RX_HANDSHAKE PEER={id}")),
            (MetricEvent::TxHeartbeat { bytes: 10 }, "TX_HEARTBEAT 10B".to_string()),
            (
                MetricEvent::RxHeartbeat { latency_ms: 15, peer: Some(id) },
                format!("RX_HEARTBEAT LAT=15ms PEER={id}"),
            ),
            (
                MetricEvent::TxContext { bytes: 5, peer: Some(id) },
                format!("TX_CONTEXT 5B PEER={id}"),
            ),
            (
                MetricEvent::RxContext { bytes: 5, peer: Some(id) },
                format!("RX_CONTEXT 5B PEER={id}"),
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(format_line(1_700_000_000, &event), format!("1700000000 {expected}"));
        }
    }

    #[test]
    fn test_lines_are_single_space_delimited() {
        let line = format_line(
            1,
            &MetricEvent::RxHeartbeat { latency_ms: 3, peer: Some(peer()) },
        );
        assert!(!line.contains("  "));
        assert!(!line.contains('\n'));
        assert_eq!(line.split(' ').count(), 4);
    }

    #[test]
    fn test_emitter_stamps_current_time() {
        let sink = MemorySink::new();
        let emitter = MetricsEmitter::new(sink.clone());
        let before = unix_secs();
        emitter.emit(MetricEvent::NodeStop);

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        let (ts, rest) = lines[0].split_once(' ').unwrap();
        assert!(ts.parse::<u64>().unwrap() >= before);
        assert_eq!(rest, "NODE_STOP");
        assert_eq!(sink.events(), vec!["NODE_STOP".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_sink_wait_for() {
        let sink = MemorySink::new();
        let emitter = MetricsEmitter::new(sink.clone());

        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for("TX_HEARTBEAT", Duration::from_secs(5)).await })
        };
        emitter.emit(MetricEvent::TxHandshake { bytes: 98 });
        emitter.emit(MetricEvent::TxHeartbeat { bytes: 10 });

        assert_eq!(waiter.await.unwrap().as_deref(), Some("TX_HEARTBEAT 10B"));
        assert!(sink.contains("TX_HANDSHAKE"));
        assert_eq!(sink.count("TX_"), 2);
        assert!(sink
            .wait_for("NODE_START", Duration::from_millis(20))
            .await
            .is_none());
    }
}
