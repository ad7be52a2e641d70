//! Demo payload streamed by the daemon.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Snapshot of a pretend training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub iteration: u64,
    pub checkpoint: String,
    pub loss: f64,
}

impl TrainingState {
    pub fn at(iteration: u64) -> Self {
        Self {
            iteration,
            checkpoint: format!("v{iteration}"),
            loss: 0.1 / (iteration as f64 + 1.0),
        }
    }

    /// Compact JSON.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_json() {
        let encoded = TrainingState::at(1).encode().unwrap();
        assert_eq!(&encoded[..], br#"{"iteration":1,"checkpoint":"v1","loss":0.05}"#);
    }

    #[test]
    fn test_loss_decreases() {
        assert_eq!(TrainingState::at(0).loss, 0.1);
        assert!(TrainingState::at(10).loss < TrainingState::at(9).loss);
    }

    #[test]
    fn test_foreign_payload_rejected() {
        assert!(TrainingState::decode(b"hello").is_err());
        assert!(TrainingState::decode(br#"{"iteration":1}"#).is_err());
    }
}
