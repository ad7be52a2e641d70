use std::fmt;

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// SHA-256 over the concatenation of `parts`, without an intermediate buffer.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}

/// Discovery namespace: SHA-256 of an ASCII topic string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicHash(pub [u8; 32]);

impl TopicHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TopicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TopicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicHash({})", self)
    }
}

/// Hash a topic string into the key used to join the discovery overlay.
pub fn topic_hash(topic: &str) -> TopicHash {
    TopicHash(sha256(topic.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_concat_matches_single_buffer() {
        assert_eq!(sha256_concat(&[b"hypha", b".p2p"]), sha256(b"hypha.p2p"));
    }

    #[test]
    fn test_topic_hash_is_sha256_of_ascii() {
        let topic = topic_hash("hypha.neural.v1");
        assert_eq!(topic.0, sha256(b"hypha.neural.v1"));
        assert_ne!(topic, topic_hash("hypha.neural.v2"));
    }
}
