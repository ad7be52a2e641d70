#![forbid(unsafe_code)]

pub mod hash;
pub mod identity;

pub use hash::{sha256, topic_hash, TopicHash};
pub use identity::{verify_signature, IdentityError, NodeId, NodeIdentity};

#[cfg(test)]
mod proptests;
