//! Node identity derived from a 32-byte master seed.
//!
//! The Ed25519 public key doubles as the node id. Private key material never
//! leaves this type: it is not serializable and its `Debug` output is redacted.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use zeroize::Zeroizing;

use crate::hash::{sha256, sha256_concat};

/// Length of a master seed in bytes.
pub const SEED_LEN: usize = 32;
/// Length of an Ed25519 public key (and of a node id) in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Domain tag mixed into the master seed before it becomes a signing key.
const P2P_DOMAIN: &[u8] = b"hypha.p2p";

/// Error type for identity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid seed length: expected {SEED_LEN}, got {got}")]
    InvalidSeedLength { got: usize },
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("entropy source unavailable")]
    Entropy,
}

/// A node's globally unique identifier: its Ed25519 public key.
///
/// The text form is the full lowercase hex encoding of the key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; PUBLIC_KEY_LEN]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; PUBLIC_KEY_LEN]> for NodeId {
    fn from(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidHex)?;
        let arr: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(arr))
    }
}

/// Immutable signing identity of a node.
///
/// Created once from a seed; the same seed always yields the same identity.
/// Share it behind an `Arc`: signing only needs `&self`.
pub struct NodeIdentity {
    sign_key: SigningKey,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Derive an identity from a 32-byte master seed.
    ///
    /// The signing key is `SHA-256(seed || "hypha.p2p")`.
    pub fn derive(seed: &[u8]) -> Result<Self, IdentityError> {
        let seed: &[u8; SEED_LEN] = seed
            .try_into()
            .map_err(|_| IdentityError::InvalidSeedLength { got: seed.len() })?;
        Ok(Self::from_seed(seed))
    }

    /// Derive an identity from an arbitrary passphrase (seed = SHA-256 of its UTF-8 bytes).
    pub fn from_phrase(phrase: &str) -> Self {
        let seed = Zeroizing::new(sha256(phrase.as_bytes()));
        Self::from_seed(&seed)
    }

    /// Derive an identity from a 64-character hex seed.
    pub fn from_hex(seed_hex: &str) -> Result<Self, IdentityError> {
        let seed = Zeroizing::new(
            hex::decode(seed_hex.trim()).map_err(|_| IdentityError::InvalidHex)?,
        );
        Self::derive(&seed)
    }

    /// Generate an identity from a fresh random seed.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        getrandom::getrandom(seed.as_mut()).map_err(|_| IdentityError::Entropy)?;
        Ok(Self::from_seed(&seed))
    }

    fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        let secret = Zeroizing::new(sha256_concat(&[seed, P2P_DOMAIN]));
        let sign_key = SigningKey::from_bytes(&secret);
        let node_id = NodeId(sign_key.verifying_key().to_bytes());
        Self { sign_key, node_id }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Get the Ed25519 public key bytes.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.node_id.0
    }

    /// Sign a message using Ed25519.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("sign_key", &"<redacted>")
            .finish()
    }
}

/// Verify an Ed25519 signature.
///
/// # Arguments
/// * `pub_key` - The signer's Ed25519 public key (32 bytes)
/// * `message` - The message that was signed
/// * `signature` - The 64-byte Ed25519 signature
pub fn verify_signature(
    pub_key: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pub_key).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}
