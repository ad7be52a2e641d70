//! Binary wire codec for the neural handshake protocol.
//!
//! Every message starts with `version:u8 = 1` and `type:u8`. All multi-byte
//! integers are big-endian.
//!
//! | Type          | Byte   | Payload                        | Total size   |
//! |---------------|--------|--------------------------------|--------------|
//! | Handshake     | `0x01` | `public_key[32] ‖ signature[64]` | 98 bytes   |
//! | Heartbeat     | `0x02` | `timestamp_ms: u64`            | 10 bytes     |
//! | ContextStream | `0x03` | `length: u32 ‖ payload[length]` | 6 + length  |
//!
//! Transports are byte streams, so a decoder routinely sees partial messages;
//! [`CodecError::Incomplete`] means "wait for more bytes", not "fail".

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hypha_crypto::identity::{PUBLIC_KEY_LEN, SIGNATURE_LEN};
use hypha_crypto::{verify_signature, IdentityError, NodeId, NodeIdentity};
use thiserror::Error;

/// The only protocol version this codec speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// `version ‖ type`
pub const HEADER_LEN: usize = 2;

/// Full size of an encoded handshake.
pub const HANDSHAKE_LEN: usize = HEADER_LEN + PUBLIC_KEY_LEN + SIGNATURE_LEN;

/// Full size of an encoded heartbeat.
pub const HEARTBEAT_LEN: usize = HEADER_LEN + 8;

/// Header of a context stream message, up to and including `length`.
pub const CONTEXT_HEADER_LEN: usize = HEADER_LEN + 4;

/// Default upper bound for an inbound context payload (16 MiB).
pub const DEFAULT_MAX_CONTEXT_LEN: usize = 16 * 1024 * 1024;

/// Framing error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("incomplete message: need {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("context payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Wire discriminant of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0x01,
    Heartbeat = 0x02,
    ContextStream = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Handshake),
            0x02 => Ok(MessageType::Heartbeat),
            0x03 => Ok(MessageType::ContextStream),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// Signed proof that the sender controls `public_key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl Handshake {
    /// Build the local node's handshake.
    pub fn new_signed(identity: &NodeIdentity) -> Self {
        let public_key = identity.public_key();
        let signature = identity.sign(&handshake_signing_bytes(&public_key));
        Self {
            public_key,
            signature,
        }
    }

    /// Verify the signature against the key carried in the same message.
    pub fn verify(&self) -> Result<(), IdentityError> {
        verify_signature(
            &self.public_key,
            &handshake_signing_bytes(&self.public_key),
            &self.signature,
        )
    }

    /// The identity this handshake claims. Unverified until [`Handshake::verify`] succeeds.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.public_key)
    }
}

/// Bytes covered by a handshake signature: `version ‖ type ‖ public_key`.
pub fn handshake_signing_bytes(
    public_key: &[u8; PUBLIC_KEY_LEN],
) -> [u8; HEADER_LEN + PUBLIC_KEY_LEN] {
    let mut out = [0u8; HEADER_LEN + PUBLIC_KEY_LEN];
    out[0] = PROTOCOL_VERSION;
    out[1] = MessageType::Handshake as u8;
    out[HEADER_LEN..].copy_from_slice(public_key);
    out
}

/// A protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    Heartbeat { timestamp_ms: u64 },
    /// `length` must equal `payload.len()`; use [`Message::context`] to build one.
    ContextStream { length: u32, payload: Bytes },
}

impl Message {
    /// Wrap an opaque payload in a context stream message.
    ///
    /// # Panics
    /// If the payload does not fit in a `u32` length field.
    pub fn context(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let length = u32::try_from(payload.len()).expect("context payload exceeds u32::MAX");
        Message::ContextStream { length, payload }
    }

    /// Heartbeat stamped with the current wall clock.
    pub fn heartbeat_now() -> Self {
        Message::Heartbeat {
            timestamp_ms: unix_millis(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::ContextStream { .. } => MessageType::ContextStream,
        }
    }

    /// Size of this message on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::Handshake(_) => HANDSHAKE_LEN,
            Message::Heartbeat { .. } => HEARTBEAT_LEN,
            Message::ContextStream { payload, .. } => CONTEXT_HEADER_LEN + payload.len(),
        }
    }
}

/// Encode a message into its exact wire layout.
///
/// # Panics
/// If a `ContextStream` declares a `length` different from its payload size.
pub fn encode(msg: &Message) -> Bytes {
    let mut out = BytesMut::with_capacity(msg.encoded_len());
    out.put_u8(PROTOCOL_VERSION);
    out.put_u8(msg.message_type() as u8);
    match msg {
        Message::Handshake(hs) => {
            out.put_slice(&hs.public_key);
            out.put_slice(&hs.signature);
        }
        Message::Heartbeat { timestamp_ms } => {
            out.put_u64(*timestamp_ms);
        }
        Message::ContextStream { length, payload } => {
            assert_eq!(
                *length as usize,
                payload.len(),
                "context stream length does not match payload"
            );
            out.put_u32(*length);
            out.put_slice(payload);
        }
    }
    out.freeze()
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and the number of bytes it occupied. The version byte
/// is checked before anything else, so a bad version is reported even when
/// the rest of the message has not arrived.
pub fn decode(buf: &[u8]) -> Result<(Message, usize), CodecError> {
    let msg_type = peek_header(buf)?;
    let body = &buf[HEADER_LEN..];

    match msg_type {
        MessageType::Handshake => {
            require(buf, HANDSHAKE_LEN)?;
            let mut public_key = [0u8; PUBLIC_KEY_LEN];
            let mut signature = [0u8; SIGNATURE_LEN];
            public_key.copy_from_slice(&body[..PUBLIC_KEY_LEN]);
            signature.copy_from_slice(&body[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + SIGNATURE_LEN]);
            Ok((
                Message::Handshake(Handshake {
                    public_key,
                    signature,
                }),
                HANDSHAKE_LEN,
            ))
        }
        MessageType::Heartbeat => {
            require(buf, HEARTBEAT_LEN)?;
            let mut body = body;
            let timestamp_ms = body.get_u64();
            Ok((Message::Heartbeat { timestamp_ms }, HEARTBEAT_LEN))
        }
        MessageType::ContextStream => {
            require(buf, CONTEXT_HEADER_LEN)?;
            let length = read_context_length(buf);
            let total = CONTEXT_HEADER_LEN + length as usize;
            require(buf, total)?;
            let payload = Bytes::copy_from_slice(&buf[CONTEXT_HEADER_LEN..total]);
            Ok((Message::ContextStream { length, payload }, total))
        }
    }
}

fn peek_header(buf: &[u8]) -> Result<MessageType, CodecError> {
    let version = *buf.first().ok_or(CodecError::Incomplete { needed: HEADER_LEN })?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let msg_type = *buf.get(1).ok_or(CodecError::Incomplete { needed: 1 })?;
    MessageType::try_from(msg_type)
}

fn require(buf: &[u8], total: usize) -> Result<(), CodecError> {
    if buf.len() < total {
        return Err(CodecError::Incomplete {
            needed: total - buf.len(),
        });
    }
    Ok(())
}

fn read_context_length(buf: &[u8]) -> u32 {
    let mut len_buf = &buf[HEADER_LEN..CONTEXT_HEADER_LEN];
    len_buf.get_u32()
}

/// Streaming decoder over a connection's read buffer.
///
/// Enforces an upper bound on context payloads as soon as the length field is
/// visible, so a hostile peer cannot make us buffer an oversized payload.
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    max_context_len: usize,
}

impl FrameDecoder {
    pub fn new(max_context_len: usize) -> Self {
        Self { max_context_len }
    }

    pub fn max_context_len(&self) -> usize {
        self.max_context_len
    }

    /// Returns `Some(message)` when a complete message is buffered, `None` if more
    /// data is needed. Consumed bytes are removed from `buf`.
    pub fn decode_stream(&self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let msg_type = match peek_header(buf) {
            Ok(t) => t,
            Err(CodecError::Incomplete { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        if msg_type == MessageType::ContextStream && buf.len() >= CONTEXT_HEADER_LEN {
            let len = read_context_length(buf) as usize;
            if len > self.max_context_len {
                return Err(CodecError::PayloadTooLarge {
                    len,
                    max: self.max_context_len,
                });
            }
        }

        match decode(buf) {
            Ok((msg, consumed)) => {
                buf.advance(consumed);
                Ok(Some(msg))
            }
            Err(CodecError::Incomplete { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTEXT_LEN)
    }
}

/// Milliseconds since the Unix epoch, as carried in heartbeats.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
