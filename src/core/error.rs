//! Error types for the tunnel engine.
//!
//! Per-packet failures (authentication, replay, malformed fragments) are
//! surfaced by the pipeline as drops, not as `TunnelError`. Everything here
//! that reaches the event loop's caller ends the session.

use thiserror::Error;

/// Errors computing the frame budget.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Both interface and link MTU were configured.
    #[error("interface MTU and link MTU cannot both be set")]
    AmbiguousMtu,

    /// Layer overhead consumes the whole MTU.
    #[error("no room for payload: mtu {mtu}, overhead {overhead}")]
    NoPayload {
        /// Configured MTU.
        mtu: usize,
        /// Sum of layer overhead.
        overhead: usize,
    },

    /// A layer registered out of order or twice.
    #[error("layer {0} registered out of order")]
    LayerOrder(&'static str),
}

/// Errors manipulating a packet buffer window.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Not enough room in front of the content.
    #[error("insufficient headroom: need {needed}, have {available}")]
    Headroom {
        /// Bytes requested.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Not enough room behind the content.
    #[error("insufficient tailroom: need {needed}, have {available}")]
    Tailroom {
        /// Bytes requested.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Tried to consume more than the content holds.
    #[error("content underflow: need {needed}, have {available}")]
    Underflow {
        /// Bytes requested.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
}

/// Errors in the data-channel crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// Authentication tag did not verify.
    #[error("packet authentication failed")]
    AuthenticationFailed,

    /// Packet too short to carry the crypto header and tag.
    #[error("packet too short for crypto framing: {0} bytes")]
    Truncated(usize),

    /// Packet id already seen or below the window.
    #[error("replay detected: packet id {0}")]
    Replay(u64),

    /// Send-side packet id space exhausted; the session must end.
    #[error("packet id space exhausted")]
    PacketIdExhausted,

    /// No context holds the key id on the packet.
    #[error("unknown key id {0}")]
    UnknownKeyId(u8),

    /// No key has been negotiated yet.
    #[error("no data-channel key available")]
    NoKey,

    /// HKDF expansion failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Key material has the wrong shape.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Buffer window violation while framing.
    #[error("buffer: {0}")]
    Buffer(#[from] BufferError),
}

/// Errors in the control channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Control packet could not be parsed.
    #[error("malformed control packet: {0}")]
    Malformed(&'static str),

    /// Control packet MAC did not verify.
    #[error("control packet authentication failed")]
    BadMac,

    /// Control packet was already accepted or predates the peer's epoch.
    #[error("stale control packet (epoch {epoch}, id {packet_id})")]
    Replay {
        /// Sender's epoch.
        epoch: u32,
        /// Packet id within the epoch.
        packet_id: u32,
    },

    /// Key negotiation did not finish in time.
    #[error("key negotiation did not complete within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// The concurrent control task stopped answering.
    #[error("control channel task is not responding")]
    WorkerGone,

    /// Key derivation or context construction failed.
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors reading or writing the packet-id record.
#[derive(Debug, Error)]
pub enum PersistError {
    /// File I/O failed.
    #[error("packet-id file i/o: {0}")]
    Io(#[from] std::io::Error),

    /// File contents could not be decoded.
    #[error("packet-id file is corrupt: {0}")]
    Decode(String),
}

/// Configuration validation errors. Fatal before any socket is opened.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Frame budget could not be computed.
    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    /// A field has an out-of-range or inconsistent value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A feature was requested that this build does not include.
    #[error("{0} support is not compiled in")]
    Unsupported(&'static str),

    /// Key material in the configuration is unusable.
    #[error("key material: {0}")]
    Key(#[from] CryptoError),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level session errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Frame budget error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Crypto error that is fatal for the session.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Control channel could not be set up.
    #[error("control channel error: {0}")]
    Control(#[from] ControlError),

    /// Packet-id persistence error.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Buffer window violation.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Send-side packet id exhausted.
    #[error("packet id exhausted - session must restart with fresh keys")]
    PacketIdExhausted,

    /// Packet exceeds the frame maximum after all transforms.
    #[error("oversized packet: {len} bytes exceeds maximum {max}")]
    Oversized {
        /// Packet length.
        len: usize,
        /// Frame maximum.
        max: usize,
    },

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for session-level operations.
pub type TunnelResult<T> = Result<T, TunnelError>;
