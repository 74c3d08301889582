//! Wire and timing constants for the tunnel engine.
//!
//! Wire values are shared with the peer and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// ChaCha20-Poly1305 nonce size.
pub const CHACHA_NONCE_SIZE: usize = 12;

/// XChaCha20-Poly1305 nonce size (carried explicitly on the wire).
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Implicit per-direction nonce salt for the short packet-id mode.
pub const NONCE_SALT_SIZE: usize = 8;

/// Data-channel cipher key size.
pub const CIPHER_KEY_SIZE: usize = 32;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Pre-shared static key size.
pub const STATIC_KEY_SIZE: usize = 64;

/// Control-channel session id size.
pub const SESSION_ID_SIZE: usize = 8;

/// BLAKE2s MAC size on control packets.
pub const CONTROL_MAC_SIZE: usize = 32;

/// Replay stamp on control packets: 4-byte epoch then 4-byte packet id.
pub const CONTROL_STAMP_SIZE: usize = 8;

/// Replay window for control packets.
pub const CONTROL_REPLAY_WINDOW: usize = 64;

// =============================================================================
// OPCODES
// =============================================================================

/// Number of low bits of the discriminator byte carrying the key id.
pub const KEY_ID_BITS: u8 = 3;

/// Mask extracting the key id.
pub const KEY_ID_MASK: u8 = (1 << KEY_ID_BITS) - 1;

/// Initial key negotiation from the client.
pub const OP_HARD_RESET_CLIENT: u8 = 1;

/// Initial or renegotiated key reply from the server.
pub const OP_HARD_RESET_SERVER: u8 = 2;

/// Key renegotiation from the client.
pub const OP_SOFT_RESET: u8 = 3;

/// Acknowledgement of a server reply.
pub const OP_ACK: u8 = 5;

/// Data-channel packet.
pub const OP_DATA: u8 = 6;

// =============================================================================
// PAYLOAD PATTERNS
// =============================================================================

/// Keepalive payload. Recognized after decryption and never delivered.
pub const KEEPALIVE_PATTERN: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
    0x48,
];

// =============================================================================
// FRAME DEFAULTS
// =============================================================================

/// Interface MTU used when neither MTU is configured.
pub const DEFAULT_TUN_MTU: usize = 1500;

/// Extra bytes an interface read may exceed the interface MTU by.
pub const DEFAULT_TUN_MTU_EXTRA: usize = 0;

/// Replay window size in packet ids.
pub const DEFAULT_REPLAY_WINDOW: usize = 64;

// =============================================================================
// TIMING
// =============================================================================

/// Flush interval for the persisted packet-id record.
pub const PACKET_ID_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Lifetime of an incomplete fragment reassembly.
pub const FRAGMENT_TTL: Duration = Duration::from_secs(10);

/// Fragment housekeeping period.
pub const FRAGMENT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// IPv4 plus UDP header bytes charged to the shaper per datagram.
pub const UDP_IPV4_OVERHEAD: usize = 28;

/// IPv6 plus UDP header bytes charged to the shaper per datagram.
pub const UDP_IPV6_OVERHEAD: usize = 48;

/// Shaper delays shorter than this are treated as "send now".
pub const SHAPER_GRANULARITY: Duration = Duration::from_millis(1);

/// Lowest accepted shaper rate in bytes per second.
pub const SHAPER_MIN_RATE: u32 = 100;

/// Highest accepted shaper rate in bytes per second.
pub const SHAPER_MAX_RATE: u32 = 100_000_000;

/// Control scheduler: keep polling every iteration this long after activity.
pub const CONTROL_HORIZON: Duration = Duration::from_secs(2);

/// Control scheduler: poll at least this often when idle.
pub const CONTROL_REFRESH: Duration = Duration::from_secs(15);

/// Default control packet retransmission interval.
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time allowed for a key negotiation.
pub const DEFAULT_HANDSHAKE_WINDOW: Duration = Duration::from_secs(60);

/// Default renegotiation period.
pub const DEFAULT_RENEGOTIATE: Duration = Duration::from_secs(3600);

/// Default time a retired key stays valid for decryption.
pub const DEFAULT_TRANSITION_WINDOW: Duration = Duration::from_secs(60);
