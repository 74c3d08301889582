//! Security layer
//!
//! Implements the data-channel cryptography:
//! - ChaCha20-Poly1305 / XChaCha20-Poly1305 AEAD
//! - Static-key and negotiated key derivation
//! - Packet ids and the anti-replay window
//! - Crypto contexts and key rotation
//! - Packet-id persistence across restarts

mod cipher;
mod context;
mod keys;
mod persist;
mod replay;

pub use cipher::*;
pub use context::*;
pub use keys::*;
pub use persist::*;
pub use replay::*;
