//! # Tunnel Engine
//!
//! A point-to-point secure tunnel. One task multiplexes a virtual network
//! interface and a UDP socket, moving packets through an ordered pipeline:
//!
//! - **Compression**: optional zstd framing, used only when it helps
//! - **Fragmentation**: splits packets that exceed the link budget
//! - **Encryption**: ChaCha20-Poly1305 or XChaCha20-Poly1305 with replay protection
//! - **Key negotiation**: X25519 exchange on a control channel sharing the socket
//! - **Liveness**: keepalives, inactivity and keepalive-receive timers
//! - **Shaping**: byte-rate limit on socket writes
//!
//! ## Feature Flags
//!
//! - `compression` (default): zstd compression layer
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and the [`VirtualInterface`](core::VirtualInterface) trait
//! - [`transport`]: frame budget, packet buffers, timers, shaper, socket and interfaces
//! - [`crypto`]: ciphers, keys, replay guard, key ring and packet-id persistence
//! - [`extensions`]: compression and fragmentation
//! - [`control`]: control-channel key negotiation
//! - [`pipeline`]: the packet transform chain
//! - [`session`]: configuration, event loop and restart driver
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tunnel_engine::prelude::*;
//!
//! # async fn run() -> Result<(), TunnelError> {
//! let key = StaticKey::generate();
//! let config = SessionConfig::builder()
//!     .remote("203.0.113.7:1194".parse().unwrap())
//!     .static_key(&key, KeyDirection::Normal)
//!     .ping(Duration::from_secs(10))
//!     .ping_restart(Duration::from_secs(60))
//!     .build()?;
//!
//! let (signals, rx) = signal_channel();
//! forward_os_signals(signals)?;
//!
//! let mut tunnel = Tunnel::new(config, rx, |_| Ok(MemoryInterface::new("tun0").0));
//! let _reason = tunnel.run().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod control;
pub mod core;
pub mod crypto;
pub mod extensions;
pub mod pipeline;
pub mod session;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        ConfigError, ControlError, CryptoError, FrameError, TunnelError, TunnelResult,
        VirtualInterface,
    };

    pub use crate::control::Role;
    pub use crate::crypto::{CipherKind, KeyDirection, StaticKey, StaticKeypair};
    pub use crate::pipeline::{DataCrypto, DropReason, InboundOutcome, PacketPipeline};
    pub use crate::session::{
        CompressionMode, CryptoConfig, ExitReason, PersistFlags, Session, SessionConfig,
        SessionConfigBuilder, SessionExit, SessionStats, SignalHandle, SignalKind, Tunnel,
        forward_os_signals, signal_channel,
    };
    pub use crate::transport::{
        Frame, FrameBuilder, InterfaceHandle, MemoryInterface, PacketBuffer, PathMtuHint,
    };
}

pub use core::{TunnelError, TunnelResult, VirtualInterface};
pub use session::{ExitReason, Session, SessionConfig, Tunnel};
