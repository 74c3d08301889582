//! Session layer: configuration, the event loop and the restart driver.
//!
//! ```text
//! Tunnel::run
//!   └─ loop
//!        ├─ Session::start(config, interface, carryover)
//!        ├─ Session::run(signals)  ──► SessionExit { reason, interface, carry }
//!        └─ restart? reload config on hangup, keep state per persist flags
//! ```

mod config;
mod event_loop;
mod signal;
mod stats;
mod tunnel;

pub use config::{
    CompressionMode, CryptoConfig, DEFAULT_PORT, DEFAULT_ZSTD_LEVEL, PersistFlags, SessionConfig,
    SessionConfigBuilder,
};
pub use event_loop::{Carryover, ExitReason, Session, SessionExit};
pub use signal::{SignalHandle, SignalKind, SignalReceiver, forward_os_signals, signal_channel};
pub use stats::SessionStats;
pub use tunnel::Tunnel;
