//! Transport layer: sizing, buffers, timers, shaping and the two I/O endpoints.
//!
//! - **Frame budget**: [`FrameBuilder`] / [`Frame`]
//! - **Packet buffers**: [`PacketBuffer`] with an (offset, length) window
//! - **Timers**: [`EventTimeout`] and the session's [`TimeoutSet`]
//! - **Traffic shaping**: [`TrafficShaper`]
//! - **Link socket**: [`TunnelSocket`] with [`PeerAddress`] tracking and a
//!   [`PathMtuHint`] input
//! - **Virtual interface**: [`MemoryInterface`] for tests and demos
//!
//! ```text
//! ┌──────────────┐   PacketBuffer   ┌──────────────┐
//! │  interface   │ ───────────────► │    socket    │
//! │ (tun / mem)  │ ◄─────────────── │    (UDP)     │
//! └──────────────┘                  └──────────────┘
//! ```

mod buffer;
mod frame;
mod shaper;
mod socket;
mod timing;
mod tun;

pub use buffer::PacketBuffer;
pub use frame::{Frame, FrameBuilder, Layer};
pub use shaper::{ShaperAction, TrafficShaper, datagram_overhead};
pub use socket::{PathMtuHint, PeerAddress, TunnelSocket};
pub use timing::{
    EventTimeout, PingAction, TimeoutSet, TimerEvent, constants as timing_constants,
};
pub use tun::{DEFAULT_QUEUE_DEPTH, InterfaceHandle, MemoryInterface};
