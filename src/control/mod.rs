//! Control channel
//!
//! Key negotiation multiplexed with data on the tunnel socket. The first
//! byte of every datagram tells the two apart (see [`Discriminator`]).
//!
//! - [`ControlChannel`]: I/O-free negotiation state machine
//! - [`ControlInterval`]: adaptive schedule for running it cooperatively
//! - [`ControlWorker`]: runs it on its own task instead

mod channel;
mod handshake;
mod interval;
mod opcode;
mod worker;

pub use channel::{ControlChannel, ControlEvent, ControlSettings, Role};
pub use handshake::{ControlMessage, ControlStamp};
pub use interval::ControlInterval;
pub use opcode::{Discriminator, Opcode};
pub use worker::{ControlOutput, ControlWorker};
