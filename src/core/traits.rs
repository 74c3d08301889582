//! Capability traits consumed by the session engine.
//!
//! The engine never creates OS devices itself. Whatever owns the virtual
//! interface hands it over through [`VirtualInterface`].

use std::future::Future;
use std::io;

/// A packet-oriented virtual network interface.
///
/// Readiness is level-triggered: `readable` resolves while at least one
/// packet is queued, `writable` while a write would not block. The `try_*`
/// methods never wait and report [`io::ErrorKind::WouldBlock`] instead, so
/// a spurious wakeup is harmless.
///
/// # Example
///
/// ```ignore
/// loop {
///     iface.readable().await?;
///     match iface.try_read(&mut buf) {
///         Ok(n) => handle(&buf[..n]),
///         Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
///         Err(e) => return Err(e),
///     }
/// }
/// ```
pub trait VirtualInterface: Send {
    /// Interface name, for logging.
    fn name(&self) -> &str;

    /// Wait until a packet can be read.
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait until a packet can be written.
    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Read one packet into `buf`, returning its length.
    ///
    /// A packet longer than `buf` is truncated to `buf.len()` and the full
    /// length is still returned, so callers can detect oversize reads.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet, returning the number of bytes accepted.
    fn try_write(&mut self, packet: &[u8]) -> io::Result<usize>;
}
