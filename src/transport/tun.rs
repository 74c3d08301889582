//! In-memory virtual interface.
//!
//! [`MemoryInterface`] implements [`VirtualInterface`] over two packet
//! queues. The paired [`InterfaceHandle`] plays the role of the host
//! network stack: it injects packets the tunnel should carry and collects
//! packets the tunnel delivers. The outbound queue is bounded so a slow
//! consumer exerts backpressure on the session.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::VirtualInterface;

/// Default number of delivered packets held before the interface blocks.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
struct Shared {
    /// Host to tunnel.
    inbound: Mutex<VecDeque<Vec<u8>>>,
    /// Tunnel to host.
    outbound: Mutex<VecDeque<Vec<u8>>>,
    depth: usize,
    inbound_ready: Notify,
    outbound_ready: Notify,
    space_ready: Notify,
}

/// Tunnel side of an in-memory interface.
#[derive(Debug)]
pub struct MemoryInterface {
    name: String,
    shared: Arc<Shared>,
}

/// Host side of an in-memory interface.
#[derive(Debug, Clone)]
pub struct InterfaceHandle {
    shared: Arc<Shared>,
}

impl MemoryInterface {
    /// Create an interface and its host handle.
    pub fn new(name: impl Into<String>) -> (Self, InterfaceHandle) {
        Self::with_depth(name, DEFAULT_QUEUE_DEPTH)
    }

    /// Create an interface whose delivery queue holds `depth` packets.
    pub fn with_depth(name: impl Into<String>, depth: usize) -> (Self, InterfaceHandle) {
        let shared = Arc::new(Shared {
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(VecDeque::new()),
            depth: depth.max(1),
            inbound_ready: Notify::new(),
            outbound_ready: Notify::new(),
            space_ready: Notify::new(),
        });
        let iface = Self {
            name: name.into(),
            shared: Arc::clone(&shared),
        };
        (iface, InterfaceHandle { shared })
    }
}

impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn readable(&self) -> io::Result<()> {
        loop {
            let queued = !self.shared.inbound.lock().is_empty();
            if queued {
                return Ok(());
            }
            self.shared.inbound_ready.notified().await;
        }
    }

    async fn writable(&self) -> io::Result<()> {
        loop {
            let has_space = self.shared.outbound.lock().len() < self.shared.depth;
            if has_space {
                return Ok(());
            }
            self.shared.space_ready.notified().await;
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .shared
            .inbound
            .lock()
            .pop_front()
            .ok_or(io::ErrorKind::WouldBlock)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(packet.len())
    }

    fn try_write(&mut self, packet: &[u8]) -> io::Result<usize> {
        {
            let mut outbound = self.shared.outbound.lock();
            if outbound.len() >= self.shared.depth {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            outbound.push_back(packet.to_vec());
        }
        self.shared.outbound_ready.notify_one();
        Ok(packet.len())
    }
}

impl InterfaceHandle {
    /// Queue a packet for the tunnel to carry.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) {
        self.shared.inbound.lock().push_back(packet.into());
        self.shared.inbound_ready.notify_one();
    }

    /// Take a delivered packet if one is queued.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        let packet = self.shared.outbound.lock().pop_front();
        if packet.is_some() {
            self.shared.space_ready.notify_one();
        }
        packet
    }

    /// Wait for the next delivered packet.
    pub async fn recv(&self) -> Vec<u8> {
        loop {
            if let Some(packet) = self.try_recv() {
                return packet;
            }
            self.shared.outbound_ready.notified().await;
        }
    }

    /// Packets injected but not yet read by the tunnel.
    pub fn pending_inbound(&self) -> usize {
        self.shared.inbound.lock().len()
    }

    /// Packets delivered but not yet collected.
    pub fn pending_outbound(&self) -> usize {
        self.shared.outbound.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_then_read() {
        let (mut iface, handle) = MemoryInterface::new("tun0");
        handle.inject(b"ip packet".to_vec());

        iface.readable().await.unwrap();
        let mut buf = [0u8; 64];
        let n = iface.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ip packet");

        // Queue drained
        let err = iface.try_read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_oversized_read_reports_full_length() {
        let (mut iface, handle) = MemoryInterface::new("tun0");
        handle.inject(vec![7u8; 100]);

        let mut buf = [0u8; 10];
        assert_eq!(iface.try_read(&mut buf).unwrap(), 100);
        assert_eq!(buf, [7u8; 10]);
    }

    #[tokio::test]
    async fn test_write_then_recv() {
        let (mut iface, handle) = MemoryInterface::new("tun0");
        iface.writable().await.unwrap();
        iface.try_write(b"delivered").unwrap();

        assert_eq!(handle.recv().await, b"delivered");
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_bounded_queue_blocks_writes() {
        let (mut iface, handle) = MemoryInterface::with_depth("tun0", 1);
        iface.try_write(b"first").unwrap();

        let err = iface.try_write(b"second").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Consuming frees space and wakes the writer
        assert_eq!(handle.try_recv().unwrap(), b"first");
        iface.writable().await.unwrap();
        iface.try_write(b"second").unwrap();
        assert_eq!(handle.pending_outbound(), 1);
    }
}
