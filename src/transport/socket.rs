//! Async UDP socket wrapper for the tunnel link.
//!
//! Tracks the peer address: the configured remote (if any), the address
//! packets actually authenticate from, and whether the peer may float
//! to a new address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::UdpSocket;

/// Peer address state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerAddress {
    /// Configured remote.
    pub remote: Option<SocketAddr>,
    /// Address the peer was last authenticated from.
    pub actual: Option<SocketAddr>,
    /// Whether incoming packets may come from a different address.
    pub float: bool,
}

impl PeerAddress {
    /// Create peer state from configuration.
    pub fn new(remote: Option<SocketAddr>, float: bool) -> Self {
        Self {
            remote,
            actual: None,
            float,
        }
    }

    /// Whether a datagram from `from` should be processed at all.
    pub fn accepts(&self, from: SocketAddr) -> bool {
        match self.remote {
            Some(remote) if !self.float => from == remote,
            _ => true,
        }
    }

    /// Record the address of an authenticated packet.
    ///
    /// Returns true if the outgoing address changed.
    pub fn learn(&mut self, from: SocketAddr) -> bool {
        if !self.accepts(from) || self.actual == Some(from) {
            return false;
        }
        self.actual = Some(from);
        true
    }

    /// Where outgoing datagrams go.
    pub fn outgoing(&self) -> Option<SocketAddr> {
        self.actual.or(self.remote)
    }
}

/// Externally discovered link MTU towards the peer.
///
/// Cloned handles share one slot; the session consumes the latest report
/// at its next iteration.
#[derive(Debug, Clone, Default)]
pub struct PathMtuHint(Arc<AtomicUsize>);

impl PathMtuHint {
    /// Report the largest datagram the path carries.
    pub fn report(&self, link_mtu: usize) {
        self.0.store(link_mtu, Ordering::Release);
    }

    /// Take the pending report, if any.
    pub fn take(&self) -> Option<usize> {
        match self.0.swap(0, Ordering::AcqRel) {
            0 => None,
            mtu => Some(mtu),
        }
    }
}

/// Async UDP socket for the tunnel link.
#[derive(Debug)]
pub struct TunnelSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Peer addressing.
    peer: PeerAddress,
    /// Path MTU hint not yet consumed by fragmentation housekeeping.
    path_mtu: PathMtuHint,
}

impl TunnelSocket {
    /// Bind a socket for the given peer configuration.
    pub async fn bind(local: SocketAddr, peer: PeerAddress) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::from_socket(socket, peer))
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket, peer: PeerAddress) -> Self {
        Self::from_shared(Arc::new(socket), peer)
    }

    /// Reuse a socket kept from a previous session.
    pub fn from_shared(socket: Arc<UdpSocket>, peer: PeerAddress) -> Self {
        Self {
            socket,
            peer,
            path_mtu: PathMtuHint::default(),
        }
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Peer addressing state.
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Peer addressing state, mutably.
    pub fn peer_mut(&mut self) -> &mut PeerAddress {
        &mut self.peer
    }

    /// Wait until a datagram can be received.
    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }

    /// Wait until a datagram can be sent.
    pub async fn writable(&self) -> io::Result<()> {
        self.socket.writable().await
    }

    /// Try to receive a datagram without blocking.
    ///
    /// Returns `Ok(None)` if no data is available.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Try to send a datagram without blocking.
    ///
    /// Returns `Ok(None)` if the socket is not ready.
    pub fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<Option<usize>> {
        match self.socket.try_send_to(data, addr) {
            Ok(len) => Ok(Some(len)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Handle through which path MTU discoveries reach this socket.
    pub fn path_mtu_hint(&self) -> PathMtuHint {
        self.path_mtu.clone()
    }

    /// Take the pending path MTU hint, if any.
    pub fn take_path_mtu(&self) -> Option<usize> {
        self.path_mtu.take()
    }

    /// Get a clone of the Arc-wrapped socket.
    pub fn socket_arc(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_peer_filter_without_float() {
        let peer = PeerAddress::new(Some(addr("10.0.0.1:1194")), false);
        assert!(peer.accepts(addr("10.0.0.1:1194")));
        assert!(!peer.accepts(addr("10.0.0.2:1194")));
        assert!(!peer.accepts(addr("10.0.0.1:1195")));
    }

    #[test]
    fn test_peer_float_accepts_any() {
        let mut peer = PeerAddress::new(Some(addr("10.0.0.1:1194")), true);
        assert!(peer.accepts(addr("10.0.0.9:4000")));
        assert!(peer.learn(addr("10.0.0.9:4000")));
        assert_eq!(peer.outgoing(), Some(addr("10.0.0.9:4000")));
    }

    #[test]
    fn test_peer_learned_without_remote() {
        let mut peer = PeerAddress::new(None, false);
        assert_eq!(peer.outgoing(), None);
        assert_eq!(peer.actual, None);

        assert!(peer.learn(addr("192.168.1.5:5000")));
        // Same address again is not a change
        assert!(!peer.learn(addr("192.168.1.5:5000")));
        assert_eq!(peer.actual, Some(addr("192.168.1.5:5000")));
    }

    #[tokio::test]
    async fn test_socket_send_recv() {
        let server = TunnelSocket::bind(addr("127.0.0.1:0"), PeerAddress::default())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = TunnelSocket::bind(addr("127.0.0.1:0"), PeerAddress::new(Some(server_addr), false))
            .await
            .unwrap();

        client.writable().await.unwrap();
        let data = b"hello tunnel";
        let sent = client.try_send_to(data, server_addr).unwrap();
        assert_eq!(sent, Some(data.len()));

        let mut buf = [0u8; 64];
        let received = loop {
            server.readable().await.unwrap();
            if let Some(r) = server.try_recv_from(&mut buf).unwrap() {
                break r;
            }
        };
        assert_eq!(&buf[..received.0], data);
        assert_eq!(received.1, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let socket = TunnelSocket::bind(addr("127.0.0.1:0"), PeerAddress::default())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_mtu_hint_taken_once() {
        let socket = TunnelSocket::bind(addr("127.0.0.1:0"), PeerAddress::default())
            .await
            .unwrap();
        socket.path_mtu_hint().report(1280);
        assert_eq!(socket.take_path_mtu(), Some(1280));
        assert_eq!(socket.take_path_mtu(), None);
    }
}
