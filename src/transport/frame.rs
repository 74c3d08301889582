//! Frame budget: per-layer overhead and the resulting maximum sizes.
//!
//! Every transform layer registers the extra bytes it adds to a packet,
//! in outbound order (compression, then fragmentation, then encryption).
//! [`FrameBuilder::finalize`] turns the registrations into an immutable
//! [`Frame`] from which all buffers are sized.
//!
//! ```text
//! link_mtu = tun_mtu + compression + fragmentation + encryption
//! ```

use std::fmt;

use crate::core::{DEFAULT_TUN_MTU, FrameError};

use super::buffer::PacketBuffer;

/// A transform layer that adds bytes to each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    /// Compression framing byte.
    Compression,
    /// Fragment header.
    Fragmentation,
    /// Opcode, packet id, explicit IV and tag.
    Encryption,
}

impl Layer {
    fn name(self) -> &'static str {
        match self {
            Self::Compression => "compression",
            Self::Fragmentation => "fragmentation",
            Self::Encryption => "encryption",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Collects layer overhead before the frame is fixed.
#[derive(Debug, Clone, Default)]
pub struct FrameBuilder {
    tun_mtu: Option<usize>,
    link_mtu: Option<usize>,
    tun_mtu_extra: usize,
    extra: [Option<usize>; 3],
}

impl FrameBuilder {
    /// Create a builder with no MTU configured and no layers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the interface MTU.
    pub fn tun_mtu(mut self, mtu: Option<usize>) -> Self {
        self.tun_mtu = mtu;
        self
    }

    /// Configure the link (datagram) MTU.
    pub fn link_mtu(mut self, mtu: Option<usize>) -> Self {
        self.link_mtu = mtu;
        self
    }

    /// Bytes an interface read may exceed the interface MTU by.
    pub fn tun_mtu_extra(mut self, extra: usize) -> Self {
        self.tun_mtu_extra = extra;
        self
    }

    /// Register the extra headroom a layer needs.
    ///
    /// Layers must register in outbound order and at most once.
    pub fn register(&mut self, layer: Layer, extra: usize) -> Result<(), FrameError> {
        let later_registered = self.extra[layer.index()..].iter().any(Option::is_some);
        if later_registered {
            return Err(FrameError::LayerOrder(layer.name()));
        }
        self.extra[layer.index()] = Some(extra);
        Ok(())
    }

    /// Fix the frame.
    ///
    /// # Errors
    /// - [`FrameError::AmbiguousMtu`] if both MTUs were set.
    /// - [`FrameError::NoPayload`] if overhead leaves no payload room.
    pub fn finalize(self) -> Result<Frame, FrameError> {
        let [compression, fragmentation, encryption] = self.extra.map(|e| e.unwrap_or(0));
        let overhead = compression + fragmentation + encryption;

        let (tun_mtu, link_mtu) = match (self.tun_mtu, self.link_mtu) {
            (Some(_), Some(_)) => return Err(FrameError::AmbiguousMtu),
            (None, Some(link)) => {
                if link <= overhead {
                    return Err(FrameError::NoPayload {
                        mtu: link,
                        overhead,
                    });
                }
                (link - overhead, link)
            }
            (tun, None) => {
                let tun = tun.unwrap_or(DEFAULT_TUN_MTU);
                if tun == 0 {
                    return Err(FrameError::NoPayload { mtu: 0, overhead });
                }
                (tun, tun + overhead)
            }
        };

        Ok(Frame {
            tun_mtu,
            link_mtu,
            tun_mtu_extra: self.tun_mtu_extra,
            compression,
            fragmentation,
            encryption,
        })
    }
}

/// Immutable sizing budget for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    tun_mtu: usize,
    link_mtu: usize,
    tun_mtu_extra: usize,
    compression: usize,
    fragmentation: usize,
    encryption: usize,
}

impl Frame {
    /// Maximum payload on the interface side.
    pub fn tun_mtu(&self) -> usize {
        self.tun_mtu
    }

    /// Maximum datagram on the socket side.
    pub fn link_mtu(&self) -> usize {
        self.link_mtu
    }

    /// Slack allowed above the interface MTU on reads.
    pub fn tun_mtu_extra(&self) -> usize {
        self.tun_mtu_extra
    }

    /// Total per-packet overhead of all layers.
    pub fn overhead(&self) -> usize {
        self.compression + self.fragmentation + self.encryption
    }

    /// Overhead registered by one layer.
    pub fn layer_overhead(&self, layer: Layer) -> usize {
        match layer {
            Layer::Compression => self.compression,
            Layer::Fragmentation => self.fragmentation,
            Layer::Encryption => self.encryption,
        }
    }

    /// Headroom reserved in front of outbound content.
    pub fn headroom(&self) -> usize {
        self.overhead()
    }

    /// Largest packet accepted from the interface.
    pub fn max_tun_read(&self) -> usize {
        self.tun_mtu + self.tun_mtu_extra
    }

    /// Largest datagram accepted from or written to the socket.
    pub fn max_link_size(&self) -> usize {
        self.link_mtu + self.tun_mtu_extra
    }

    /// Capacity of every packet buffer.
    pub fn buffer_size(&self) -> usize {
        self.headroom() + self.max_link_size()
    }

    /// Allocate a buffer with outbound headroom reserved.
    pub fn alloc_buffer(&self) -> PacketBuffer {
        PacketBuffer::new(self.buffer_size(), self.headroom())
    }
}
