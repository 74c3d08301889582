//! Packet pipeline
//!
//! Ordered transforms between the interface and the socket:
//!
//! ```text
//! outbound: interface ─► compress ─► fragment ─► seal ─► [opcode] ─► socket
//! inbound:  socket ─► [opcode] ─┬─► open ─► reassemble ─► decompress ─► interface
//!                               └─► control channel
//! ```
//!
//! Inbound failures never surface as errors: the buffer is emptied and the
//! outcome names the [`DropReason`]. Outbound failures that indicate a
//! configuration mismatch (oversized packets, packet-id exhaustion) are
//! returned as [`TunnelError`].

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::control::Discriminator;
use crate::core::{CryptoError, KEEPALIVE_PATTERN, TunnelError};
#[cfg(feature = "compression")]
use crate::extensions::{COMPRESSION_OVERHEAD, CompressionConfig, CompressionStats, Compressor};
use crate::extensions::{FRAGMENT_HEADER_SIZE, Fragmenter};
use crate::crypto::SharedKeyRing;
use crate::transport::{Frame, PacketBuffer};

/// How data packets are protected.
#[derive(Debug, Clone)]
pub enum DataCrypto {
    /// No encryption; every packet is accepted.
    Cleartext,
    /// Pre-shared key, single context, no discriminator byte.
    Static(SharedKeyRing),
    /// Keys negotiated on the control channel; datagrams carry a discriminator.
    Negotiated(SharedKeyRing),
}

impl DataCrypto {
    /// Key ring in use, if any.
    pub fn key_ring(&self) -> Option<&SharedKeyRing> {
        match self {
            Self::Cleartext => None,
            Self::Static(ring) | Self::Negotiated(ring) => Some(ring),
        }
    }

    /// Whether datagrams start with a discriminator byte.
    pub fn has_discriminator(&self) -> bool {
        matches!(self, Self::Negotiated(_))
    }
}

/// Why an inbound packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Too short to parse.
    Truncated,
    /// Unknown discriminator byte.
    UnknownOpcode,
    /// No context for the key id.
    UnknownKey,
    /// Tag did not verify.
    Authentication,
    /// Packet id already seen or below the window.
    Replay,
    /// Bad fragment header or reassembly overflow.
    Fragment,
    /// Decompression failed.
    Decompress,
    /// Larger than the interface accepts.
    Oversized,
    /// Sender is not the configured peer.
    WrongPeer,
}

/// Per-reason drop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    /// See [`DropReason::Truncated`].
    pub truncated: u64,
    /// See [`DropReason::UnknownOpcode`].
    pub unknown_opcode: u64,
    /// See [`DropReason::UnknownKey`].
    pub unknown_key: u64,
    /// See [`DropReason::Authentication`].
    pub authentication: u64,
    /// See [`DropReason::Replay`].
    pub replay: u64,
    /// See [`DropReason::Fragment`].
    pub fragment: u64,
    /// See [`DropReason::Decompress`].
    pub decompress: u64,
    /// See [`DropReason::Oversized`].
    pub oversized: u64,
    /// See [`DropReason::WrongPeer`].
    pub wrong_peer: u64,
    /// Outbound packets dropped for lack of a key.
    pub no_key: u64,
}

impl DropCounters {
    /// Count one inbound drop.
    pub fn record(&mut self, reason: DropReason) {
        let slot = match reason {
            DropReason::Truncated => &mut self.truncated,
            DropReason::UnknownOpcode => &mut self.unknown_opcode,
            DropReason::UnknownKey => &mut self.unknown_key,
            DropReason::Authentication => &mut self.authentication,
            DropReason::Replay => &mut self.replay,
            DropReason::Fragment => &mut self.fragment,
            DropReason::Decompress => &mut self.decompress,
            DropReason::Oversized => &mut self.oversized,
            DropReason::WrongPeer => &mut self.wrong_peer,
        };
        *slot += 1;
    }

    /// Inbound drops of every reason.
    pub fn total(&self) -> u64 {
        self.truncated
            + self.unknown_opcode
            + self.unknown_key
            + self.authentication
            + self.replay
            + self.fragment
            + self.decompress
            + self.oversized
            + self.wrong_peer
    }
}

/// Result of running a datagram through the inbound pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// The buffer holds a packet for the interface.
    Deliver,
    /// An authenticated keepalive; nothing to deliver.
    Keepalive,
    /// An authenticated fragment held for reassembly.
    Pending,
    /// A control-channel datagram, left untouched in the buffer.
    Control,
    /// Dropped; the buffer is empty.
    Dropped(DropReason),
}

impl InboundOutcome {
    /// Whether the packet passed authentication.
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Deliver | Self::Keepalive | Self::Pending)
    }
}

/// The per-session transform chain.
#[derive(Debug)]
pub struct PacketPipeline {
    frame: Frame,
    crypto: DataCrypto,
    #[cfg(feature = "compression")]
    compressor: Option<Compressor>,
    fragmenter: Option<Fragmenter>,
    drops: DropCounters,
}

impl PacketPipeline {
    /// Pipeline with encryption only.
    pub fn new(frame: Frame, crypto: DataCrypto) -> Self {
        Self {
            frame,
            crypto,
            #[cfg(feature = "compression")]
            compressor: None,
            fragmenter: None,
            drops: DropCounters::default(),
        }
    }

    /// Enable the compression layer.
    #[cfg(feature = "compression")]
    pub fn with_compression(mut self, level: i32) -> Self {
        self.compressor = Some(Compressor::with_config(CompressionConfig {
            level,
            max_decompressed_size: self.frame.max_tun_read(),
            ..Default::default()
        }));
        self
    }

    /// Enable fragmentation with `frag_size` payload bytes per fragment.
    pub fn with_fragmentation(mut self, frag_size: usize, now: Instant) -> Self {
        let max_packet = self.frame.max_tun_read() + self.compression_overhead();
        self.fragmenter = Some(Fragmenter::new(frag_size, max_packet, now));
        self
    }

    fn compression_overhead(&self) -> usize {
        #[cfg(feature = "compression")]
        if self.compressor.is_some() {
            return COMPRESSION_OVERHEAD;
        }
        0
    }

    /// Sizing budget.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Data protection mode.
    pub fn crypto(&self) -> &DataCrypto {
        &self.crypto
    }

    /// Drop counters.
    pub fn drops(&self) -> &DropCounters {
        &self.drops
    }

    /// Compression totals, when the layer is enabled.
    #[cfg(feature = "compression")]
    pub fn compression_stats(&self) -> Option<CompressionStats> {
        self.compressor.as_ref().map(|c| *c.stats())
    }

    /// Fragmentation engine, when enabled.
    pub fn fragmenter(&self) -> Option<&Fragmenter> {
        self.fragmenter.as_ref()
    }

    /// Whether queued fragments wait to be sent.
    pub fn has_pending_fragments(&self) -> bool {
        self.fragmenter.as_ref().is_some_and(Fragmenter::has_pending)
    }

    /// Transform an interface packet into a datagram.
    ///
    /// Returns `false` when the packet was dropped (no key yet).
    pub fn outbound(&mut self, buf: &mut PacketBuffer) -> Result<bool, TunnelError> {
        let max = self.frame.max_tun_read();
        if buf.len() > max {
            return Err(TunnelError::Oversized { len: buf.len(), max });
        }

        #[cfg(feature = "compression")]
        if let Some(compressor) = &mut self.compressor {
            if let Err(e) = compressor.compress(buf) {
                debug!(error = %e, "compression failed, dropping packet");
                buf.discard();
                return Ok(false);
            }
        }

        if let Some(fragmenter) = &mut self.fragmenter {
            if let Err(e) = fragmenter.outgoing(buf) {
                debug!(error = %e, "fragmentation failed, dropping packet");
                buf.discard();
                return Ok(false);
            }
        }

        self.seal(buf)
    }

    /// Load and seal the next queued fragment. Returns `false` when none.
    pub fn next_fragment(&mut self, buf: &mut PacketBuffer) -> Result<bool, TunnelError> {
        let Some(fragmenter) = &mut self.fragmenter else {
            return Ok(false);
        };
        match fragmenter.next_fragment(buf) {
            Ok(true) => self.seal(buf),
            Ok(false) => Ok(false),
            Err(e) => {
                debug!(error = %e, "queued fragment does not fit");
                buf.discard();
                Ok(false)
            }
        }
    }

    /// Build a sealed keepalive datagram in `buf`.
    pub fn encode_keepalive(&mut self, buf: &mut PacketBuffer) -> Result<bool, TunnelError> {
        buf.reset(self.frame.headroom());
        buf.replace(&KEEPALIVE_PATTERN)?;
        self.outbound(buf)
    }

    fn seal(&mut self, buf: &mut PacketBuffer) -> Result<bool, TunnelError> {
        let negotiated = self.crypto.has_discriminator();
        if let Some(ring) = self.crypto.key_ring() {
            let mut ring = ring.lock();
            let Some(ctx) = ring.encrypt_context() else {
                trace!("no data channel key yet, dropping packet");
                self.drops.no_key += 1;
                buf.discard();
                return Ok(false);
            };
            let opcode = negotiated.then(|| Discriminator::data(ctx.key_id()).to_byte());
            match ctx.seal(opcode, buf) {
                Ok(_) => {}
                Err(CryptoError::PacketIdExhausted) => return Err(TunnelError::PacketIdExhausted),
                Err(e) => return Err(e.into()),
            }
            if let Some(byte) = opcode {
                buf.prepend_slice(&[byte])?;
            }
        }

        let max = self.frame.max_link_size();
        if buf.len() > max {
            return Err(TunnelError::Oversized { len: buf.len(), max });
        }
        Ok(true)
    }

    /// Transform a datagram into an interface packet.
    pub fn inbound(&mut self, buf: &mut PacketBuffer, now: Instant) -> InboundOutcome {
        let outcome = self.inbound_inner(buf, now);
        if let InboundOutcome::Dropped(reason) = outcome {
            debug!(?reason, "dropping inbound packet");
            self.drops.record(reason);
            buf.discard();
        }
        outcome
    }

    fn inbound_inner(&mut self, buf: &mut PacketBuffer, now: Instant) -> InboundOutcome {
        if buf.is_empty() {
            return InboundOutcome::Dropped(DropReason::Truncated);
        }

        match &self.crypto {
            DataCrypto::Cleartext => {}
            DataCrypto::Static(ring) => {
                let mut ring = ring.lock();
                let Some(ctx) = ring.decrypt_context(0, now) else {
                    return InboundOutcome::Dropped(DropReason::UnknownKey);
                };
                if let Err(e) = ctx.open(None, buf) {
                    return InboundOutcome::Dropped(crypto_drop(&e));
                }
            }
            DataCrypto::Negotiated(ring) => {
                let byte = buf.as_slice()[0];
                let Some(disc) = Discriminator::from_byte(byte) else {
                    return InboundOutcome::Dropped(DropReason::UnknownOpcode);
                };
                if disc.is_control() {
                    return InboundOutcome::Control;
                }
                if buf.advance(1).is_err() {
                    return InboundOutcome::Dropped(DropReason::Truncated);
                }

                let mut ring = ring.lock();
                let Some(ctx) = ring.decrypt_context(disc.key_id, now) else {
                    return InboundOutcome::Dropped(DropReason::UnknownKey);
                };
                if let Err(e) = ctx.open(Some(byte), buf) {
                    return InboundOutcome::Dropped(crypto_drop(&e));
                }
                if ring.pending_key_id() == Some(disc.key_id) && ring.promote(disc.key_id, now) {
                    debug!(key_id = disc.key_id, "peer switched to new key");
                }
            }
        }

        if let Some(fragmenter) = &mut self.fragmenter {
            match fragmenter.incoming(buf, now) {
                Ok(true) => {}
                Ok(false) => return InboundOutcome::Pending,
                Err(e) => {
                    debug!(error = %e, "bad fragment");
                    return InboundOutcome::Dropped(DropReason::Fragment);
                }
            }
        }

        #[cfg(feature = "compression")]
        if let Some(compressor) = &mut self.compressor {
            if let Err(e) = compressor.decompress(buf) {
                debug!(error = %e, "decompression failed");
                return InboundOutcome::Dropped(DropReason::Decompress);
            }
        }

        if buf.len() > self.frame.max_tun_read() {
            return InboundOutcome::Dropped(DropReason::Oversized);
        }
        if buf.as_slice() == KEEPALIVE_PATTERN {
            return InboundOutcome::Keepalive;
        }
        InboundOutcome::Deliver
    }

    /// Count a datagram rejected before the pipeline saw it.
    pub fn record_drop(&mut self, reason: DropReason) {
        self.drops.record(reason);
    }

    /// Fragment housekeeping.
    pub fn housekeeping(&mut self, now: Instant) {
        if let Some(fragmenter) = &mut self.fragmenter {
            fragmenter.housekeeping(now);
        }
    }

    /// Deadline of the next fragment housekeeping pass.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.fragmenter.as_ref().map(Fragmenter::next_deadline)
    }

    /// Apply a link MTU observed on the path.
    pub fn set_path_mtu(&mut self, link_mtu: usize) {
        let below = self.frame.layer_overhead(crate::transport::Layer::Encryption) + FRAGMENT_HEADER_SIZE;
        if let Some(fragmenter) = &mut self.fragmenter {
            fragmenter.set_path_mtu_hint(link_mtu.saturating_sub(below));
        }
    }
}

fn crypto_drop(error: &CryptoError) -> DropReason {
    match error {
        CryptoError::Replay(_) => DropReason::Replay,
        CryptoError::Truncated(_) => DropReason::Truncated,
        CryptoError::UnknownKeyId(_) | CryptoError::NoKey => DropReason::UnknownKey,
        _ => DropReason::Authentication,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, CryptoContext, KeyDirection, KeyRing, ReplayGuard, StaticKey};
    use crate::transport::{FrameBuilder, Layer};

    struct Options {
        compression: bool,
        fragment: Option<usize>,
        cipher: Option<CipherKind>,
    }

    fn static_ring(key: &StaticKey, direction: KeyDirection, kind: CipherKind) -> SharedKeyRing {
        let keys = key.derive(direction).unwrap();
        let guard = ReplayGuard::new(kind.id_form(), Some(64));
        KeyRing::with_primary(CryptoContext::new(0, kind, &keys, guard)).shared()
    }

    /// Two mirrored pipelines sharing one configuration.
    fn pipelines(opts: &Options, now: Instant) -> (PacketPipeline, PacketPipeline) {
        let mut builder = FrameBuilder::new().tun_mtu(Some(1400));
        if opts.compression {
            builder.register(Layer::Compression, 1).unwrap();
        }
        if opts.fragment.is_some() {
            builder.register(Layer::Fragmentation, FRAGMENT_HEADER_SIZE).unwrap();
        }
        if let Some(kind) = opts.cipher {
            builder.register(Layer::Encryption, kind.overhead()).unwrap();
        }
        let frame = builder.finalize().unwrap();

        let key = StaticKey::generate();
        let make = |direction| {
            let crypto = match opts.cipher {
                Some(kind) => DataCrypto::Static(static_ring(&key, direction, kind)),
                None => DataCrypto::Cleartext,
            };
            let mut p = PacketPipeline::new(frame, crypto);
            #[cfg(feature = "compression")]
            if opts.compression {
                p = p.with_compression(3);
            }
            if let Some(size) = opts.fragment {
                p = p.with_fragmentation(size, now);
            }
            p
        };
        (make(KeyDirection::Normal), make(KeyDirection::Inverse))
    }

    /// Push one payload through `tx` and `rx`, returning what `rx` delivers.
    fn transfer(tx: &mut PacketPipeline, rx: &mut PacketPipeline, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        let frame = *tx.frame();
        let mut wire = Vec::new();

        let mut buf = frame.alloc_buffer();
        buf.replace(payload).unwrap();
        assert!(tx.outbound(&mut buf).unwrap());
        wire.push(buf.as_slice().to_vec());
        loop {
            let mut next = frame.alloc_buffer();
            if !tx.next_fragment(&mut next).unwrap() {
                break;
            }
            wire.push(next.as_slice().to_vec());
        }

        let mut delivered = None;
        for datagram in wire {
            let mut buf = frame.alloc_buffer();
            buf.replace(&datagram).unwrap();
            match rx.inbound(&mut buf, now) {
                InboundOutcome::Deliver => delivered = Some(buf.as_slice().to_vec()),
                InboundOutcome::Pending => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        delivered
    }

    #[test]
    fn test_roundtrip_every_layer_combination() {
        let now = Instant::now();
        let compression_modes: &[bool] = if cfg!(feature = "compression") {
            &[false, true]
        } else {
            &[false]
        };
        for &compression in compression_modes {
            for fragment in [None, Some(500)] {
                for cipher in [None, Some(CipherKind::ChaCha20Poly1305), Some(CipherKind::XChaCha20Poly1305)] {
                    let opts = Options {
                        compression,
                        fragment,
                        cipher,
                    };
                    let (mut tx, mut rx) = pipelines(&opts, now);
                    for len in [1usize, 100, 499, 500, 501, 1399, 1400] {
                        let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
                        let got = transfer(&mut tx, &mut rx, &payload, now);
                        assert_eq!(got.as_deref(), Some(payload.as_slice()), "len {len}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_scenario_single_packet_id() {
        let now = Instant::now();
        let opts = Options {
            compression: false,
            fragment: None,
            cipher: Some(CipherKind::ChaCha20Poly1305),
        };
        let (mut tx, mut rx) = pipelines(&opts, now);
        let payload = vec![0xA5; 1200];

        let mut buf = tx.frame().alloc_buffer();
        buf.replace(&payload).unwrap();
        tx.outbound(&mut buf).unwrap();
        assert_eq!(buf.len(), 1200 + 4 + 16);
        let sent_id = u32::from_be_bytes(buf.as_slice()[..4].try_into().unwrap());

        assert_eq!(rx.inbound(&mut buf, now), InboundOutcome::Deliver);
        assert_eq!(buf.as_slice(), payload.as_slice());

        let ring = rx.crypto().key_ring().unwrap().lock();
        assert_eq!(ring.primary_high_water(), Some((0, u64::from(sent_id))));
    }

    #[test]
    fn test_replayed_datagram_dropped() {
        let now = Instant::now();
        let opts = Options {
            compression: false,
            fragment: None,
            cipher: Some(CipherKind::ChaCha20Poly1305),
        };
        let (mut tx, mut rx) = pipelines(&opts, now);

        let mut buf = tx.frame().alloc_buffer();
        buf.replace(b"hello").unwrap();
        tx.outbound(&mut buf).unwrap();
        let wire = buf.as_slice().to_vec();

        assert_eq!(rx.inbound(&mut buf, now), InboundOutcome::Deliver);

        let mut again = rx.frame().alloc_buffer();
        again.replace(&wire).unwrap();
        assert_eq!(rx.inbound(&mut again, now), InboundOutcome::Dropped(DropReason::Replay));
        assert!(again.is_empty());
        assert_eq!(rx.drops().replay, 1);
    }

    #[test]
    fn test_keepalive_not_delivered() {
        let now = Instant::now();
        let opts = Options {
            compression: cfg!(feature = "compression"),
            fragment: Some(500),
            cipher: Some(CipherKind::XChaCha20Poly1305),
        };
        let (mut tx, mut rx) = pipelines(&opts, now);

        let mut buf = tx.frame().alloc_buffer();
        assert!(tx.encode_keepalive(&mut buf).unwrap());
        assert_ne!(buf.as_slice(), KEEPALIVE_PATTERN);
        assert_eq!(rx.inbound(&mut buf, now), InboundOutcome::Keepalive);
    }

    #[test]
    fn test_outbound_oversize_is_fatal() {
        let now = Instant::now();
        let opts = Options {
            compression: false,
            fragment: None,
            cipher: Some(CipherKind::ChaCha20Poly1305),
        };
        let (mut tx, _) = pipelines(&opts, now);
        let mut buf = tx.frame().alloc_buffer();
        buf.replace(&[0u8; 1401]).unwrap();
        assert!(matches!(
            tx.outbound(&mut buf),
            Err(TunnelError::Oversized { len: 1401, max: 1400 })
        ));
    }

    #[test]
    fn test_negotiated_mode_routes_control() {
        let now = Instant::now();
        let frame = FrameBuilder::new().tun_mtu(Some(1400)).finalize().unwrap();
        let ring = KeyRing::new(std::time::Duration::from_secs(60)).shared();
        let mut pipeline = PacketPipeline::new(frame, DataCrypto::Negotiated(ring));

        let mut buf = frame.alloc_buffer();
        buf.replace(&[0x08, 1, 2, 3]).unwrap();
        assert_eq!(pipeline.inbound(&mut buf, now), InboundOutcome::Control);
        assert_eq!(buf.len(), 4);

        buf.replace(&[0x30, 1, 2, 3]).unwrap();
        assert_eq!(pipeline.inbound(&mut buf, now), InboundOutcome::Dropped(DropReason::UnknownKey));

        buf.replace(&[0xF8]).unwrap();
        assert_eq!(pipeline.inbound(&mut buf, now), InboundOutcome::Dropped(DropReason::UnknownOpcode));

        // No key yet: outbound traffic is dropped, not an error
        buf.replace(b"early").unwrap();
        assert!(!pipeline.outbound(&mut buf).unwrap());
        assert_eq!(pipeline.drops().no_key, 1);
    }
}
