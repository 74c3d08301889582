//! Fragmentation engine
//!
//! Splits packets larger than the fragment size into at most
//! [`MAX_FRAGMENTS`] pieces and reassembles them on the far side. Runs after
//! compression and before encryption, so each fragment is authenticated as
//! its own datagram.
//!
//! ## Header (4 bytes, big-endian)
//!
//! ```text
//!  31 30 29          22 21     17 16                 3 2   0
//! +-----+--------------+---------+--------------------+-----+
//! |type |    seq_id    | frag_id |     frag_size      | rsv |
//! +-----+--------------+---------+--------------------+-----+
//! ```
//!
//! `frag_size` is the length of every non-last fragment of the stream, so a
//! fragment lands at `frag_id * frag_size` whatever order it arrives in.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::core::{BufferError, FRAGMENT_HOUSEKEEPING_INTERVAL, FRAGMENT_TTL};
use crate::transport::{EventTimeout, PacketBuffer};

/// Size of the fragment header.
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// Maximum number of fragments per packet (5-bit fragment id).
pub const MAX_FRAGMENTS: usize = 32;

/// Largest value of the 14-bit size field.
pub const MAX_FRAGMENT_SIZE: usize = (1 << 14) - 1;

/// Smallest usable fragment payload.
pub const MIN_FRAGMENT_SIZE: usize = 64;

/// Errors from fragment processing.
#[derive(Debug, Error)]
pub enum FragmentError {
    /// Packet shorter than the header.
    #[error("fragment truncated: {0} bytes")]
    Truncated(usize),

    /// Unknown fragment type.
    #[error("bad fragment type {0}")]
    BadType(u8),

    /// Packet would need more fragments than the id field allows.
    #[error("packet needs {count} fragments, max {MAX_FRAGMENTS}")]
    TooManyFragments {
        /// Fragments required.
        count: usize,
    },

    /// Reassembly would exceed the packet maximum.
    #[error("reassembled size {len} exceeds {max}")]
    TooLarge {
        /// Size the fragment implies.
        len: usize,
        /// Maximum reassembled size.
        max: usize,
    },

    /// Fragment length disagrees with its header.
    #[error("inconsistent fragment: {0}")]
    Inconsistent(&'static str),

    /// Buffer could not hold the result.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Fragment type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentType {
    /// Unfragmented packet.
    Whole = 0,
    /// Fragment with more to follow.
    NotLast = 1,
    /// Final fragment of a stream.
    Last = 2,
}

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Fragment type.
    pub kind: FragmentType,
    /// Stream (packet) sequence number.
    pub seq_id: u8,
    /// Position within the stream.
    pub frag_id: u8,
    /// Size of each non-last fragment.
    pub frag_size: u16,
}

impl FragmentHeader {
    /// Header for an unfragmented packet.
    pub fn whole() -> Self {
        Self {
            kind: FragmentType::Whole,
            seq_id: 0,
            frag_id: 0,
            frag_size: 0,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let word = (self.kind as u32) << 30
            | u32::from(self.seq_id) << 22
            | u32::from(self.frag_id & 0x1f) << 17
            | u32::from(self.frag_size & 0x3fff) << 3;
        word.to_be_bytes()
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentError> {
        let raw: [u8; FRAGMENT_HEADER_SIZE] = bytes
            .get(..FRAGMENT_HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(FragmentError::Truncated(bytes.len()))?;
        let word = u32::from_be_bytes(raw);
        let kind = match word >> 30 {
            0 => FragmentType::Whole,
            1 => FragmentType::NotLast,
            2 => FragmentType::Last,
            other => return Err(FragmentError::BadType(other as u8)),
        };
        Ok(Self {
            kind,
            seq_id: (word >> 22) as u8,
            frag_id: ((word >> 17) & 0x1f) as u8,
            frag_size: ((word >> 3) & 0x3fff) as u16,
        })
    }
}

/// A packet being reassembled.
#[derive(Debug)]
struct Partial {
    data: Vec<u8>,
    received: u32,
    last_id: Option<u8>,
    total_len: usize,
    frag_size: usize,
    started: Instant,
}

impl Partial {
    fn new(frag_size: usize, now: Instant) -> Self {
        Self {
            data: Vec::new(),
            received: 0,
            last_id: None,
            total_len: 0,
            frag_size,
            started: now,
        }
    }

    fn is_complete(&self) -> bool {
        match self.last_id {
            Some(last) => {
                let want = if last == 31 {
                    u32::MAX
                } else {
                    (1u32 << (last + 1)) - 1
                };
                self.received & want == want
            }
            None => false,
        }
    }
}

/// Per-session fragmentation state for both directions.
#[derive(Debug)]
pub struct Fragmenter {
    configured_size: usize,
    effective_size: usize,
    max_packet: usize,
    seq: u8,
    outgoing: VecDeque<Vec<u8>>,
    incoming: HashMap<u8, Partial>,
    housekeeping: EventTimeout,
    path_mtu_hint: Option<usize>,
    expired: u64,
}

impl Fragmenter {
    /// Create an engine cutting fragments of `frag_size` payload bytes.
    ///
    /// `max_packet` bounds reassembled packets.
    pub fn new(frag_size: usize, max_packet: usize, now: Instant) -> Self {
        let frag_size = frag_size.clamp(MIN_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE);
        Self {
            configured_size: frag_size,
            effective_size: frag_size,
            max_packet,
            seq: 0,
            outgoing: VecDeque::new(),
            incoming: HashMap::new(),
            housekeeping: EventTimeout::new(FRAGMENT_HOUSEKEEPING_INTERVAL, now),
            path_mtu_hint: None,
            expired: 0,
        }
    }

    /// Current fragment payload size.
    pub fn fragment_size(&self) -> usize {
        self.effective_size
    }

    /// Whether fragments are waiting to be sent.
    pub fn has_pending(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Partial packets held for reassembly.
    pub fn partial_count(&self) -> usize {
        self.incoming.len()
    }

    /// Partial packets discarded by expiry so far.
    pub fn expired_count(&self) -> u64 {
        self.expired
    }

    /// Fragment the buffer content.
    ///
    /// A packet within the fragment size gets a whole-packet header. A
    /// larger one is split; the first fragment stays in `buf` and the rest
    /// are queued for [`next_fragment`](Self::next_fragment).
    pub fn outgoing(&mut self, buf: &mut PacketBuffer) -> Result<(), FragmentError> {
        let size = self.effective_size;
        if buf.len() <= size {
            buf.prepend_slice(&FragmentHeader::whole().encode())?;
            return Ok(());
        }

        let count = buf.len().div_ceil(size);
        if count > MAX_FRAGMENTS {
            return Err(FragmentError::TooManyFragments { count });
        }

        self.seq = self.seq.wrapping_add(1);
        let seq_id = self.seq;
        let payload = buf.as_slice().to_vec();

        for (frag_id, chunk) in payload.chunks(size).enumerate() {
            let kind = if frag_id + 1 == count {
                FragmentType::Last
            } else {
                FragmentType::NotLast
            };
            let header = FragmentHeader {
                kind,
                seq_id,
                frag_id: frag_id as u8,
                frag_size: size as u16,
            };
            if frag_id == 0 {
                buf.replace(chunk)?;
                buf.prepend_slice(&header.encode())?;
            } else {
                let mut wire = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
                wire.extend_from_slice(&header.encode());
                wire.extend_from_slice(chunk);
                self.outgoing.push_back(wire);
            }
        }

        debug!(seq_id, count, size, "packet fragmented");
        Ok(())
    }

    /// Load the next queued fragment into `buf`. Returns `false` when idle.
    pub fn next_fragment(&mut self, buf: &mut PacketBuffer) -> Result<bool, FragmentError> {
        match self.outgoing.pop_front() {
            Some(wire) => {
                buf.replace(&wire)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Strip the header and feed reassembly.
    ///
    /// Returns `true` when `buf` holds a complete packet. Otherwise the
    /// buffer is emptied and the fragment is held.
    pub fn incoming(&mut self, buf: &mut PacketBuffer, now: Instant) -> Result<bool, FragmentError> {
        let header = FragmentHeader::decode(buf.as_slice())?;
        buf.advance(FRAGMENT_HEADER_SIZE)?;

        if header.kind == FragmentType::Whole {
            return Ok(true);
        }

        let frag_size = usize::from(header.frag_size);
        let len = buf.len();
        if frag_size == 0 || len == 0 {
            return Err(FragmentError::Inconsistent("empty fragment"));
        }
        match header.kind {
            FragmentType::NotLast if len != frag_size => {
                return Err(FragmentError::Inconsistent("non-last fragment size"));
            }
            FragmentType::Last if len > frag_size => {
                return Err(FragmentError::Inconsistent("last fragment too long"));
            }
            _ => {}
        }

        let offset = usize::from(header.frag_id) * frag_size;
        let end = offset + len;
        if end > self.max_packet {
            return Err(FragmentError::TooLarge {
                len: end,
                max: self.max_packet,
            });
        }

        let partial = self
            .incoming
            .entry(header.seq_id)
            .or_insert_with(|| Partial::new(frag_size, now));
        if partial.frag_size != frag_size {
            // Sequence number reused by a new stream
            *partial = Partial::new(frag_size, now);
        }

        if partial.data.len() < end {
            partial.data.resize(end, 0);
        }
        partial.data[offset..end].copy_from_slice(buf.as_slice());
        partial.received |= 1 << header.frag_id;
        if header.kind == FragmentType::Last {
            partial.last_id = Some(header.frag_id);
            partial.total_len = end;
        }

        if !partial.is_complete() {
            buf.discard();
            return Ok(false);
        }

        if let Some(done) = self.incoming.remove(&header.seq_id) {
            buf.replace(&done.data[..done.total_len])?;
        }
        Ok(true)
    }

    /// Record a link MTU observed on the path, in fragment payload bytes.
    pub fn set_path_mtu_hint(&mut self, frag_size: usize) {
        self.path_mtu_hint = Some(frag_size);
    }

    /// Periodic work: expire stale partials and apply a path-MTU hint.
    ///
    /// Runs at most once per housekeeping interval; returns the number of
    /// partials expired.
    pub fn housekeeping(&mut self, now: Instant) -> usize {
        if !self.housekeeping.trigger(now) {
            return 0;
        }

        if let Some(hint) = self.path_mtu_hint.take() {
            let size = hint.clamp(MIN_FRAGMENT_SIZE, self.configured_size);
            if size != self.effective_size {
                debug!(from = self.effective_size, to = size, "fragment size changed");
                self.effective_size = size;
            }
        }

        let before = self.incoming.len();
        self.incoming
            .retain(|_, p| now.saturating_duration_since(p.started) < FRAGMENT_TTL);
        let expired = before - self.incoming.len();
        if expired > 0 {
            debug!(expired, "discarded stale fragment streams");
            self.expired += expired as u64;
        }
        expired
    }

    /// Deadline of the next housekeeping pass.
    pub fn next_deadline(&self) -> Instant {
        self.housekeeping.deadline()
    }
}
