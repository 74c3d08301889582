//! Packet identifiers and replay protection.
//!
//! The send side issues strictly increasing ids starting at 1; the receive
//! side runs a sliding-window bitmap. Both can be seeded from a persisted
//! high-water mark so ids are never reused or re-accepted across restarts.

use crate::core::CryptoError;

/// Width of the packet id on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketIdForm {
    /// 32-bit id.
    Short,
    /// 64-bit id.
    Long,
}

impl PacketIdForm {
    /// Encoded length in bytes.
    pub fn len(self) -> usize {
        match self {
            Self::Short => 4,
            Self::Long => 8,
        }
    }

    /// Largest id that can be issued.
    pub fn max(self) -> u64 {
        match self {
            Self::Short => u64::from(u32::MAX),
            Self::Long => u64::MAX,
        }
    }

    /// Write `id` big-endian into `out`, returning the bytes used.
    pub fn encode(self, id: u64, out: &mut [u8; 8]) -> usize {
        match self {
            Self::Short => out[..4].copy_from_slice(&(id as u32).to_be_bytes()),
            Self::Long => out.copy_from_slice(&id.to_be_bytes()),
        }
        self.len()
    }

    /// Read a big-endian id from the front of `bytes`.
    pub fn decode(self, bytes: &[u8]) -> Option<u64> {
        match self {
            Self::Short => {
                let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
                Some(u64::from(u32::from_be_bytes(raw)))
            }
            Self::Long => {
                let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
                Some(u64::from_be_bytes(raw))
            }
        }
    }
}

/// Send-side id generator.
#[derive(Debug, Clone)]
pub struct PacketIdSend {
    next: u64,
    form: PacketIdForm,
}

impl PacketIdSend {
    /// Start issuing at 1.
    pub fn new(form: PacketIdForm) -> Self {
        Self { next: 1, form }
    }

    /// Issue the next id.
    ///
    /// # Errors
    /// Returns `PacketIdExhausted` once the form's range is used up.
    pub fn issue(&mut self) -> Result<u64, CryptoError> {
        if self.next == 0 || self.next > self.form.max() {
            return Err(CryptoError::PacketIdExhausted);
        }
        let id = self.next;
        // Wraps to 0 after u64::MAX, which the check above treats as exhausted
        self.next = self.next.wrapping_add(1);
        Ok(id)
    }

    /// Most recently issued id (0 if none).
    pub fn last_issued(&self) -> u64 {
        if self.next == 0 {
            u64::MAX
        } else {
            self.next - 1
        }
    }

    /// Never issue an id at or below `issued`.
    pub fn seed(&mut self, issued: u64) {
        if issued >= self.last_issued() {
            self.next = issued.wrapping_add(1);
        }
    }
}

/// Anti-replay sliding window.
///
/// - Below window: reject
/// - Seen id: reject
/// - Above highest: advance the window
/// - At or below the persisted floor: reject
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Bitmap for tracking seen ids; bit n is `highest - n`
    bitmap: Vec<u64>,
    /// Window size in ids
    size: u64,
    /// Highest id seen so far
    highest: u64,
    /// Whether we've seen any packets yet
    initialized: bool,
    /// Ids at or below this were accepted by a previous session
    floor: u64,
}

impl ReplayWindow {
    /// Create a window covering at least `size` ids (rounded up to 64).
    pub fn new(size: usize) -> Self {
        let words = size.div_ceil(64).max(1);
        Self {
            bitmap: vec![0; words],
            size: (words * 64) as u64,
            highest: 0,
            initialized: false,
            floor: 0,
        }
    }

    /// Window size in ids.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Highest id accepted (or the floor if nothing was accepted yet).
    pub fn highest(&self) -> u64 {
        if self.initialized {
            self.highest
        } else {
            self.floor
        }
    }

    /// Reject everything at or below `seen`.
    pub fn seed(&mut self, seen: u64) {
        self.floor = self.floor.max(seen);
    }

    /// Check if an id is a replay (without updating).
    pub fn is_replay(&self, id: u64) -> bool {
        if id == 0 || id <= self.floor {
            return true;
        }
        if !self.initialized || id > self.highest {
            return false;
        }
        self.is_seen(id)
    }

    /// Check an id and mark it seen.
    ///
    /// Returns Ok(()) if the id is new.
    /// Returns Err(Replay) if it was seen or is below the window.
    pub fn check_and_update(&mut self, id: u64) -> Result<(), CryptoError> {
        if id == 0 || id <= self.floor {
            return Err(CryptoError::Replay(id));
        }

        if !self.initialized {
            // First packet - initialize
            self.highest = id;
            self.mark_seen(id);
            self.initialized = true;
            return Ok(());
        }

        if id > self.highest {
            // Advance the window
            let shift = id - self.highest;
            self.shift_window(shift);
            self.highest = id;
            self.mark_seen(id);
            Ok(())
        } else {
            if self.is_seen(id) {
                return Err(CryptoError::Replay(id));
            }
            self.mark_seen(id);
            Ok(())
        }
    }

    /// Whether the id has been seen; below-window ids count as seen.
    fn is_seen(&self, id: u64) -> bool {
        if id > self.highest {
            return false;
        }
        let diff = self.highest - id;
        if diff >= self.size {
            return true;
        }
        let bit_index = diff as usize;
        (self.bitmap[bit_index / 64] & (1 << (bit_index % 64))) != 0
    }

    /// Mark an id as seen.
    fn mark_seen(&mut self, id: u64) {
        if id > self.highest {
            return;
        }
        let diff = self.highest - id;
        if diff >= self.size {
            return;
        }
        let bit_index = diff as usize;
        self.bitmap[bit_index / 64] |= 1 << (bit_index % 64);
    }

    /// Shift the window forward.
    ///
    /// Bit position represents (highest - id), so older ids move to
    /// higher bit positions.
    fn shift_window(&mut self, shift: u64) {
        if shift >= self.size {
            // Complete reset - all previous ids fall outside the window
            self.bitmap.iter_mut().for_each(|w| *w = 0);
            return;
        }

        let shift_words = (shift / 64) as usize;
        let shift_bits = (shift % 64) as u32;
        let len = self.bitmap.len();

        // Shift whole words (towards higher indices = older ids)
        if shift_words > 0 {
            for i in (shift_words..len).rev() {
                self.bitmap[i] = self.bitmap[i - shift_words];
            }
            for word in self.bitmap.iter_mut().take(shift_words) {
                *word = 0;
            }
        }

        // Shift remaining bits, carrying into the next (older) word
        if shift_bits > 0 {
            let mut carry = 0u64;
            for word in self.bitmap.iter_mut() {
                let new_carry = *word >> (64 - shift_bits);
                *word = (*word << shift_bits) | carry;
                carry = new_carry;
            }
        }
    }
}

/// Per-context replay guard: id issuance plus optional window check.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    send: PacketIdSend,
    /// `None` when replay protection is disabled.
    window: Option<ReplayWindow>,
    /// Highest id accepted, tracked even without a window.
    seen: u64,
}

impl ReplayGuard {
    /// Create a guard; `window == None` disables replay checks.
    pub fn new(form: PacketIdForm, window: Option<usize>) -> Self {
        Self {
            send: PacketIdSend::new(form),
            window: window.map(ReplayWindow::new),
            seen: 0,
        }
    }

    /// Seed from a persisted high-water mark.
    pub fn seed(&mut self, issued: u64, seen: u64) {
        self.send.seed(issued);
        if let Some(w) = &mut self.window {
            w.seed(seen);
        }
        self.seen = self.seen.max(seen);
    }

    /// Issue the next outgoing id.
    pub fn issue(&mut self) -> Result<u64, CryptoError> {
        self.send.issue()
    }

    /// Cheap pre-check before authentication.
    pub fn is_replay(&self, id: u64) -> bool {
        match &self.window {
            Some(w) => w.is_replay(id),
            None => false,
        }
    }

    /// Accept an authenticated id.
    pub fn accept(&mut self, id: u64) -> bool {
        let ok = match &mut self.window {
            Some(w) => w.check_and_update(id).is_ok(),
            None => true,
        };
        if ok {
            self.seen = self.seen.max(id);
        }
        ok
    }

    /// Last issued and highest accepted ids.
    pub fn high_water(&self) -> (u64, u64) {
        (self.send.last_issued(), self.seen)
    }
}
