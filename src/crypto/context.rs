//! Crypto contexts and the key ring.
//!
//! A [`CryptoContext`] seals and opens data-channel packets for one key id.
//! The [`KeyRing`] holds the contexts a session may use at once:
//!
//! - `primary`: encrypts all outgoing traffic
//! - `pending`: freshly negotiated, decrypts but is not yet used to send
//! - `lame_duck`: the previous primary, decrypts until its transition expires
//!
//! The ring is shared between the pipeline and the control channel as a
//! [`SharedKeyRing`]; every access is a short critical section, and a
//! rotation replaces the primary between two packets.
//!
//! Sealed packet layout:
//!
//! ```text
//! [ packet id (4|8) ][ explicit IV (0|24) ][ ciphertext ][ tag (16) ]
//! ```
//!
//! The AAD is the opcode byte (when present) followed by the packet id.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{RngCore, rngs::OsRng};
use tokio::time::Instant;

use crate::core::{AEAD_TAG_SIZE, CryptoError, NONCE_SALT_SIZE, XCHACHA_NONCE_SIZE};
use crate::transport::PacketBuffer;

use super::cipher::{CipherKind, PacketCipher, new_cipher};
use super::keys::DirectionalKeys;
use super::replay::{PacketIdForm, ReplayGuard};

/// Key ring shared between the pipeline and the control channel.
pub type SharedKeyRing = Arc<Mutex<KeyRing>>;

/// Largest AAD: opcode plus a long packet id.
const MAX_AAD: usize = 1 + 8;

/// Encryption state for one negotiated key.
pub struct CryptoContext {
    key_id: u8,
    kind: CipherKind,
    encrypt: Box<dyn PacketCipher>,
    decrypt: Box<dyn PacketCipher>,
    encrypt_salt: [u8; NONCE_SALT_SIZE],
    decrypt_salt: [u8; NONCE_SALT_SIZE],
    /// Last explicit IV sent; advanced before every use
    residual_iv: [u8; XCHACHA_NONCE_SIZE],
    guard: ReplayGuard,
}

impl CryptoContext {
    /// Build a context from directional keys.
    pub fn new(key_id: u8, kind: CipherKind, keys: &DirectionalKeys, guard: ReplayGuard) -> Self {
        let mut residual_iv = [0u8; XCHACHA_NONCE_SIZE];
        OsRng.fill_bytes(&mut residual_iv);
        Self {
            key_id,
            kind,
            encrypt: new_cipher(kind, &keys.encrypt),
            decrypt: new_cipher(kind, &keys.decrypt),
            encrypt_salt: *keys.encrypt.salt(),
            decrypt_salt: *keys.decrypt.salt(),
            residual_iv,
            guard,
        }
    }

    /// Key id carried in the opcode byte.
    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    /// Cipher suite.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Replay state.
    pub fn guard(&self) -> &ReplayGuard {
        &self.guard
    }

    /// Replay state, mutably (for seeding).
    pub fn guard_mut(&mut self) -> &mut ReplayGuard {
        &mut self.guard
    }

    fn form(&self) -> PacketIdForm {
        self.kind.id_form()
    }

    fn build_aad(opcode: Option<u8>, id_bytes: &[u8], out: &mut [u8; MAX_AAD]) -> usize {
        let mut n = 0;
        if let Some(op) = opcode {
            out[0] = op;
            n = 1;
        }
        out[n..n + id_bytes.len()].copy_from_slice(id_bytes);
        n + id_bytes.len()
    }

    fn implicit_nonce(id_bytes: &[u8], salt: &[u8; NONCE_SALT_SIZE]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&id_bytes[..4]);
        nonce[4..].copy_from_slice(salt);
        nonce
    }

    fn advance_iv(&mut self) {
        for byte in self.residual_iv.iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    /// Encrypt the buffer content in place and frame it.
    ///
    /// `opcode` is authenticated but not written; the caller prepends it.
    /// Returns the packet id used.
    pub fn seal(&mut self, opcode: Option<u8>, buf: &mut PacketBuffer) -> Result<u64, CryptoError> {
        let form = self.form();
        let id = self.guard.issue()?;
        let mut id_raw = [0u8; 8];
        let id_len = form.encode(id, &mut id_raw);
        let id_bytes = &id_raw[..id_len];

        let mut aad = [0u8; MAX_AAD];
        let aad_len = Self::build_aad(opcode, id_bytes, &mut aad);

        let tag = match self.kind {
            CipherKind::ChaCha20Poly1305 => {
                let nonce = Self::implicit_nonce(id_bytes, &self.encrypt_salt);
                self.encrypt.seal(&nonce, &aad[..aad_len], buf.as_mut_slice())?
            }
            CipherKind::XChaCha20Poly1305 => {
                self.advance_iv();
                let iv = self.residual_iv;
                let tag = self.encrypt.seal(&iv, &aad[..aad_len], buf.as_mut_slice())?;
                buf.prepend_slice(&iv)?;
                tag
            }
        };
        buf.extend_from_slice(&tag)?;
        buf.prepend_slice(id_bytes)?;
        Ok(id)
    }

    /// Authenticate, replay-check and decrypt the buffer in place.
    ///
    /// On success the window holds only the plaintext. Returns the packet id.
    pub fn open(&mut self, opcode: Option<u8>, buf: &mut PacketBuffer) -> Result<u64, CryptoError> {
        let form = self.form();
        let id_len = form.len();
        let header = id_len + self.kind.iv_len();
        let total = buf.len();
        if total < header + AEAD_TAG_SIZE {
            return Err(CryptoError::Truncated(total));
        }

        let data = buf.as_mut_slice();
        let id = form
            .decode(data)
            .ok_or(CryptoError::Truncated(total))?;

        // Replay check first (cheap)
        if self.guard.is_replay(id) {
            return Err(CryptoError::Replay(id));
        }

        let mut aad = [0u8; MAX_AAD];
        let aad_len = Self::build_aad(opcode, &data[..id_len], &mut aad);

        let (head, rest) = data.split_at_mut(header);
        let (payload, tag) = rest.split_at_mut(rest.len() - AEAD_TAG_SIZE);
        match self.kind {
            CipherKind::ChaCha20Poly1305 => {
                let nonce = Self::implicit_nonce(&head[..id_len], &self.decrypt_salt);
                self.decrypt.open(&nonce, &aad[..aad_len], payload, tag)?;
            }
            CipherKind::XChaCha20Poly1305 => {
                self.decrypt.open(&head[id_len..], &aad[..aad_len], payload, tag)?;
            }
        }

        // Update the window only after successful verification
        if !self.guard.accept(id) {
            return Err(CryptoError::Replay(id));
        }

        buf.advance(header)?;
        buf.truncate(total - header - AEAD_TAG_SIZE);
        Ok(id)
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("key_id", &self.key_id)
            .field("kind", &self.kind)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// The set of contexts a session may use at once.
#[derive(Debug)]
pub struct KeyRing {
    primary: Option<CryptoContext>,
    pending: Option<CryptoContext>,
    lame_duck: Option<(CryptoContext, Instant)>,
    transition_window: Duration,
}

impl KeyRing {
    /// Create an empty ring.
    pub fn new(transition_window: Duration) -> Self {
        Self {
            primary: None,
            pending: None,
            lame_duck: None,
            transition_window,
        }
    }

    /// Create a ring with a fixed primary context (static-key mode).
    pub fn with_primary(ctx: CryptoContext) -> Self {
        let mut ring = Self::new(Duration::ZERO);
        ring.primary = Some(ctx);
        ring
    }

    /// Wrap in the shared cell.
    pub fn shared(self) -> SharedKeyRing {
        Arc::new(Mutex::new(self))
    }

    /// Context used for outgoing packets.
    pub fn encrypt_context(&mut self) -> Option<&mut CryptoContext> {
        self.primary.as_mut()
    }

    /// Context able to decrypt packets tagged with `key_id`.
    pub fn decrypt_context(&mut self, key_id: u8, now: Instant) -> Option<&mut CryptoContext> {
        if self.primary.as_ref().is_some_and(|c| c.key_id == key_id) {
            return self.primary.as_mut();
        }
        if self.pending.as_ref().is_some_and(|c| c.key_id == key_id) {
            return self.pending.as_mut();
        }
        match &mut self.lame_duck {
            Some((ctx, expires)) if ctx.key_id == key_id && now < *expires => Some(ctx),
            _ => None,
        }
    }

    /// Make `ctx` primary; the old primary becomes the lame duck.
    pub fn rotate(&mut self, ctx: CryptoContext, now: Instant) {
        if let Some(old) = self.primary.replace(ctx) {
            if self.transition_window.is_zero() {
                self.lame_duck = None;
            } else {
                self.lame_duck = Some((old, now + self.transition_window));
            }
        }
    }

    /// Hold a negotiated context until the peer confirms it.
    pub fn install_pending(&mut self, ctx: CryptoContext) {
        self.pending = Some(ctx);
    }

    /// Promote the pending context if it carries `key_id`.
    pub fn promote(&mut self, key_id: u8, now: Instant) -> bool {
        match self.pending.take() {
            Some(ctx) if ctx.key_id == key_id => {
                self.rotate(ctx, now);
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    /// Key id of the pending context.
    pub fn pending_key_id(&self) -> Option<u8> {
        self.pending.as_ref().map(|c| c.key_id)
    }

    /// Drop the pending context.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Key id of the primary context.
    pub fn primary_key_id(&self) -> Option<u8> {
        self.primary.as_ref().map(|c| c.key_id)
    }

    /// Last issued and highest accepted ids of the primary context.
    pub fn primary_high_water(&self) -> Option<(u64, u64)> {
        self.primary.as_ref().map(|c| c.guard.high_water())
    }

    /// Whether outgoing traffic can be encrypted.
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Retire an expired lame duck.
    pub fn expire(&mut self, now: Instant) {
        if self.lame_duck.as_ref().is_some_and(|(_, at)| now >= *at) {
            self.lame_duck = None;
        }
    }

    /// When the lame duck expires.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.lame_duck.as_ref().map(|(_, at)| *at)
    }

    /// Forget every context.
    pub fn clear(&mut self) {
        self.primary = None;
        self.pending = None;
        self.lame_duck = None;
    }
}
