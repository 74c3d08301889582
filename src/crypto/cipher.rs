//! Data-channel AEAD ciphers.
//!
//! Two modes are supported:
//!
//! | Mode                 | Packet id | Explicit IV | Nonce                          |
//! |----------------------|-----------|-------------|--------------------------------|
//! | `ChaCha20Poly1305`   | 4 bytes   | none        | `packet_id (BE32) \|\| salt (8)` |
//! | `XChaCha20Poly1305`  | 8 bytes   | 24 bytes    | the explicit IV                |
//!
//! The engine only reaches the primitives through [`PacketCipher`].

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use serde::{Deserialize, Serialize};

use crate::core::{AEAD_TAG_SIZE, CHACHA_NONCE_SIZE, CryptoError, XCHACHA_NONCE_SIZE};

use super::keys::CipherKey;
use super::replay::PacketIdForm;

/// Cipher suite for the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherKind {
    /// ChaCha20-Poly1305 with a 4-byte packet id and implicit nonce.
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 with an 8-byte packet id and explicit 24-byte IV.
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CipherKind {
    /// Packet id form carried on the wire.
    pub fn id_form(self) -> PacketIdForm {
        match self {
            Self::ChaCha20Poly1305 => PacketIdForm::Short,
            Self::XChaCha20Poly1305 => PacketIdForm::Long,
        }
    }

    /// Explicit IV bytes per packet.
    pub fn iv_len(self) -> usize {
        match self {
            Self::ChaCha20Poly1305 => 0,
            Self::XChaCha20Poly1305 => XCHACHA_NONCE_SIZE,
        }
    }

    /// Nonce size of the underlying AEAD.
    pub fn nonce_len(self) -> usize {
        match self {
            Self::ChaCha20Poly1305 => CHACHA_NONCE_SIZE,
            Self::XChaCha20Poly1305 => XCHACHA_NONCE_SIZE,
        }
    }

    /// Bytes added to each packet: packet id, explicit IV and tag.
    pub fn overhead(self) -> usize {
        self.id_form().len() + self.iv_len() + AEAD_TAG_SIZE
    }
}

/// Authenticated encryption capability for one key in one direction.
pub trait PacketCipher: Send + Sync {
    /// Which suite this is.
    fn kind(&self) -> CipherKind;

    /// Encrypt `payload` in place and return the tag.
    fn seal(
        &self,
        nonce: &[u8],
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; AEAD_TAG_SIZE], CryptoError>;

    /// Verify `tag` and decrypt `payload` in place.
    fn open(&self, nonce: &[u8], aad: &[u8], payload: &mut [u8], tag: &[u8])
    -> Result<(), CryptoError>;
}

/// ChaCha20-Poly1305 (RFC 8439).
pub struct ChaChaCipher {
    aead: ChaCha20Poly1305,
}

impl ChaChaCipher {
    /// Create from a 32-byte key.
    pub fn new(key: &CipherKey) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key.key())),
        }
    }
}

impl PacketCipher for ChaChaCipher {
    fn kind(&self) -> CipherKind {
        CipherKind::ChaCha20Poly1305
    }

    fn seal(
        &self,
        nonce: &[u8],
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; AEAD_TAG_SIZE], CryptoError> {
        if nonce.len() != CHACHA_NONCE_SIZE {
            return Err(CryptoError::EncryptionFailed);
        }
        let tag = self
            .aead
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, payload)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let mut out = [0u8; AEAD_TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    fn open(
        &self,
        nonce: &[u8],
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        if nonce.len() != CHACHA_NONCE_SIZE || tag.len() != AEAD_TAG_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }
        self.aead
            .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, payload, Tag::from_slice(tag))
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// XChaCha20-Poly1305 (extended nonce).
pub struct XChaChaCipher {
    aead: XChaCha20Poly1305,
}

impl XChaChaCipher {
    /// Create from a 32-byte key.
    pub fn new(key: &CipherKey) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(key.key())),
        }
    }
}

impl PacketCipher for XChaChaCipher {
    fn kind(&self) -> CipherKind {
        CipherKind::XChaCha20Poly1305
    }

    fn seal(
        &self,
        nonce: &[u8],
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; AEAD_TAG_SIZE], CryptoError> {
        if nonce.len() != XCHACHA_NONCE_SIZE {
            return Err(CryptoError::EncryptionFailed);
        }
        let tag = self
            .aead
            .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, payload)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let mut out = [0u8; AEAD_TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    fn open(
        &self,
        nonce: &[u8],
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        if nonce.len() != XCHACHA_NONCE_SIZE || tag.len() != AEAD_TAG_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }
        self.aead
            .decrypt_in_place_detached(XNonce::from_slice(nonce), aad, payload, Tag::from_slice(tag))
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// Build the cipher for `kind` keyed with `key`.
pub fn new_cipher(kind: CipherKind, key: &CipherKey) -> Box<dyn PacketCipher> {
    match kind {
        CipherKind::ChaCha20Poly1305 => Box::new(ChaChaCipher::new(key)),
        CipherKind::XChaCha20Poly1305 => Box::new(XChaChaCipher::new(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> CipherKey {
        CipherKey::from_parts([byte; 32], [byte; 8])
    }

    #[test]
    fn test_overhead() {
        assert_eq!(CipherKind::ChaCha20Poly1305.overhead(), 4 + 16);
        assert_eq!(CipherKind::XChaCha20Poly1305.overhead(), 8 + 24 + 16);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        for kind in [CipherKind::ChaCha20Poly1305, CipherKind::XChaCha20Poly1305] {
            let cipher = new_cipher(kind, &key(0x42));
            let nonce = vec![0x01; kind.nonce_len()];
            let mut payload = b"Hello, tunnel!".to_vec();

            let tag = cipher.seal(&nonce, b"aad", &mut payload).unwrap();
            assert_ne!(payload, b"Hello, tunnel!");

            cipher.open(&nonce, b"aad", &mut payload, &tag).unwrap();
            assert_eq!(payload, b"Hello, tunnel!");
        }
    }

    #[test]
    fn test_open_wrong_aad_fails() {
        let cipher = new_cipher(CipherKind::ChaCha20Poly1305, &key(0x42));
        let nonce = [0x01; CHACHA_NONCE_SIZE];
        let mut payload = b"secret".to_vec();

        let tag = cipher.seal(&nonce, b"one", &mut payload).unwrap();
        assert_eq!(
            cipher.open(&nonce, b"two", &mut payload, &tag),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let sealer = new_cipher(CipherKind::XChaCha20Poly1305, &key(0x01));
        let opener = new_cipher(CipherKind::XChaCha20Poly1305, &key(0x02));
        let nonce = [0x07; XCHACHA_NONCE_SIZE];
        let mut payload = b"secret".to_vec();

        let tag = sealer.seal(&nonce, b"", &mut payload).unwrap();
        assert!(opener.open(&nonce, b"", &mut payload, &tag).is_err());
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let cipher = new_cipher(CipherKind::ChaCha20Poly1305, &key(0x42));
        let mut payload = b"x".to_vec();
        assert_eq!(
            cipher.seal(&[0u8; 24], b"", &mut payload),
            Err(CryptoError::EncryptionFailed)
        );
    }
}
