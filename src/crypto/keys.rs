//! Key material and derivation.
//!
//! - [`StaticKey`]: a pre-shared 64-byte secret, expanded per direction
//! - [`StaticKeypair`]: long-term X25519 identity for key negotiation
//! - [`derive_session_keys`]: per-negotiation data-channel keys
//!
//! All derivation is HKDF-SHA256. Secret bytes are zeroized on drop.

use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{
    CIPHER_KEY_SIZE, CryptoError, NONCE_SALT_SIZE, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE,
    SESSION_ID_SIZE, STATIC_KEY_SIZE,
};

/// HKDF info for static-key expansion.
const STATIC_KEY_INFO: &[u8] = b"tunnel-engine static data keys";

/// HKDF info prefix for negotiated data keys.
const SESSION_KEY_INFO: &[u8] = b"tunnel-engine session data keys";

/// HKDF info for the control-channel MAC key.
const CONTROL_AUTH_INFO: &[u8] = b"tunnel-engine control auth";

/// Bytes of one directional key: cipher key plus nonce salt.
const DIRECTIONAL_LEN: usize = CIPHER_KEY_SIZE + NONCE_SALT_SIZE;

/// A cipher key with its implicit nonce salt.
#[derive(Clone)]
pub struct CipherKey {
    key: [u8; CIPHER_KEY_SIZE],
    salt: [u8; NONCE_SALT_SIZE],
}

impl CipherKey {
    /// Create from raw parts.
    pub fn from_parts(key: [u8; CIPHER_KEY_SIZE], salt: [u8; NONCE_SALT_SIZE]) -> Self {
        Self { key, salt }
    }

    fn from_okm(okm: &[u8]) -> Self {
        let mut key = [0u8; CIPHER_KEY_SIZE];
        let mut salt = [0u8; NONCE_SALT_SIZE];
        key.copy_from_slice(&okm[..CIPHER_KEY_SIZE]);
        salt.copy_from_slice(&okm[CIPHER_KEY_SIZE..DIRECTIONAL_LEN]);
        Self { key, salt }
    }

    /// Raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn key(&self) -> &[u8; CIPHER_KEY_SIZE] {
        &self.key
    }

    /// Implicit nonce salt.
    pub fn salt(&self) -> &[u8; NONCE_SALT_SIZE] {
        &self.salt
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.salt.zeroize();
    }
}

/// The pair of keys one side uses.
#[derive(Clone)]
pub struct DirectionalKeys {
    /// Key for packets we send.
    pub encrypt: CipherKey,
    /// Key for packets we receive.
    pub decrypt: CipherKey,
}

/// Which half of an expanded static key is used for sending.
///
/// The two peers must use opposite directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDirection {
    /// Send with the first half, receive with the second.
    #[default]
    Normal,
    /// Send with the second half, receive with the first.
    Inverse,
}

/// A pre-shared static key.
#[derive(Clone)]
pub struct StaticKey {
    bytes: [u8; STATIC_KEY_SIZE],
}

impl StaticKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; STATIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Parse from a hex string (whitespace ignored).
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = hex::decode(compact).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; STATIC_KEY_SIZE] = decoded.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "static key must be {STATIC_KEY_SIZE} bytes, got {}",
                decoded.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; STATIC_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Hex encoding, for writing key files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Expand into the keys for one side.
    pub fn derive(&self, direction: KeyDirection) -> Result<DirectionalKeys, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut okm = [0u8; 2 * DIRECTIONAL_LEN];
        hk.expand(STATIC_KEY_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let first = CipherKey::from_okm(&okm[..DIRECTIONAL_LEN]);
        let second = CipherKey::from_okm(&okm[DIRECTIONAL_LEN..]);
        okm.zeroize();

        Ok(match direction {
            KeyDirection::Normal => DirectionalKeys {
                encrypt: first,
                decrypt: second,
            },
            KeyDirection::Inverse => DirectionalKeys {
                encrypt: second,
                decrypt: first,
            },
        })
    }
}

impl Drop for StaticKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// A static X25519 keypair for long-term identity.
///
/// The private key is zeroized on drop for security.
#[derive(Clone)]
pub struct StaticKeypair {
    /// Private key (32 bytes) - zeroized on drop
    private: [u8; PRIVATE_KEY_SIZE],
    /// Public key (32 bytes)
    public: [u8; PUBLIC_KEY_SIZE],
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_private(secret.to_bytes())
    }

    /// Create a keypair from a private key, deriving the public half.
    pub fn from_private(private: [u8; PRIVATE_KEY_SIZE]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(private)).to_bytes();
        Self { private, public }
    }

    /// Parse a hex-encoded private key.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_private(parse_key_hex(text)?))
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Get the private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }

    /// Compute DH(our_static, their_public).
    pub fn compute_dh(&self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let public = PublicKey::from(*remote_public);
        *secret.diffie_hellman(&public).as_bytes()
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// Parse a 32-byte hex key.
pub fn parse_key_hex(text: &str) -> Result<[u8; 32], CryptoError> {
    let decoded = hex::decode(text.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    decoded
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", decoded.len())))
}

/// Control-channel session id - 64-bit random identifier per negotiating peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub [u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_SIZE];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for SessionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Derive the MAC key for control packets from the static DH.
pub fn derive_control_auth_key(static_dh: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, static_dh);
    let mut key = [0u8; 32];
    hk.expand(CONTROL_AUTH_INFO, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

/// Derive data-channel keys for one negotiation.
///
/// IKM = ephemeral DH || static DH, salt = client sid || server sid,
/// info carries the key id. Returns `(client_to_server, server_to_client)`.
pub fn derive_session_keys(
    ephemeral_dh: &[u8; 32],
    static_dh: &[u8; 32],
    client_sid: &SessionId,
    server_sid: &SessionId,
    key_id: u8,
) -> Result<(CipherKey, CipherKey), CryptoError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ephemeral_dh);
    ikm[32..].copy_from_slice(static_dh);

    let mut salt = [0u8; 2 * SESSION_ID_SIZE];
    salt[..SESSION_ID_SIZE].copy_from_slice(client_sid.as_bytes());
    salt[SESSION_ID_SIZE..].copy_from_slice(server_sid.as_bytes());

    let mut info = SESSION_KEY_INFO.to_vec();
    info.push(key_id);

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 2 * DIRECTIONAL_LEN];
    let result = hk.expand(&info, &mut okm);
    ikm.zeroize();
    result.map_err(|_| CryptoError::KeyDerivationFailed)?;

    let c2s = CipherKey::from_okm(&okm[..DIRECTIONAL_LEN]);
    let s2c = CipherKey::from_okm(&okm[DIRECTIONAL_LEN..]);
    okm.zeroize();
    Ok((c2s, s2c))
}
