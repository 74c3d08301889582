//! Key-exchange messages carried on the control channel.
//!
//! All messages start with the discriminator byte and a [`ControlStamp`],
//! and end with a BLAKE2s-256 MAC keyed from the static X25519 agreement,
//! which authenticates both peers. The stamp is under the MAC, so a
//! captured message cannot be re-stamped.
//!
//! ```text
//! ClientHello  [op|kid][epoch 4][pid 4][client_sid 8][ephemeral 32][mac 32]
//! ServerHello  [op|kid][epoch 4][pid 4][server_sid 8][client_sid 8][ephemeral 32][mac 32]
//! Ack          [op|kid][epoch 4][pid 4][client_sid 8][server_sid 8][mac 32]
//! ```
//!
//! A ClientHello uses `HardResetClient` for the first key of a session and
//! `SoftReset` for renegotiations.

use blake2::Blake2sMac256;
use blake2::digest::{KeyInit, Mac};

use crate::core::{
    CONTROL_MAC_SIZE, CONTROL_STAMP_SIZE, ControlError, PUBLIC_KEY_SIZE, SESSION_ID_SIZE,
};
use crate::crypto::SessionId;

use super::opcode::{Discriminator, Opcode};

/// Replay stamp carried by every control message.
///
/// `epoch` is the sender's start time in Unix seconds and only moves
/// forward; `packet_id` counts up from 1 within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStamp {
    /// Sender's epoch.
    pub epoch: u32,
    /// Packet id within the epoch.
    pub packet_id: u32,
}

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client proposes a key.
    ClientHello {
        /// Key id being negotiated.
        key_id: u8,
        /// Client's id for this negotiation.
        client_sid: SessionId,
        /// Client's ephemeral public key.
        ephemeral: [u8; PUBLIC_KEY_SIZE],
    },
    /// Server accepts a proposal.
    ServerHello {
        /// Key id being negotiated.
        key_id: u8,
        /// Server's id for this negotiation.
        server_sid: SessionId,
        /// Echo of the client's id.
        client_sid: SessionId,
        /// Server's ephemeral public key.
        ephemeral: [u8; PUBLIC_KEY_SIZE],
    },
    /// Client confirms the key is installed.
    Ack {
        /// Key id confirmed.
        key_id: u8,
        /// Client's id.
        client_sid: SessionId,
        /// Server's id.
        server_sid: SessionId,
    },
}

impl ControlMessage {
    /// Key id the message refers to.
    pub fn key_id(&self) -> u8 {
        match self {
            Self::ClientHello { key_id, .. }
            | Self::ServerHello { key_id, .. }
            | Self::Ack { key_id, .. } => *key_id,
        }
    }

    fn discriminator(&self) -> Discriminator {
        let opcode = match self {
            Self::ClientHello { key_id: 0, .. } => Opcode::HardResetClient,
            Self::ClientHello { .. } => Opcode::SoftReset,
            Self::ServerHello { .. } => Opcode::HardResetServer,
            Self::Ack { .. } => Opcode::Ack,
        };
        Discriminator::new(opcode, self.key_id())
    }

    /// Serialize under `stamp` and MAC.
    pub fn encode(&self, stamp: ControlStamp, mac_key: &[u8; 32]) -> Result<Vec<u8>, ControlError> {
        let mut out = Vec::with_capacity(
            1 + CONTROL_STAMP_SIZE + 2 * SESSION_ID_SIZE + PUBLIC_KEY_SIZE + CONTROL_MAC_SIZE,
        );
        out.push(self.discriminator().to_byte());
        out.extend_from_slice(&stamp.epoch.to_be_bytes());
        out.extend_from_slice(&stamp.packet_id.to_be_bytes());
        match self {
            Self::ClientHello {
                client_sid,
                ephemeral,
                ..
            } => {
                out.extend_from_slice(client_sid.as_bytes());
                out.extend_from_slice(ephemeral);
            }
            Self::ServerHello {
                server_sid,
                client_sid,
                ephemeral,
                ..
            } => {
                out.extend_from_slice(server_sid.as_bytes());
                out.extend_from_slice(client_sid.as_bytes());
                out.extend_from_slice(ephemeral);
            }
            Self::Ack {
                client_sid,
                server_sid,
                ..
            } => {
                out.extend_from_slice(client_sid.as_bytes());
                out.extend_from_slice(server_sid.as_bytes());
            }
        }
        let tag = compute_mac(mac_key, &out)?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify the MAC and parse. The caller checks the stamp for replay.
    pub fn decode(packet: &[u8], mac_key: &[u8; 32]) -> Result<(Self, ControlStamp), ControlError> {
        if packet.len() < 1 + CONTROL_STAMP_SIZE + CONTROL_MAC_SIZE {
            return Err(ControlError::Malformed("too short"));
        }
        let (body, tag) = packet.split_at(packet.len() - CONTROL_MAC_SIZE);
        verify_mac(mac_key, body, tag)?;

        let disc = Discriminator::from_byte(body[0]).ok_or(ControlError::Malformed("opcode"))?;
        let mut reader = Reader::new(&body[1..]);
        let stamp = ControlStamp {
            epoch: u32::from_be_bytes(reader.take()?),
            packet_id: u32::from_be_bytes(reader.take()?),
        };
        let key_id = disc.key_id;

        let msg = match disc.opcode {
            Opcode::HardResetClient | Opcode::SoftReset => {
                if (disc.opcode == Opcode::HardResetClient) != (key_id == 0) {
                    return Err(ControlError::Malformed("reset opcode and key id disagree"));
                }
                Self::ClientHello {
                    key_id,
                    client_sid: reader.session_id()?,
                    ephemeral: reader.public_key()?,
                }
            }
            Opcode::HardResetServer => Self::ServerHello {
                key_id,
                server_sid: reader.session_id()?,
                client_sid: reader.session_id()?,
                ephemeral: reader.public_key()?,
            },
            Opcode::Ack => Self::Ack {
                key_id,
                client_sid: reader.session_id()?,
                server_sid: reader.session_id()?,
            },
            Opcode::Data => return Err(ControlError::Malformed("data opcode")),
        };
        reader.finish()?;
        Ok((msg, stamp))
    }
}

fn new_mac(key: &[u8; 32]) -> Result<Blake2sMac256, ControlError> {
    <Blake2sMac256 as KeyInit>::new_from_slice(key).map_err(|_| ControlError::Malformed("mac key"))
}

fn compute_mac(key: &[u8; 32], data: &[u8]) -> Result<[u8; CONTROL_MAC_SIZE], ControlError> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    let mut out = [0u8; CONTROL_MAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn verify_mac(key: &[u8; 32], data: &[u8], tag: &[u8]) -> Result<(), ControlError> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| ControlError::BadMac)
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ControlError> {
        if self.data.len() < N {
            return Err(ControlError::Malformed("truncated field"));
        }
        let (head, rest) = self.data.split_at(N);
        self.data = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn session_id(&mut self) -> Result<SessionId, ControlError> {
        self.take::<SESSION_ID_SIZE>().map(SessionId::from_bytes)
    }

    fn public_key(&mut self) -> Result<[u8; PUBLIC_KEY_SIZE], ControlError> {
        self.take::<PUBLIC_KEY_SIZE>()
    }

    fn finish(self) -> Result<(), ControlError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(ControlError::Malformed("trailing bytes"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x11; 32];
    const STAMP: ControlStamp = ControlStamp {
        epoch: 1_700_000_000,
        packet_id: 9,
    };

    fn hello(key_id: u8) -> ControlMessage {
        ControlMessage::ClientHello {
            key_id,
            client_sid: SessionId::from_bytes([1; 8]),
            ephemeral: [2; 32],
        }
    }

    #[test]
    fn test_client_hello_opcodes() {
        let first = hello(0).encode(STAMP, &KEY).unwrap();
        assert_eq!(first[0], 0x08);
        assert_eq!(first.len(), 1 + 8 + 8 + 32 + 32);
        assert_eq!(&first[5..9], &9u32.to_be_bytes());

        let renegotiate = hello(3).encode(STAMP, &KEY).unwrap();
        assert_eq!(renegotiate[0], (3 << 3) | 3);
    }

    #[test]
    fn test_decode_each_message() {
        let messages = [
            hello(0),
            ControlMessage::ServerHello {
                key_id: 2,
                server_sid: SessionId::from_bytes([3; 8]),
                client_sid: SessionId::from_bytes([4; 8]),
                ephemeral: [5; 32],
            },
            ControlMessage::Ack {
                key_id: 7,
                client_sid: SessionId::from_bytes([6; 8]),
                server_sid: SessionId::from_bytes([7; 8]),
            },
        ];
        for msg in messages {
            let wire = msg.encode(STAMP, &KEY).unwrap();
            assert_eq!(ControlMessage::decode(&wire, &KEY).unwrap(), (msg, STAMP));
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let wire = hello(0).encode(STAMP, &KEY).unwrap();
        assert!(matches!(
            ControlMessage::decode(&wire, &[0x22; 32]),
            Err(ControlError::BadMac)
        ));
    }

    #[test]
    fn test_tampered_rejected() {
        let mut wire = hello(1).encode(STAMP, &KEY).unwrap();
        wire[5] ^= 0x80;
        assert!(matches!(
            ControlMessage::decode(&wire, &KEY),
            Err(ControlError::BadMac)
        ));
        assert!(matches!(
            ControlMessage::decode(&wire[..10], &KEY),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn test_stamp_is_authenticated() {
        let mut wire = hello(0).encode(STAMP, &KEY).unwrap();
        // Bump the packet id without re-computing the MAC
        wire[8] = 10;
        assert!(matches!(
            ControlMessage::decode(&wire, &KEY),
            Err(ControlError::BadMac)
        ));
    }
}
