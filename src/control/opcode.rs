//! Datagram discriminator byte.
//!
//! ```text
//!   7       3 2   0
//! +---------+-----+
//! | opcode  | kid |
//! +---------+-----+
//! ```

use crate::core::{
    KEY_ID_BITS, KEY_ID_MASK, OP_ACK, OP_DATA, OP_HARD_RESET_CLIENT, OP_HARD_RESET_SERVER,
    OP_SOFT_RESET,
};

/// Packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Client starts a session (first key).
    HardResetClient,
    /// Server answers a handshake.
    HardResetServer,
    /// Client renegotiates a new key within a session.
    SoftReset,
    /// Handshake confirmation.
    Ack,
    /// Data-channel packet.
    Data,
}

impl Opcode {
    /// Numeric opcode.
    pub fn code(self) -> u8 {
        match self {
            Self::HardResetClient => OP_HARD_RESET_CLIENT,
            Self::HardResetServer => OP_HARD_RESET_SERVER,
            Self::SoftReset => OP_SOFT_RESET,
            Self::Ack => OP_ACK,
            Self::Data => OP_DATA,
        }
    }

    /// Parse a numeric opcode.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            OP_HARD_RESET_CLIENT => Some(Self::HardResetClient),
            OP_HARD_RESET_SERVER => Some(Self::HardResetServer),
            OP_SOFT_RESET => Some(Self::SoftReset),
            OP_ACK => Some(Self::Ack),
            OP_DATA => Some(Self::Data),
            _ => None,
        }
    }

    /// Whether packets with this opcode belong to the control channel.
    pub fn is_control(self) -> bool {
        self != Self::Data
    }
}

/// Opcode plus key id, as carried in the first byte of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Discriminator {
    /// Packet opcode.
    pub opcode: Opcode,
    /// Key id selecting the crypto context.
    pub key_id: u8,
}

impl Discriminator {
    /// Build a discriminator; the key id is masked to three bits.
    pub fn new(opcode: Opcode, key_id: u8) -> Self {
        Self {
            opcode,
            key_id: key_id & KEY_ID_MASK,
        }
    }

    /// Data packet for `key_id`.
    pub fn data(key_id: u8) -> Self {
        Self::new(Opcode::Data, key_id)
    }

    /// Wire byte.
    pub fn to_byte(self) -> u8 {
        (self.opcode.code() << KEY_ID_BITS) | self.key_id
    }

    /// Parse the wire byte. Unknown opcodes yield `None`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Opcode::from_code(byte >> KEY_ID_BITS).map(|opcode| Self {
            opcode,
            key_id: byte & KEY_ID_MASK,
        })
    }

    /// Whether the packet belongs to the control channel.
    pub fn is_control(self) -> bool {
        self.opcode.is_control()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_layout() {
        assert_eq!(Discriminator::data(0).to_byte(), 0x30);
        assert_eq!(Discriminator::data(5).to_byte(), 0x35);
        assert_eq!(Discriminator::new(Opcode::HardResetClient, 0).to_byte(), 0x08);
        assert_eq!(Discriminator::new(Opcode::Ack, 9).key_id, 1);
    }

    #[test]
    fn test_parse() {
        let d = Discriminator::from_byte(0x2b).unwrap();
        assert_eq!(d.opcode, Opcode::Ack);
        assert_eq!(d.key_id, 3);
        assert!(d.is_control());

        assert!(!Discriminator::from_byte(0x31).unwrap().is_control());
        assert_eq!(Discriminator::from_byte(0x00), None);
        assert_eq!(Discriminator::from_byte(0xF8), None);
    }
}
