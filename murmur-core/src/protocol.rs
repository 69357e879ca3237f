//! Murmur wire protocol: packet types, payload variants and peer identifiers.

use std::fmt;

/// Longest name or file name that fits the 8-bit length prefix.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Numeric peer identity carried in every payload. Zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

impl PeerId {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type tag in the third header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Pulse = 0,
    Acknowledgement = 1,
    EncryptionPairExchange = 2,
    EncryptedMessage = 3,
    FileChunk = 4,
    GlobalMessage = 5,
}

impl PacketType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PacketType::Pulse,
            1 => PacketType::Acknowledgement,
            2 => PacketType::EncryptionPairExchange,
            3 => PacketType::EncryptedMessage,
            4 => PacketType::FileChunk,
            5 => PacketType::GlobalMessage,
            _ => return None,
        })
    }

    /// Whether packets of this type are tracked until the recipient acknowledges them.
    pub fn is_acknowledgable(self) -> bool {
        matches!(self, PacketType::EncryptedMessage | PacketType::FileChunk)
    }
}

/// One datagram. Immutable once built; the sequence number is assigned at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u16,
    pub payload: Payload,
}

impl Packet {
    pub fn new(sequence: u16, payload: Payload) -> Self {
        Self { sequence, payload }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }
}

/// Payload variants, one per type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Pulse(Pulse),
    Acknowledgement(Acknowledgement),
    KeyExchange(KeyExchange),
    EncryptedMessage(EncryptedMessage),
    FileChunk(FileChunk),
    GlobalMessage(GlobalMessage),
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::Pulse(_) => PacketType::Pulse,
            Payload::Acknowledgement(_) => PacketType::Acknowledgement,
            Payload::KeyExchange(_) => PacketType::EncryptionPairExchange,
            Payload::EncryptedMessage(_) => PacketType::EncryptedMessage,
            Payload::FileChunk(_) => PacketType::FileChunk,
            Payload::GlobalMessage(_) => PacketType::GlobalMessage,
        }
    }

    pub fn sender(&self) -> PeerId {
        match self {
            Payload::Pulse(p) => p.sender,
            Payload::Acknowledgement(a) => a.sender,
            Payload::KeyExchange(k) => k.sender,
            Payload::EncryptedMessage(m) => m.sender,
            Payload::FileChunk(c) => c.sender,
            Payload::GlobalMessage(g) => g.sender,
        }
    }

    /// Addressee of a pairwise payload; `None` for group-wide payloads.
    pub fn recipient(&self) -> Option<PeerId> {
        match self {
            Payload::Pulse(_) | Payload::GlobalMessage(_) => None,
            Payload::Acknowledgement(a) => Some(a.recipient),
            Payload::KeyExchange(k) => Some(k.recipient),
            Payload::EncryptedMessage(m) => Some(m.recipient),
            Payload::FileChunk(c) => Some(c.recipient),
        }
    }
}

/// Presence announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulse {
    pub sender: PeerId,
    pub level: u8,
    pub name: String,
}

/// Receipt for one acknowledgable packet. Text messages use chunk index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub message_id: u16,
    pub chunk_index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyExchange {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub step: ExchangeStep,
}

/// Diffie-Hellman negotiation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStep {
    /// Initiator's parameters together with its half-key.
    Offer {
        prime: u8,
        generator: u8,
        half_key: u8,
    },
    /// Responder's half-key for the adopted parameters.
    Reply { half_key: u8 },
    /// Sent by the responder that holds no secret for a peer; asks it to offer afresh.
    Rekey,
}

impl ExchangeStep {
    pub const OFFER: u8 = 0;
    pub const REPLY: u8 = 1;
    pub const REKEY: u8 = 2;

    pub fn tag(&self) -> u8 {
        match self {
            ExchangeStep::Offer { .. } => Self::OFFER,
            ExchangeStep::Reply { .. } => Self::REPLY,
            ExchangeStep::Rekey => Self::REKEY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub message_id: u16,
    pub ciphertext: Vec<u8>,
}

/// One fragment of a file. `chunk_index` counts down; the last fragment is 0.
/// `total_length` is the size of the whole file, repeated in every fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub message_id: u16,
    pub total_length: u32,
    pub file_id: u8,
    pub chunk_index: u8,
    pub name: String,
    pub data: Vec<u8>,
}

/// Unencrypted text for the whole group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalMessage {
    pub sender: PeerId,
    pub message_id: u16,
    pub text: String,
}

/// Cut `text` to at most `max` bytes without splitting a UTF-8 sequence.
pub fn clamp_text(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_roundtrip() {
        for tag in 0..=5u8 {
            let ty = PacketType::from_tag(tag).unwrap();
            assert_eq!(ty.tag(), tag);
        }
        assert_eq!(PacketType::from_tag(6), None);
        assert_eq!(PacketType::from_tag(0xff), None);
    }

    #[test]
    fn only_messages_and_chunks_are_acknowledgable() {
        assert!(PacketType::EncryptedMessage.is_acknowledgable());
        assert!(PacketType::FileChunk.is_acknowledgable());
        assert!(!PacketType::Pulse.is_acknowledgable());
        assert!(!PacketType::Acknowledgement.is_acknowledgable());
        assert!(!PacketType::EncryptionPairExchange.is_acknowledgable());
        assert!(!PacketType::GlobalMessage.is_acknowledgable());
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        assert_eq!(clamp_text("hello", 10), "hello");
        assert_eq!(clamp_text("hello", 3), "hel");
        // 'é' is two bytes; cutting at 2 would split it.
        assert_eq!(clamp_text("aé", 2), "a");
        let long = "x".repeat(300);
        assert_eq!(clamp_text(&long, MAX_NAME_LEN).len(), MAX_NAME_LEN);
    }

    #[test]
    fn group_payloads_have_no_recipient() {
        let pulse = Payload::Pulse(Pulse {
            sender: PeerId(3),
            level: 1,
            name: "ann".into(),
        });
        assert_eq!(pulse.recipient(), None);
        assert_eq!(pulse.sender(), PeerId(3));
        let ack = Payload::Acknowledgement(Acknowledgement {
            sender: PeerId(3),
            recipient: PeerId(4),
            message_id: 9,
            chunk_index: 0,
        });
        assert_eq!(ack.recipient(), Some(PeerId(4)));
    }
}
