//! Framing: `[sequence:16][type:8][payload]`, big-endian throughout.
//! Every field is read through a bounds-checked cursor; decoding never indexes past the buffer.

use crate::protocol::{
    clamp_text, Acknowledgement, EncryptedMessage, ExchangeStep, FileChunk, GlobalMessage,
    KeyExchange, Packet, PacketType, Payload, PeerId, Pulse, MAX_NAME_LEN,
};

/// Sequence (2 bytes) plus type tag (1 byte).
pub const HEADER_LEN: usize = 3;

/// Largest datagram the transport hands us.
pub const MAX_DATAGRAM_LEN: usize = 65_535;

/// Largest datagram a sender may produce: the UDP payload limit over IPv4.
pub const MAX_SEND_LEN: usize = 65_507;

/// Bytes a FileChunk adds around its data, name excluded.
pub const FILE_CHUNK_OVERHEAD: usize = HEADER_LEN + 13;

/// Bytes an EncryptedMessage adds around its ciphertext.
pub const ENCRYPTED_OVERHEAD: usize = HEADER_LEN + 10;

/// Error decoding a datagram into a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram shorter than the {HEADER_LEN}-byte header")]
    MalformedFrame,
    #[error("unknown packet type tag {0}")]
    UnknownType(u8),
    #[error("payload truncated")]
    TruncatedPayload,
    #[error("unknown key exchange step {0}")]
    UnknownExchangeStep(u8),
    #[error("chunk data exceeds declared file length")]
    LengthMismatch,
}

/// Encode a packet into one datagram. Total for in-range fields; names longer than
/// 255 bytes are cut on a character boundary.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(&packet.payload));
    out.extend_from_slice(&packet.sequence.to_be_bytes());
    out.push(packet.packet_type().tag());
    match &packet.payload {
        Payload::Pulse(p) => {
            let name = clamp_text(&p.name, MAX_NAME_LEN);
            put_id(&mut out, p.sender);
            out.push(name.len() as u8);
            out.push(p.level);
            out.extend_from_slice(name.as_bytes());
        }
        Payload::Acknowledgement(a) => {
            put_id(&mut out, a.sender);
            put_id(&mut out, a.recipient);
            out.extend_from_slice(&a.message_id.to_be_bytes());
            out.push(a.chunk_index);
        }
        Payload::KeyExchange(k) => {
            put_id(&mut out, k.sender);
            put_id(&mut out, k.recipient);
            out.push(k.step.tag());
            match k.step {
                ExchangeStep::Offer {
                    prime,
                    generator,
                    half_key,
                } => out.extend_from_slice(&[prime, generator, half_key]),
                ExchangeStep::Reply { half_key } => out.push(half_key),
                ExchangeStep::Rekey => {}
            }
        }
        Payload::EncryptedMessage(m) => {
            put_id(&mut out, m.sender);
            put_id(&mut out, m.recipient);
            out.extend_from_slice(&m.message_id.to_be_bytes());
            out.extend_from_slice(&(m.ciphertext.len() as u32).to_be_bytes());
            out.extend_from_slice(&m.ciphertext);
        }
        Payload::FileChunk(c) => {
            let name = clamp_text(&c.name, MAX_NAME_LEN);
            put_id(&mut out, c.sender);
            put_id(&mut out, c.recipient);
            out.extend_from_slice(&c.message_id.to_be_bytes());
            out.extend_from_slice(&c.total_length.to_be_bytes());
            out.push(c.file_id);
            out.push(c.chunk_index);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&c.data);
        }
        Payload::GlobalMessage(g) => {
            put_id(&mut out, g.sender);
            out.extend_from_slice(&g.message_id.to_be_bytes());
            out.extend_from_slice(&(g.text.len() as u32).to_be_bytes());
            out.extend_from_slice(g.text.as_bytes());
        }
    }
    out
}

/// Decode one datagram.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::MalformedFrame);
    }
    let mut r = Reader::new(bytes);
    let sequence = r.u16()?;
    let tag = r.u8()?;
    let ty = PacketType::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;
    let payload = match ty {
        PacketType::Pulse => {
            let sender = r.id()?;
            let name_len = r.u8()? as usize;
            let level = r.u8()?;
            let name = r.text(name_len)?;
            Payload::Pulse(Pulse {
                sender,
                level,
                name,
            })
        }
        PacketType::Acknowledgement => Payload::Acknowledgement(Acknowledgement {
            sender: r.id()?,
            recipient: r.id()?,
            message_id: r.u16()?,
            chunk_index: r.u8()?,
        }),
        PacketType::EncryptionPairExchange => {
            let sender = r.id()?;
            let recipient = r.id()?;
            let step = match r.u8()? {
                ExchangeStep::OFFER => ExchangeStep::Offer {
                    prime: r.u8()?,
                    generator: r.u8()?,
                    half_key: r.u8()?,
                },
                ExchangeStep::REPLY => ExchangeStep::Reply { half_key: r.u8()? },
                ExchangeStep::REKEY => ExchangeStep::Rekey,
                other => return Err(DecodeError::UnknownExchangeStep(other)),
            };
            Payload::KeyExchange(KeyExchange {
                sender,
                recipient,
                step,
            })
        }
        PacketType::EncryptedMessage => {
            let sender = r.id()?;
            let recipient = r.id()?;
            let message_id = r.u16()?;
            let len = r.u32()? as usize;
            let ciphertext = r.take(len)?.to_vec();
            Payload::EncryptedMessage(EncryptedMessage {
                sender,
                recipient,
                message_id,
                ciphertext,
            })
        }
        PacketType::FileChunk => {
            let sender = r.id()?;
            let recipient = r.id()?;
            let message_id = r.u16()?;
            let total_length = r.u32()?;
            let file_id = r.u8()?;
            let chunk_index = r.u8()?;
            let name_len = r.u8()? as usize;
            let name = r.text(name_len)?;
            let data = r.rest();
            if data.len() as u64 > u64::from(total_length) {
                return Err(DecodeError::LengthMismatch);
            }
            Payload::FileChunk(FileChunk {
                sender,
                recipient,
                message_id,
                total_length,
                file_id,
                chunk_index,
                name,
                data: data.to_vec(),
            })
        }
        PacketType::GlobalMessage => {
            let sender = r.id()?;
            let message_id = r.u16()?;
            let len = r.u32()? as usize;
            let text = r.text(len)?;
            Payload::GlobalMessage(GlobalMessage {
                sender,
                message_id,
                text,
            })
        }
    };
    Ok(Packet { sequence, payload })
}

fn put_id(out: &mut Vec<u8>, id: PeerId) {
    out.extend_from_slice(&id.0.to_be_bytes());
}

/// Exact size of the datagram [`encode`] produces for `payload`, header included.
pub fn encoded_len(payload: &Payload) -> usize {
    let body = match payload {
        Payload::Pulse(p) => 4 + clamp_text(&p.name, MAX_NAME_LEN).len(),
        Payload::Acknowledgement(_) => 7,
        Payload::KeyExchange(k) => match k.step {
            ExchangeStep::Offer { .. } => 8,
            ExchangeStep::Reply { .. } => 6,
            ExchangeStep::Rekey => 5,
        },
        Payload::EncryptedMessage(m) => 10 + m.ciphertext.len(),
        Payload::FileChunk(c) => 13 + clamp_text(&c.name, MAX_NAME_LEN).len() + c.data.len(),
        Payload::GlobalMessage(g) => 8 + g.text.len(),
    };
    HEADER_LEN + body
}

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(DecodeError::TruncatedPayload)?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(DecodeError::TruncatedPayload)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.array().map(u32::from_be_bytes)
    }

    fn id(&mut self) -> Result<PeerId, DecodeError> {
        self.u16().map(PeerId)
    }

    fn text(&mut self, len: usize) -> Result<String, DecodeError> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        self.pos = self.buf.len();
        rest
    }
}
