// Packet codec — the 23-byte advertisement wire format
//
// Layout (header 2 bytes, content up to 21):
//   byte 0: bits 0..2 partNo, bits 3..5 totalParts, bit 6 repeat, bit 7 reserved
//   byte 1: bits 0..2 messageType, bits 3..5 priority, bits 6..7 reserved
//   byte 2..: per-type content

use super::types::{FlightUpdateType, Message, MessageType, Priority};
use super::CodecError;

/// Maximum content bytes in one advertisement
pub const MAX_CONTENT_LEN: usize = 21;

/// Packet header length
pub const HEADER_LEN: usize = 2;

/// Maximum total advertisement payload length
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_CONTENT_LEN;

/// Maximum parts representable by the 3-bit wire fields
pub const MAX_PARTS: usize = 7;

const REPEAT_BIT: u8 = 0x40;

/// One wire-level piece of a logical message.
///
/// For single-packet messages `part_no == total_parts == 1` and `message`
/// is the whole message; for split messages each fragment's `message`
/// carries that part's slice of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message: Message,
    pub part_no: u8,
    pub total_parts: u8,
}

impl Fragment {
    pub fn single(message: Message) -> Self {
        Self {
            message,
            part_no: 1,
            total_parts: 1,
        }
    }

    pub fn is_single(&self) -> bool {
        self.total_parts == 1
    }
}

/// Encode a fragment into advertisement payload bytes.
///
/// Content larger than [`MAX_CONTENT_LEN`] but at most twice it is truncated
/// with a warning; anything larger fails. Empty content fails.
pub fn encode(fragment: &Fragment) -> Result<Vec<u8>, CodecError> {
    if fragment.part_no == 0
        || fragment.total_parts == 0
        || fragment.part_no > fragment.total_parts
        || fragment.total_parts as usize > MAX_PARTS
    {
        return Err(CodecError::InvalidPartNumbering {
            part_no: fragment.part_no,
            total_parts: fragment.total_parts,
        });
    }

    let mut content = encode_content(&fragment.message);
    if content.is_empty() {
        return Err(CodecError::EmptyContent);
    }
    if content.len() > MAX_CONTENT_LEN {
        if content.len() > 2 * MAX_CONTENT_LEN {
            return Err(CodecError::PayloadTooLarge {
                len: content.len(),
                max: MAX_CONTENT_LEN,
            });
        }
        tracing::warn!(
            len = content.len(),
            max = MAX_CONTENT_LEN,
            "oversized packet content truncated"
        );
        content.truncate(MAX_CONTENT_LEN);
    }

    let part_info = (fragment.part_no & 0x07)
        | ((fragment.total_parts & 0x07) << 3)
        | if fragment.message.repeat() { REPEAT_BIT } else { 0 };
    let flags =
        (fragment.message.message_type().as_u8() & 0x07) | ((fragment.message.priority().as_u8() & 0x07) << 3);

    let mut buf = Vec::with_capacity(HEADER_LEN + content.len());
    buf.push(part_info);
    buf.push(flags);
    buf.extend_from_slice(&content);
    Ok(buf)
}

/// Decode advertisement payload bytes into a fragment.
///
/// Total over all inputs: returns `None` for anything malformed, never
/// panics. Text content is decoded lossily, so fragments whose byte split
/// landed inside a codepoint still parse.
pub fn decode(bytes: &[u8]) -> Option<Fragment> {
    if bytes.len() < HEADER_LEN || bytes.len() > MAX_PACKET_LEN {
        return None;
    }

    let part_info = bytes[0];
    let part_no = part_info & 0x07;
    let total_parts = (part_info >> 3) & 0x07;
    if part_no == 0 || total_parts == 0 || part_no > total_parts {
        return None;
    }
    let repeat = part_info & REPEAT_BIT != 0;

    let flags = bytes[1];
    let message_type = MessageType::from_bits(flags);
    let priority = Priority::from_bits(flags >> 3);

    let message = decode_content(message_type, repeat, priority, &bytes[HEADER_LEN..])?;
    Some(Fragment {
        message,
        part_no,
        total_parts,
    })
}

/// Per-type content encoding, unbounded. The packet encoder and the shared
/// snapshot writer both use this.
pub(crate) fn encode_content(message: &Message) -> Vec<u8> {
    match message {
        Message::GeneralBasic { content, .. } => content.clone(),
        Message::GeneralText { text, .. } => text.as_bytes().to_vec(),
        Message::FlightUpdate {
            flight_id,
            update_type,
            ..
        } => {
            let mut buf = Vec::with_capacity(1 + flight_id.len());
            buf.push(update_type.as_u8());
            buf.extend_from_slice(flight_id.as_bytes());
            buf
        }
        Message::FlightUpdateGeneral {
            flight_id, text, ..
        } => {
            let mut buf = Vec::with_capacity(1 + flight_id.len() + text.len());
            buf.push(flight_id.len() as u8);
            buf.extend_from_slice(flight_id.as_bytes());
            buf.extend_from_slice(text.as_bytes());
            buf
        }
    }
}

/// Per-type content decoding. Types without a defined content form decode
/// to `None`; missing fields default (`updateType = general`, empty flight
/// id) rather than failing.
pub(crate) fn decode_content(
    message_type: MessageType,
    repeat: bool,
    priority: Priority,
    content: &[u8],
) -> Option<Message> {
    match message_type {
        MessageType::GeneralBasic => Some(Message::GeneralBasic {
            content: content.to_vec(),
            repeat,
            priority,
        }),
        MessageType::GeneralText => Some(Message::GeneralText {
            text: String::from_utf8_lossy(content).into_owned(),
            repeat,
            priority,
        }),
        MessageType::FlightUpdate => {
            let (update_type, flight_id) = match content.split_first() {
                Some((first, rest)) => (
                    FlightUpdateType::from_u8(*first),
                    String::from_utf8_lossy(rest).into_owned(),
                ),
                None => (FlightUpdateType::General, String::new()),
            };
            Some(Message::FlightUpdate {
                flight_id,
                update_type,
                repeat,
                priority,
            })
        }
        MessageType::FlightUpdateGeneral => {
            let (len, rest) = content.split_first()?;
            let id_len = *len as usize;
            if id_len > rest.len() {
                return None;
            }
            Some(Message::FlightUpdateGeneral {
                flight_id: String::from_utf8_lossy(&rest[..id_len]).into_owned(),
                text: String::from_utf8_lossy(&rest[id_len..]).into_owned(),
                repeat,
                priority,
            })
        }
        MessageType::Unknown
        | MessageType::System
        | MessageType::Emergency
        | MessageType::Reserved => None,
    }
}

/// Split a logical message into wire fragments.
///
/// Basic and text content split at 21-byte chunks; flight text chunks are
/// shortened so every fragment repeats the flight id and its length prefix.
/// Text splits prefer the nearest codepoint boundary at or below the chunk
/// size so fragments stay valid UTF-8. A payload needing more than 7 parts
/// is refused: the 3-bit wire fields cannot represent it and wrapping would
/// misassemble at the receiver.
pub fn split(message: &Message) -> Result<Vec<Fragment>, CodecError> {
    match message {
        Message::FlightUpdate { .. } => Ok(vec![Fragment::single(message.clone())]),
        Message::GeneralBasic {
            content,
            repeat,
            priority,
        } => {
            if content.is_empty() {
                return Err(CodecError::EmptyContent);
            }
            let chunks: Vec<&[u8]> = content.chunks(MAX_CONTENT_LEN).collect();
            check_part_count(chunks.len())?;
            Ok(fragments_from(chunks.len(), |i| Message::GeneralBasic {
                content: chunks[i].to_vec(),
                repeat: *repeat,
                priority: *priority,
            }))
        }
        Message::GeneralText {
            text,
            repeat,
            priority,
        } => {
            if text.is_empty() {
                return Err(CodecError::EmptyContent);
            }
            let chunks = split_text(text, MAX_CONTENT_LEN);
            check_part_count(chunks.len())?;
            Ok(fragments_from(chunks.len(), |i| Message::GeneralText {
                text: chunks[i].clone(),
                repeat: *repeat,
                priority: *priority,
            }))
        }
        Message::FlightUpdateGeneral {
            flight_id,
            text,
            repeat,
            priority,
        } => {
            if text.is_empty() {
                return Err(CodecError::EmptyContent);
            }
            // Every chunk carries the length-prefixed flight id again.
            let overhead = flight_id.len() + 1;
            if overhead >= MAX_CONTENT_LEN {
                return Err(CodecError::PayloadTooLarge {
                    len: overhead,
                    max: MAX_CONTENT_LEN,
                });
            }
            let chunks = split_text(text, MAX_CONTENT_LEN - overhead);
            check_part_count(chunks.len())?;
            Ok(fragments_from(chunks.len(), |i| Message::FlightUpdateGeneral {
                flight_id: flight_id.clone(),
                text: chunks[i].clone(),
                repeat: *repeat,
                priority: *priority,
            }))
        }
    }
}

fn check_part_count(parts: usize) -> Result<(), CodecError> {
    if parts > MAX_PARTS {
        return Err(CodecError::TooManyParts { parts });
    }
    Ok(())
}

fn fragments_from(total: usize, mut part: impl FnMut(usize) -> Message) -> Vec<Fragment> {
    (0..total)
        .map(|i| Fragment {
            message: part(i),
            part_no: (i + 1) as u8,
            total_parts: total as u8,
        })
        .collect()
}

/// Split text at the largest codepoint boundary at or below `chunk_size`
/// bytes. Falls forward to the next boundary only when a single codepoint
/// is wider than the chunk, which can happen for flight texts with long
/// flight ids; the encoder's truncation rule then degrades that fragment.
fn split_text(text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= chunk_size {
            chunks.push(rest.to_string());
            break;
        }
        let mut cut = chunk_size;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = chunk_size;
            while !rest.is_char_boundary(cut) {
                cut += 1;
            }
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}
