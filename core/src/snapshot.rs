//! Shared snapshots — out-of-band export and import of received messages.
//!
//! A snapshot is a self-delimited binary stream carried in URL-safe
//! unpadded Base64, small enough for a deep link. Version 1 layout:
//!
//! ```text
//! byte 0:        version = 1
//! byte 1:        message count (0..=255)
//! per message:
//!   byte  +0:    flags (same layout as the packet flags byte)
//!   byte  +1:    shouldForward (0/1)
//!   bytes +2..3: content length, big-endian u16
//!   bytes +4..:  content (per-type packet encoding)
//! ```
//!
//! The packet repeat flag lives in the part-info byte, which snapshots do
//! not carry, so imported messages come back with `repeat = false`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

use crate::message::codec;
use crate::message::{Message, MessageType, Priority};

/// Current snapshot wire version
pub const SNAPSHOT_VERSION: u8 = 1;

/// Snapshot message count limit (one length byte)
pub const MAX_SNAPSHOT_MESSAGES: usize = 255;

/// Snapshot codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u8),

    #[error("snapshot truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("too many messages: {count} (max {max})", max = MAX_SNAPSHOT_MESSAGES)]
    TooManyMessages { count: usize },

    #[error("message {index} content too large: {len} bytes")]
    ContentTooLarge { index: usize, len: usize },

    #[error("message {index} has no decodable content")]
    InvalidContent { index: usize },

    #[error("invalid base64: {0}")]
    InvalidBase64(String),
}

/// One exported message plus its forward decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub message: Message,
    pub should_forward: bool,
}

/// Encode messages into a deep-linkable snapshot string.
pub fn encode(entries: &[SnapshotEntry]) -> Result<String, SnapshotError> {
    if entries.len() > MAX_SNAPSHOT_MESSAGES {
        return Err(SnapshotError::TooManyMessages {
            count: entries.len(),
        });
    }

    let mut buf = vec![SNAPSHOT_VERSION, entries.len() as u8];
    for (index, entry) in entries.iter().enumerate() {
        let content = codec::encode_content(&entry.message);
        if content.len() > u16::MAX as usize {
            return Err(SnapshotError::ContentTooLarge {
                index,
                len: content.len(),
            });
        }
        let flags = (entry.message.message_type().as_u8() & 0x07)
            | ((entry.message.priority().as_u8() & 0x07) << 3);
        buf.push(flags);
        buf.push(entry.should_forward as u8);
        buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
        buf.extend_from_slice(&content);
    }
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Decode a snapshot string back into entries.
pub fn decode(data: &str) -> Result<Vec<SnapshotEntry>, SnapshotError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim().as_bytes())
        .map_err(|e| SnapshotError::InvalidBase64(e.to_string()))?;
    if bytes.len() < 2 {
        return Err(SnapshotError::Truncated {
            need: 2,
            got: bytes.len(),
        });
    }
    if bytes[0] != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(bytes[0]));
    }

    let count = bytes[1] as usize;
    let mut entries = Vec::with_capacity(count);
    let mut cursor = 2;
    for index in 0..count {
        if cursor + 4 > bytes.len() {
            return Err(SnapshotError::Truncated {
                need: cursor + 4,
                got: bytes.len(),
            });
        }
        let flags = bytes[cursor];
        let should_forward = bytes[cursor + 1] != 0;
        let content_len = u16::from_be_bytes([bytes[cursor + 2], bytes[cursor + 3]]) as usize;
        cursor += 4;
        if cursor + content_len > bytes.len() {
            return Err(SnapshotError::Truncated {
                need: cursor + content_len,
                got: bytes.len(),
            });
        }
        let content = &bytes[cursor..cursor + content_len];
        cursor += content_len;

        let message_type = MessageType::from_bits(flags);
        let priority = Priority::from_bits(flags >> 3);
        let message = codec::decode_content(message_type, false, priority, content)
            .ok_or(SnapshotError::InvalidContent { index })?;
        entries.push(SnapshotEntry {
            message,
            should_forward,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FlightUpdateType;

    fn sample_entries() -> Vec<SnapshotEntry> {
        vec![
            SnapshotEntry {
                message: Message::text("Gate change: B12 to C3", false, Priority::Medium),
                should_forward: false,
            },
            SnapshotEntry {
                message: Message::flight_update(
                    "FL123",
                    FlightUpdateType::Delay,
                    false,
                    Priority::Urgent,
                ),
                should_forward: true,
            },
            SnapshotEntry {
                message: Message::basic(vec![0x00, 0xFF, 0x80, 0x7F], false, Priority::Low),
                should_forward: false,
            },
            SnapshotEntry {
                message: Message::flight_text("FL9", "crew swap at stand 14", false, Priority::High),
                should_forward: false,
            },
        ]
    }

    #[test]
    fn test_roundtrip() {
        let entries = sample_entries();
        let encoded = encode(&entries).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_empty_snapshot() {
        let encoded = encode(&[]).unwrap();
        assert_eq!(decode(&encoded).unwrap(), Vec::new());
    }

    #[test]
    fn test_output_is_url_safe() {
        let entries = vec![SnapshotEntry {
            // Content bytes chosen to produce '+' and '/' under standard base64
            message: Message::basic(vec![0xFB, 0xEF, 0xBE, 0xFF, 0xFE], false, Priority::Low),
            should_forward: false,
        }];
        let encoded = encode(&entries).unwrap();
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('='));
        assert_eq!(decode(&encoded).unwrap(), entries);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let bytes = vec![2u8, 0];
        let data = URL_SAFE_NO_PAD.encode(bytes);
        assert_eq!(
            decode(&data),
            Err(SnapshotError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_rejects_truncated_header() {
        let data = URL_SAFE_NO_PAD.encode([SNAPSHOT_VERSION]);
        assert!(matches!(
            decode(&data),
            Err(SnapshotError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_content_length_past_end() {
        // One message claiming 100 content bytes with none present
        let bytes = vec![SNAPSHOT_VERSION, 1, 0x02, 0, 0, 100];
        let data = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(
            decode(&data),
            Err(SnapshotError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_message() {
        // Count says two, stream carries one
        let entries = vec![SnapshotEntry {
            message: Message::text("only one", false, Priority::Low),
            should_forward: false,
        }];
        let encoded = encode(&entries).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).unwrap();
        bytes[1] = 2;
        let data = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(
            decode(&data),
            Err(SnapshotError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_invalid_base64() {
        assert!(matches!(
            decode("not!valid!base64!"),
            Err(SnapshotError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_rejects_too_many_messages() {
        let entries = vec![
            SnapshotEntry {
                message: Message::text("x", false, Priority::Low),
                should_forward: false,
            };
            256
        ];
        assert_eq!(
            encode(&entries),
            Err(SnapshotError::TooManyMessages { count: 256 })
        );
    }

    #[test]
    fn test_rejects_undecodable_content_type() {
        // flags byte 0x05 = system type, which has no content form
        let bytes = vec![SNAPSHOT_VERSION, 1, 0x05, 0, 0, 1, b'x'];
        let data = URL_SAFE_NO_PAD.encode(bytes);
        assert_eq!(
            decode(&data),
            Err(SnapshotError::InvalidContent { index: 0 })
        );
    }

    #[test]
    fn test_long_text_survives() {
        // Snapshot content is not limited to the 21-byte packet cap
        let entries = vec![SnapshotEntry {
            message: Message::text("long ".repeat(200), false, Priority::Medium),
            should_forward: false,
        }];
        let decoded = decode(&encode(&entries).unwrap()).unwrap();
        assert_eq!(decoded, entries);
    }
}
