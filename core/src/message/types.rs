// Message types — the vocabulary of the Vuelink mesh

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message category carried in bits 0..2 of the packet flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum MessageType {
    Unknown = 0,
    GeneralBasic = 1,
    GeneralText = 2,
    FlightUpdate = 3,
    FlightUpdateGeneral = 4,
    System = 5,
    Emergency = 6,
    Reserved = 7,
}

impl MessageType {
    /// Convert from the 3-bit wire field. Total over the masked range.
    pub fn from_bits(value: u8) -> Self {
        match value & 0x07 {
            1 => MessageType::GeneralBasic,
            2 => MessageType::GeneralText,
            3 => MessageType::FlightUpdate,
            4 => MessageType::FlightUpdateGeneral,
            5 => MessageType::System,
            6 => MessageType::Emergency,
            7 => MessageType::Reserved,
            _ => MessageType::Unknown,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Message priority carried in bits 3..5 of the packet flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Urgent = 3,
    Emergency = 4,
    System = 5,
    Test = 6,
    Reserved = 7,
}

impl Priority {
    pub fn from_bits(value: u8) -> Self {
        match value & 0x07 {
            1 => Priority::Medium,
            2 => Priority::High,
            3 => Priority::Urgent,
            4 => Priority::Emergency,
            5 => Priority::System,
            6 => Priority::Test,
            7 => Priority::Reserved,
            _ => Priority::Low,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Urgent and emergency traffic is forwarded even without the repeat flag.
    pub fn is_escalated(&self) -> bool {
        matches!(self, Priority::Urgent | Priority::Emergency)
    }
}

/// Kind of flight-operations update, byte-sized on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum FlightUpdateType {
    General = 0,
    GateChange = 1,
    Boarding = 2,
    Delay = 3,
    Cancellation = 4,
    Emergency = 5,
}

impl FlightUpdateType {
    /// Convert from the wire byte. Unknown values fall back to `General`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => FlightUpdateType::GateChange,
            2 => FlightUpdateType::Boarding,
            3 => FlightUpdateType::Delay,
            4 => FlightUpdateType::Cancellation,
            5 => FlightUpdateType::Emergency,
            _ => FlightUpdateType::General,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// A logical Vuelink message.
///
/// This is what hosts compose and subscribers receive. Part numbering is a
/// wire-level concern: the codec assigns it while splitting, and fragments
/// carry it in [`Fragment`](crate::message::Fragment) until reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Free-form bytes, single- or multi-packet
    GeneralBasic {
        content: Vec<u8>,
        repeat: bool,
        priority: Priority,
    },
    /// Free-form UTF-8 text, single- or multi-packet
    GeneralText {
        text: String,
        repeat: bool,
        priority: Priority,
    },
    /// Structured flight event, always single-packet
    FlightUpdate {
        flight_id: String,
        update_type: FlightUpdateType,
        repeat: bool,
        priority: Priority,
    },
    /// Flight-scoped free text, single- or multi-packet
    FlightUpdateGeneral {
        flight_id: String,
        text: String,
        repeat: bool,
        priority: Priority,
    },
}

impl Message {
    pub fn basic(content: impl Into<Vec<u8>>, repeat: bool, priority: Priority) -> Self {
        Message::GeneralBasic {
            content: content.into(),
            repeat,
            priority,
        }
    }

    pub fn text(text: impl Into<String>, repeat: bool, priority: Priority) -> Self {
        Message::GeneralText {
            text: text.into(),
            repeat,
            priority,
        }
    }

    pub fn flight_update(
        flight_id: impl Into<String>,
        update_type: FlightUpdateType,
        repeat: bool,
        priority: Priority,
    ) -> Self {
        Message::FlightUpdate {
            flight_id: flight_id.into(),
            update_type,
            repeat,
            priority,
        }
    }

    pub fn flight_text(
        flight_id: impl Into<String>,
        text: impl Into<String>,
        repeat: bool,
        priority: Priority,
    ) -> Self {
        Message::FlightUpdateGeneral {
            flight_id: flight_id.into(),
            text: text.into(),
            repeat,
            priority,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::GeneralBasic { .. } => MessageType::GeneralBasic,
            Message::GeneralText { .. } => MessageType::GeneralText,
            Message::FlightUpdate { .. } => MessageType::FlightUpdate,
            Message::FlightUpdateGeneral { .. } => MessageType::FlightUpdateGeneral,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Message::GeneralBasic { priority, .. }
            | Message::GeneralText { priority, .. }
            | Message::FlightUpdate { priority, .. }
            | Message::FlightUpdateGeneral { priority, .. } => *priority,
        }
    }

    pub fn repeat(&self) -> bool {
        match self {
            Message::GeneralBasic { repeat, .. }
            | Message::GeneralText { repeat, .. }
            | Message::FlightUpdate { repeat, .. }
            | Message::FlightUpdateGeneral { repeat, .. } => *repeat,
        }
    }

    /// Copy of this message with the repeat flag replaced. The forwarder
    /// forces `repeat = true` on every rebroadcast.
    pub fn with_repeat(&self, repeat: bool) -> Self {
        let mut msg = self.clone();
        match &mut msg {
            Message::GeneralBasic { repeat: r, .. }
            | Message::GeneralText { repeat: r, .. }
            | Message::FlightUpdate { repeat: r, .. }
            | Message::FlightUpdateGeneral { repeat: r, .. } => *r = repeat,
        }
        msg
    }

    /// Whether the codec may split this message across packets.
    /// `FlightUpdate` is structurally single-packet.
    pub fn is_splittable(&self) -> bool {
        !matches!(self, Message::FlightUpdate { .. })
    }

    /// Content equivalence for duplicate suppression.
    ///
    /// Compares only the semantic payload: equal message type plus the
    /// type-specific fields. Repeat flag, priority, part numbering, receive
    /// timestamps and radio metadata are all excluded.
    pub fn content_eq(&self, other: &Message) -> bool {
        match (self, other) {
            (
                Message::GeneralBasic { content: a, .. },
                Message::GeneralBasic { content: b, .. },
            ) => a == b,
            (Message::GeneralText { text: a, .. }, Message::GeneralText { text: b, .. }) => a == b,
            (
                Message::FlightUpdate {
                    flight_id: fa,
                    update_type: ua,
                    ..
                },
                Message::FlightUpdate {
                    flight_id: fb,
                    update_type: ub,
                    ..
                },
            ) => fa == fb && ua == ub,
            (
                Message::FlightUpdateGeneral {
                    flight_id: fa,
                    text: ta,
                    ..
                },
                Message::FlightUpdateGeneral {
                    flight_id: fb,
                    text: tb,
                    ..
                },
            ) => fa == fb && ta == tb,
            _ => false,
        }
    }
}

/// A message accepted into the local history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: Message,
    pub received_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(message: Message, received_at: DateTime<Utc>) -> Self {
        Self {
            message,
            received_at,
        }
    }
}

/// Persisted form of a [`StoredMessage`].
///
/// One JSON object per entry; entries are parsed independently so one
/// corrupt record never poisons the rest of the log. Enums are stored by
/// symbolic name, binary content base64-encoded. Unknown fields are ignored
/// on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    pub priority: Priority,
    #[serde(rename = "updateType", default, skip_serializing_if = "Option::is_none")]
    pub update_type: Option<FlightUpdateType>,
    #[serde(rename = "repeatFlag")]
    pub repeat_flag: bool,
    #[serde(rename = "partNumber")]
    pub part_number: u8,
    #[serde(rename = "totalParts")]
    pub total_parts: u8,
    #[serde(rename = "flightId", default, skip_serializing_if = "Option::is_none")]
    pub flight_id: Option<String>,
    #[serde(rename = "textContent", default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(rename = "content_base64", default, skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
    #[serde(rename = "receivedTimestamp")]
    pub received_timestamp: DateTime<Utc>,
}

impl From<&StoredMessage> for StoredRecord {
    fn from(stored: &StoredMessage) -> Self {
        let mut record = StoredRecord {
            message_type: stored.message.message_type(),
            priority: stored.message.priority(),
            update_type: None,
            repeat_flag: stored.message.repeat(),
            part_number: 1,
            total_parts: 1,
            flight_id: None,
            text_content: None,
            content_base64: None,
            received_timestamp: stored.received_at,
        };
        match &stored.message {
            Message::GeneralBasic { content, .. } => {
                record.content_base64 = Some(BASE64.encode(content));
            }
            Message::GeneralText { text, .. } => {
                record.text_content = Some(text.clone());
            }
            Message::FlightUpdate {
                flight_id,
                update_type,
                ..
            } => {
                record.flight_id = Some(flight_id.clone());
                record.update_type = Some(*update_type);
            }
            Message::FlightUpdateGeneral {
                flight_id, text, ..
            } => {
                record.flight_id = Some(flight_id.clone());
                record.text_content = Some(text.clone());
            }
        }
        record
    }
}

impl StoredRecord {
    /// Rehydrate the stored message. Fails on records whose message type has
    /// no content form, or whose required content field is absent.
    pub fn into_stored(self) -> Result<StoredMessage, String> {
        let message = match self.message_type {
            MessageType::GeneralBasic => {
                let encoded = self
                    .content_base64
                    .ok_or_else(|| "basic record without content".to_string())?;
                let content = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| format!("invalid base64 content: {e}"))?;
                Message::GeneralBasic {
                    content,
                    repeat: self.repeat_flag,
                    priority: self.priority,
                }
            }
            MessageType::GeneralText => Message::GeneralText {
                text: self
                    .text_content
                    .ok_or_else(|| "text record without text".to_string())?,
                repeat: self.repeat_flag,
                priority: self.priority,
            },
            MessageType::FlightUpdate => Message::FlightUpdate {
                flight_id: self.flight_id.unwrap_or_default(),
                update_type: self.update_type.unwrap_or(FlightUpdateType::General),
                repeat: self.repeat_flag,
                priority: self.priority,
            },
            MessageType::FlightUpdateGeneral => Message::FlightUpdateGeneral {
                flight_id: self.flight_id.unwrap_or_default(),
                text: self
                    .text_content
                    .ok_or_else(|| "flight text record without text".to_string())?,
                repeat: self.repeat_flag,
                priority: self.priority,
            },
            other => return Err(format!("unsupported stored message type: {other:?}")),
        };
        Ok(StoredMessage {
            message,
            received_at: self.received_timestamp,
        })
    }
}
