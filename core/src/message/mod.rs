//! Message model and packet codec
//!
//! This module provides:
//! - The logical message vocabulary (types, priorities, flight updates)
//! - The 23-byte advertisement packet codec (2-byte header + content)
//! - Splitting of large payloads into wire fragments
//! - The persisted history record form

pub mod codec;
pub mod types;

pub use codec::{decode, encode, split, Fragment, MAX_CONTENT_LEN, MAX_PACKET_LEN, MAX_PARTS};
pub use types::{FlightUpdateType, Message, MessageType, Priority, StoredMessage, StoredRecord};

use thiserror::Error;

/// Packet codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty message content")]
    EmptyContent,

    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid part numbering: part {part_no} of {total_parts}")]
    InvalidPartNumbering { part_no: u8, total_parts: u8 },

    #[error("message splits into {parts} parts (wire maximum {max})", max = MAX_PARTS)]
    TooManyParts { parts: usize },
}
