//! Y-sync wire codec.
//!
//! # Protocol Overview
//!
//! The Y-sync protocol uses a two-phase handshake:
//!
//! 1. **SyncStep1**: a peer sends its state vector
//! 2. **SyncStep2**: the other peer answers with the updates that are missing
//!
//! After the handshake, updates are exchanged bidirectionally.
//!
//! # Wire Format (y-protocols compatible)
//!
//! Messages use varUint encoding (variable-length unsigned integers):
//! - `varUint(0)`: Sync message type
//!   - `varUint(0)`: SyncStep1 - contains state vector
//!   - `varUint(1)`: SyncStep2 - contains missing updates
//!   - `varUint(2)`: Update - contains incremental update
//! - `varUint(1)`: Awareness message (skipped)
//!
//! Byte arrays are encoded as: `varUint(length) + raw bytes`.
//!
//! A single frame may carry several complete messages back to back, e.g. a
//! SyncStep2 followed by a SyncStep1. [`SyncMessage::decode_all`] returns all
//! of them.
//!
//! Body frames on the multiplexed channel are prefixed with the entry path:
//! `varByteArray(utf8 path) + message bytes`.

use yrs::StateVector;
use yrs::updates::encoder::Encode;

use crate::error::{DiaryxError, Result};

// ===========================================================================
// VarUint encoding/decoding (y-protocols compatible)
// ===========================================================================

/// Write a variable-length unsigned integer to a buffer.
/// Uses 7 bits per byte, with MSB indicating continuation.
fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Read a variable-length unsigned integer.
/// Returns (value, bytes_consumed) or None if the buffer is too short.
fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

fn write_var_byte_array(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Returns (payload, bytes_consumed) or None if the buffer is too short.
fn read_var_byte_array(data: &[u8]) -> Option<(&[u8], usize)> {
    let (len, len_bytes) = read_var_uint(data)?;
    let total = len_bytes.checked_add(usize::try_from(len).ok()?)?;
    if data.len() < total {
        return None;
    }
    Some((&data[len_bytes..total], total))
}

/// Message type for the Y-sync protocol.
mod msg_type {
    pub const SYNC: u64 = 0;
    pub const AWARENESS: u64 = 1;
}

/// Sync sub-message types.
mod sync_type {
    pub const STEP1: u64 = 0;
    pub const STEP2: u64 = 1;
    pub const UPDATE: u64 = 2;
}

/// Y-sync message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// SyncStep1 contains a state vector
    SyncStep1(Vec<u8>),
    /// SyncStep2 contains missing updates
    SyncStep2(Vec<u8>),
    /// Update contains an incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    /// A SyncStep1 with an empty state vector, which asks the peer for its
    /// full state.
    pub fn full_state_request() -> Self {
        SyncMessage::SyncStep1(StateVector::default().encode_v1())
    }

    /// Encode the message.
    /// Format: varUint(msgType) + varUint(syncType) + varByteArray(payload)
    pub fn encode(&self) -> Vec<u8> {
        let (kind, payload) = match self {
            SyncMessage::SyncStep1(sv) => (sync_type::STEP1, sv),
            SyncMessage::SyncStep2(update) => (sync_type::STEP2, update),
            SyncMessage::Update(update) => (sync_type::UPDATE, update),
        };
        let mut buf = Vec::with_capacity(payload.len() + 6);
        write_var_uint(&mut buf, msg_type::SYNC);
        write_var_uint(&mut buf, kind);
        write_var_byte_array(&mut buf, payload);
        buf
    }

    /// Decode every complete message in a frame.
    ///
    /// Awareness messages are skipped. A truncated trailing message ends
    /// decoding; an unknown message or sync type is an error.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let rest = &data[offset..];
            let Some((kind, kind_len)) = read_var_uint(rest) else {
                break;
            };
            let rest = &rest[kind_len..];

            match kind {
                msg_type::SYNC => {
                    let Some((sub, sub_len)) = read_var_uint(rest) else {
                        break;
                    };
                    let Some((payload, payload_len)) = read_var_byte_array(&rest[sub_len..])
                    else {
                        log::debug!("[Y-sync] Truncated payload at offset {}", offset);
                        break;
                    };
                    let payload = payload.to_vec();
                    messages.push(match sub {
                        sync_type::STEP1 => SyncMessage::SyncStep1(payload),
                        sync_type::STEP2 => SyncMessage::SyncStep2(payload),
                        sync_type::UPDATE => SyncMessage::Update(payload),
                        other => {
                            return Err(DiaryxError::Crdt(format!("Unknown sync type: {}", other)));
                        }
                    });
                    offset += kind_len + sub_len + payload_len;
                }
                msg_type::AWARENESS => {
                    let Some((_, payload_len)) = read_var_byte_array(rest) else {
                        break;
                    };
                    offset += kind_len + payload_len;
                }
                other => {
                    return Err(DiaryxError::Crdt(format!("Unknown message type: {}", other)));
                }
            }
        }

        Ok(messages)
    }

    /// Encode several messages into one frame.
    pub fn encode_all(messages: &[SyncMessage]) -> Vec<u8> {
        messages.iter().flat_map(SyncMessage::encode).collect()
    }
}

/// Prefix a body message with the entry path it belongs to.
pub fn frame_body_message(path: &str, message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(path.len() + message.len() + 4);
    write_var_byte_array(&mut buf, path.as_bytes());
    buf.extend_from_slice(message);
    buf
}

/// Split a framed body message into its path and message bytes.
pub fn unframe_body_message(data: &[u8]) -> Result<(String, &[u8])> {
    let (path, consumed) = read_var_byte_array(data)
        .ok_or_else(|| DiaryxError::Crdt("Truncated body frame".to_string()))?;
    let path = std::str::from_utf8(path)
        .map_err(|e| DiaryxError::Crdt(format!("Body frame path is not UTF-8: {}", e)))?;
    Ok((path.to_string(), &data[consumed..]))
}
