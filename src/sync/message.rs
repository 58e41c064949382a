//! Sync wire messages.
//!
//! Every message travels in one frame:
//!
//! ```text
//! +0  Protocol version (2 bytes LE16)
//! +2  Message type (1 byte)
//! +3  Payload length (4 bytes LE32)
//! +7  Payload (variable)
//! ```
//!
//! Payloads:
//!
//! ```text
//! HELLO        author (8 bytes LE64) + version vector
//! VECTOR       version vector
//! PATCH_BATCH  batch seq (8 bytes LE64) + flags (1 byte) + patch frame
//! ACK          version vector
//! ERROR        fault code (2 bytes LE16) + detail length (2 bytes LE16) + UTF-8 detail
//! ```

use thiserror::Error;

use crate::core::{
    AuthorId, DecodeError, FRAME_HEADER_SIZE, FaultCode, MAX_FRAME_PAYLOAD, MSG_TYPE_ACK,
    MSG_TYPE_ERROR, MSG_TYPE_HELLO, MSG_TYPE_PATCH_BATCH, MSG_TYPE_VECTOR, MalformedPatchError,
    PATCH_FLAG_FINAL, PATCH_FLAG_STATE, PROTOCOL_VERSION, SyncError, VersionVector,
};

/// Longest ERROR detail carried on the wire.
const MAX_ERROR_DETAIL: usize = 1024;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Opening greeting from the dialing side.
    Hello {
        /// Sender's author id.
        author: AuthorId,
        /// Everything the sender has observed.
        vector: VersionVector,
    },
    /// Reply to HELLO with the responder's version vector.
    Vector(VersionVector),
    /// Codec-encoded operations.
    PatchBatch {
        /// Per-session batch sequence number.
        seq: u64,
        /// Batch flags (`PATCH_FLAG_FINAL`, `PATCH_FLAG_STATE`).
        flags: u8,
        /// Patch frame, delta-encoded against the receiver's announced vector.
        patch: Vec<u8>,
    },
    /// Everything the sender has applied.
    Ack(VersionVector),
    /// Fault report; the sender closes the session after it.
    Error {
        /// Machine-readable code.
        code: FaultCode,
        /// Human-readable detail.
        detail: String,
    },
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u16,
    /// Message type.
    pub msg_type: u8,
    /// Payload length.
    pub payload_len: usize,
}

impl FrameHeader {
    /// Parse and bound-check a frame header.
    pub fn parse(data: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, MessageError> {
        let version = u16::from_le_bytes([data[0], data[1]]);
        if version != PROTOCOL_VERSION {
            return Err(MessageError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let payload_len = u32::from_le_bytes([data[3], data[4], data[5], data[6]]) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(MessageError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            version,
            msg_type: data[2],
            payload_len,
        })
    }
}

impl Message {
    /// Wire message type.
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Hello { .. } => MSG_TYPE_HELLO,
            Message::Vector(_) => MSG_TYPE_VECTOR,
            Message::PatchBatch { .. } => MSG_TYPE_PATCH_BATCH,
            Message::Ack(_) => MSG_TYPE_ACK,
            Message::Error { .. } => MSG_TYPE_ERROR,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Vector(_) => "VECTOR",
            Message::PatchBatch { .. } => "PATCH_BATCH",
            Message::Ack(_) => "ACK",
            Message::Error { .. } => "ERROR",
        }
    }

    /// Whether this is the last batch of a catch-up stream.
    pub fn is_final(&self) -> bool {
        matches!(self, Message::PatchBatch { flags, .. } if flags & PATCH_FLAG_FINAL != 0)
    }

    /// Encode to a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Hello { author, vector } => {
                payload.extend_from_slice(&author.0.to_le_bytes());
                vector.encode_into(&mut payload);
            }
            Message::Vector(vector) | Message::Ack(vector) => vector.encode_into(&mut payload),
            Message::PatchBatch { seq, flags, patch } => {
                payload.extend_from_slice(&seq.to_le_bytes());
                payload.push(*flags);
                payload.extend_from_slice(patch);
            }
            Message::Error { code, detail } => {
                let detail = truncate_utf8(detail, MAX_ERROR_DETAIL);
                payload.extend_from_slice(&code.to_u16().to_le_bytes());
                payload.extend_from_slice(&(detail.len() as u16).to_le_bytes());
                payload.extend_from_slice(detail.as_bytes());
            }
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        frame.push(self.msg_type());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode one complete frame.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        let header_bytes: &[u8; FRAME_HEADER_SIZE] = data
            .get(..FRAME_HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or(MessageError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            })?;
        let header = FrameHeader::parse(header_bytes)?;
        let payload = &data[FRAME_HEADER_SIZE..];
        if payload.len() != header.payload_len {
            return Err(MessageError::LengthMismatch {
                header: header.payload_len,
                actual: payload.len(),
            });
        }
        Self::decode_payload(header.msg_type, payload)
    }

    /// Decode a payload whose header has already been parsed.
    pub fn decode_payload(msg_type: u8, payload: &[u8]) -> Result<Self, MessageError> {
        let msg = match msg_type {
            MSG_TYPE_HELLO => {
                let author = AuthorId(read_u64(payload, 0)?);
                let vector = decode_vector_exact(&payload[8..])?;
                Message::Hello { author, vector }
            }
            MSG_TYPE_VECTOR => Message::Vector(decode_vector_exact(payload)?),
            MSG_TYPE_ACK => Message::Ack(decode_vector_exact(payload)?),
            MSG_TYPE_PATCH_BATCH => {
                let seq = read_u64(payload, 0)?;
                let flags = *payload.get(8).ok_or(MessageError::TooShort {
                    expected: 9,
                    actual: payload.len(),
                })?;
                if flags & !(PATCH_FLAG_FINAL | PATCH_FLAG_STATE) != 0 {
                    return Err(MessageError::InvalidFormat(format!(
                        "unknown batch flags {flags:#04x}"
                    )));
                }
                Message::PatchBatch {
                    seq,
                    flags,
                    patch: payload[9..].to_vec(),
                }
            }
            MSG_TYPE_ERROR => {
                if payload.len() < 4 {
                    return Err(MessageError::TooShort {
                        expected: 4,
                        actual: payload.len(),
                    });
                }
                let code = FaultCode::from_u16(u16::from_le_bytes([payload[0], payload[1]]));
                let len = u16::from_le_bytes([payload[2], payload[3]]) as usize;
                if payload.len() != 4 + len {
                    return Err(MessageError::LengthMismatch {
                        header: len,
                        actual: payload.len() - 4,
                    });
                }
                let detail = String::from_utf8(payload[4..].to_vec())
                    .map_err(|_| MessageError::InvalidFormat("error detail not UTF-8".into()))?;
                Message::Error { code, detail }
            }
            other => return Err(MessageError::UnknownType(other)),
        };
        Ok(msg)
    }
}

/// Sync message encoding/decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Input data is shorter than required.
    #[error("message too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Payload length disagrees with the header.
    #[error("length mismatch: header says {header}, got {actual}")]
    LengthMismatch {
        /// Length announced.
        header: usize,
        /// Length present.
        actual: usize,
    },

    /// Frame from an incompatible protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our version.
        expected: u16,
        /// Version in the frame.
        got: u16,
    },

    /// Unknown message type.
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    /// Payload exceeds the frame ceiling.
    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),

    /// Message format is invalid or corrupted.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

impl From<DecodeError> for MessageError {
    fn from(err: DecodeError) -> Self {
        MessageError::InvalidFormat(err.to_string())
    }
}

impl From<MessageError> for SyncError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::VersionMismatch { expected, got } => {
                SyncError::VersionMismatch { expected, got }
            }
            other => SyncError::MalformedPatch(MalformedPatchError::Invalid(other.to_string())),
        }
    }
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, MessageError> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or(MessageError::TooShort {
            expected: offset + 8,
            actual: data.len(),
        })?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(arr))
}

fn decode_vector_exact(data: &[u8]) -> Result<VersionVector, MessageError> {
    let (vector, used) = VersionVector::decode(data)?;
    if used != data.len() {
        return Err(MessageError::InvalidFormat(format!(
            "{} trailing bytes after vector",
            data.len() - used
        )));
    }
    Ok(vector)
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
