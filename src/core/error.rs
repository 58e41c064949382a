//! Error types for the ink synchronization core.
//!
//! Conflicts are never errors: they are resolved deterministically by the
//! merge layer. Errors here cover decoding, durability, and peer behavior.

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

use thiserror::Error;

use super::ids::{AuthorId, LogPosition, OpId};

/// Errors that can occur when decoding low-level primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Invalid encoding.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Unexpected end of data.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unsupported version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
}

/// A patch could not be decoded.
///
/// Session-fatal: the session must be torn down, never retried blindly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedPatchError {
    /// Input ended early.
    #[error("patch truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Frame does not start with the patch magic.
    #[error("bad patch magic")]
    BadMagic,

    /// Frame was written by an incompatible codec.
    #[error("patch version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Supported version.
        expected: u8,
        /// Version found.
        got: u8,
    },

    /// Delta frame was encoded against a different base vector.
    #[error("delta base mismatch: expected fingerprint {expected:08x}, got {got:08x}")]
    BaseMismatch {
        /// Fingerprint of the decoder's base.
        expected: u32,
        /// Fingerprint carried by the frame.
        got: u32,
    },

    /// Unknown operation kind tag.
    #[error("unknown operation kind {0}")]
    UnknownKind(u8),

    /// Header op count disagrees with the body.
    #[error("op count mismatch: header says {expected}, body has {actual}")]
    CountMismatch {
        /// Count in the header.
        expected: u32,
        /// Ops decoded.
        actual: u32,
    },

    /// Bytes left over after the last operation.
    #[error("{0} trailing bytes after patch body")]
    TrailingBytes(usize),

    /// Body compressed but compression support is unavailable or failed.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Structurally invalid content.
    #[error("invalid patch: {0}")]
    Invalid(String),
}

impl From<DecodeError> for MalformedPatchError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnexpectedEof => MalformedPatchError::Truncated {
                expected: 1,
                actual: 0,
            },
            DecodeError::InvalidEncoding(reason) => MalformedPatchError::Invalid(reason),
            DecodeError::UnsupportedVersion(got) => MalformedPatchError::VersionMismatch {
                expected: super::constants::PATCH_FORMAT_VERSION,
                got,
            },
        }
    }
}

/// Local log corruption.
///
/// Not fatal to the process: triggers snapshot-based recovery and is
/// surfaced as a warning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorruptionError {
    /// A local append would not strictly increase the local counter.
    #[error("counter regression for author {author}: last {last}, got {got}")]
    CounterRegression {
        /// Local author.
        author: AuthorId,
        /// Highest counter already in the log.
        last: u64,
        /// Counter of the rejected op.
        got: u64,
    },

    /// Segment header failed validation.
    #[error("segment {segment:016x} header invalid: {reason}")]
    SegmentHeader {
        /// Segment id (from the file name).
        segment: u64,
        /// What was wrong.
        reason: String,
    },

    /// Record checksum did not match.
    #[error("segment {segment:016x} record at offset {offset} failed checksum")]
    RecordChecksum {
        /// Segment id.
        segment: u64,
        /// Byte offset of the record.
        offset: u64,
    },

    /// Record checksum verified but its payload did not decode.
    #[error("segment {segment:016x} record at offset {offset} undecodable: {reason}")]
    UndecodableRecord {
        /// Segment id.
        segment: u64,
        /// Byte offset of the record.
        offset: u64,
        /// Decoder error.
        reason: String,
    },

    /// Segment is marked unreadable.
    #[error("segment {segment:016x} is unreadable")]
    UnreadableSegment {
        /// Segment id.
        segment: u64,
    },
}

/// Errors from the operation log.
#[derive(Debug, Error)]
pub enum LogError {
    /// Corruption or monotonicity violation.
    #[error("log corruption: {0}")]
    Corruption(#[from] CorruptionError),

    /// Filesystem failure.
    #[error("log i/o error at {path:?}: {source}")]
    Io {
        /// Path involved, if known.
        path: Option<PathBuf>,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded.
    #[error("log record decode error: {0}")]
    Codec(#[from] MalformedPatchError),

    /// Requested position is below the compaction floor.
    #[error("position {requested} was compacted (log starts at {floor})")]
    Compacted {
        /// Requested position.
        requested: LogPosition,
        /// First retained position.
        floor: LogPosition,
    },
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

/// A peer repeatedly violated the protocol and has been fenced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("peer {peer} fenced after {faults} protocol faults")]
pub struct PeerFaultError {
    /// The offending peer.
    pub peer: AuthorId,
    /// Number of faults observed.
    pub faults: u32,
}

/// Machine-readable fault codes carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// Frame or patch could not be decoded.
    MalformedPatch,
    /// Protocol versions differ.
    VersionMismatch,
    /// Message not valid in the current phase.
    UnexpectedMessage,
    /// Peer is fenced.
    Fenced,
    /// Unknown code received from a newer peer.
    Other(u16),
}

impl FaultCode {
    /// Wire value.
    pub fn to_u16(self) -> u16 {
        match self {
            FaultCode::MalformedPatch => 1,
            FaultCode::VersionMismatch => 2,
            FaultCode::UnexpectedMessage => 3,
            FaultCode::Fenced => 4,
            FaultCode::Other(code) => code,
        }
    }

    /// Parse a wire value.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => FaultCode::MalformedPatch,
            2 => FaultCode::VersionMismatch,
            3 => FaultCode::UnexpectedMessage,
            4 => FaultCode::Fenced,
            other => FaultCode::Other(other),
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCode::MalformedPatch => f.write_str("malformed-patch"),
            FaultCode::VersionMismatch => f.write_str("version-mismatch"),
            FaultCode::UnexpectedMessage => f.write_str("unexpected-message"),
            FaultCode::Fenced => f.write_str("fenced"),
            FaultCode::Other(code) => write!(f, "fault-{code}"),
        }
    }
}

/// Errors in the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote sent an undecodable patch or frame.
    #[error("malformed patch: {0}")]
    MalformedPatch(#[from] MalformedPatchError),

    /// Peer has been fenced.
    #[error(transparent)]
    PeerFault(#[from] PeerFaultError),

    /// Too many unacknowledged ops in flight to this peer; pushes paused.
    #[error("backpressure: {outstanding} ops outstanding to {peer} (limit {limit})")]
    BackpressureExceeded {
        /// Peer being pushed to.
        peer: AuthorId,
        /// Ops currently in flight.
        outstanding: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// Remote speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our version.
        expected: u16,
        /// Their version.
        got: u16,
    },

    /// Handshake or idle timer expired.
    #[error("{0} timeout")]
    Timeout(&'static str),

    /// Transport failed or closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote reported a fault.
    #[error("remote fault {code}: {detail}")]
    Remote {
        /// Fault code.
        code: FaultCode,
        /// Human-readable detail.
        detail: String,
    },

    /// Session is in the wrong phase for the request.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Local replica failed while applying or reading ops.
    #[error("replica error: {0}")]
    Replica(String),
}

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Filesystem failure.
    #[error("snapshot i/o error at {path:?}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Snapshot file failed validation.
    #[error("snapshot {path:?} corrupt: {reason}")]
    Corrupt {
        /// File path.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// Document body could not be decoded.
    #[error("snapshot body decode error: {0}")]
    Codec(#[from] MalformedPatchError),
}

/// Invalid configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid configuration: {field}: {reason}")]
pub struct ConfigError {
    /// Offending field.
    pub field: &'static str,
    /// What was wrong.
    pub reason: String,
}

/// Top-level errors.
#[derive(Debug, Error)]
pub enum InkError {
    /// Log error.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Snapshot error.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A locally committed operation broke the Lamport or authorship rules.
    #[error("invalid local operation {op}: {reason}")]
    InvalidOperation {
        /// Offending op.
        op: OpId,
        /// What was wrong.
        reason: &'static str,
    },

    /// The local Lamport counter cannot advance further.
    #[error("lamport counter exhausted for author {0}")]
    CounterExhausted(AuthorId),
}

/// Unrecoverable gap between the last valid snapshot and a corruption point.
///
/// Never returned as an `Err`: surfaced in recovery reports and logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLossWarning {
    /// Segment that was unreadable.
    pub segment: u64,
    /// Log positions permanently lost.
    pub lost: Range<LogPosition>,
}

impl fmt::Display for DataLossWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data loss: log positions {}..{} from segment {:016x} are unrecoverable",
            self.lost.start, self.lost.end, self.segment
        )
    }
}
