//! Format and protocol constants.
//!
//! Wire and on-disk values are fixed by the formats and MUST NOT be changed
//! without bumping the corresponding version. Tunables live in [`crate::config`].

use std::time::Duration;

// =============================================================================
// WIRE PROTOCOL
// =============================================================================

/// Sync protocol version carried in every frame.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Peer greeting carrying author id and version vector.
pub const MSG_TYPE_HELLO: u8 = 0x01;

/// Version vector reply to a HELLO.
pub const MSG_TYPE_VECTOR: u8 = 0x02;

/// Codec-encoded batch of operations.
pub const MSG_TYPE_PATCH_BATCH: u8 = 0x03;

/// Highest acknowledged op counter per author.
pub const MSG_TYPE_ACK: u8 = 0x04;

/// Machine-readable fault report.
pub const MSG_TYPE_ERROR: u8 = 0x05;

/// Sync frame header size (version u16 + type u8 + payload length u32).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Largest payload a single sync frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024 * 1024;

/// PATCH_BATCH flag: last batch of the initial catch-up.
pub const PATCH_FLAG_FINAL: u8 = 0x01;

/// PATCH_BATCH flag: the catch-up was synthesized from document state, so
/// the receiver adopts the sender's announced vector after the FINAL batch.
pub const PATCH_FLAG_STATE: u8 = 0x02;

/// Default cap on remote ops buffered for missing dependencies.
pub const DEFAULT_MAX_PENDING_OPS: usize = 65_536;

// =============================================================================
// PATCH CODEC
// =============================================================================

/// Patch frame magic.
pub const PATCH_MAGIC: &[u8; 4] = b"INKP";

/// Patch codec format version.
pub const PATCH_FORMAT_VERSION: u8 = 1;

/// Patch frame header size (magic + version + flags + base fp + count + len).
pub const PATCH_HEADER_SIZE: usize = 18;

/// Patch flag: body is zstd-compressed.
pub const PATCH_FLAG_COMPRESSED: u8 = 0x01;

/// Patch flag: causal contexts are delta-encoded against a base vector.
pub const PATCH_FLAG_DELTA: u8 = 0x02;

/// Minimum body size to attempt compression.
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Default zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

// =============================================================================
// OPERATION LOG
// =============================================================================

/// Segment file magic.
pub const SEGMENT_MAGIC: &[u8; 6] = b"INKLOG";

/// Segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Segment header size: magic + version + id + author + start counter +
/// start position + crc.
pub const SEGMENT_HEADER_SIZE: usize = 6 + 4 + 8 + 8 + 8 + 8 + 4;

/// Record frame header size (length u32 + crc32c u32).
pub const RECORD_HEADER_SIZE: usize = 8;

/// Segment file extension.
pub const SEGMENT_EXTENSION: &str = "ilog";

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Snapshot file magic.
pub const SNAPSHOT_MAGIC: &[u8; 7] = b"INKSNAP";

/// Snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Snapshot file extension.
pub const SNAPSHOT_EXTENSION: &str = "isnap";

/// Default byte threshold for triggering a snapshot (2 MiB).
pub const DEFAULT_SNAPSHOT_SIZE_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Default time threshold for triggering a snapshot.
pub const DEFAULT_SNAPSHOT_TIME_THRESHOLD: Duration = Duration::from_secs(300);

// =============================================================================
// SYNC TIMING
// =============================================================================

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle timeout on an established session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default minimum reconnect delay.
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Default maximum reconnect delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default reconnect backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;
