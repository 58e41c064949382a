//! Snapshot file format.
//!
//! ```text
//! +0   Magic "INKSNAP" (7 bytes)
//! +7   Format version (4 bytes LE32)
//! +11  Flags (1 byte): COMPRESSED=0x01
//! +12  Snapshot version (8 bytes LE64)
//! +20  Log position covered (8 bytes LE64)
//! +28  Created at, ms since epoch (8 bytes LE64)
//! +36  Body length (4 bytes LE32)
//! +40  Body crc32c (4 bytes LE32)
//! +44  Header crc32c over bytes 0..44 (4 bytes LE32)
//! +48  Body: encoded document
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32c::crc32c;

use crate::codec::wire::{ByteReader, put_bytes, put_metadata_value, put_stroke_data, put_varint};
use crate::codec::{CompressResult, Compressor};
use crate::core::{
    AuthorId, DecodeError, LogPosition, MalformedPatchError, OpId, SNAPSHOT_EXTENSION,
    SNAPSHOT_FORMAT_VERSION, SNAPSHOT_MAGIC, SnapshotError, StrokeData, VersionVector, WriterStamp,
};
use crate::store::{Document, MetadataEntry, Stroke};

const SNAPSHOT_HEADER_SIZE: usize = 48;
const FLAG_COMPRESSED: u8 = 0x01;

/// An immutable, versioned copy of the document.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Monotonic snapshot version.
    pub version: u64,
    /// Every log record below this position is folded in.
    pub log_position: LogPosition,
    /// Wall-clock creation time.
    pub created_at_ms: u64,
    /// Document state.
    pub document: Arc<Document>,
}

/// File name for a snapshot version.
pub fn snapshot_file_name(version: u64) -> String {
    format!("snap-{version:016x}.{SNAPSHOT_EXTENSION}")
}

/// Parse a snapshot version out of a file name.
pub fn parse_snapshot_file_name(name: &str) -> Option<u64> {
    let hex = name
        .strip_prefix("snap-")?
        .strip_suffix(SNAPSHOT_EXTENSION)?
        .strip_suffix('.')?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Encode a document body.
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut buf = Vec::new();
    doc.observed.encode_into(&mut buf);

    put_varint(&mut buf, doc.strokes.len() as u64);
    for stroke in doc.strokes.values() {
        buf.extend_from_slice(&stroke.id.author.0.to_le_bytes());
        put_varint(&mut buf, stroke.id.counter);
        buf.extend_from_slice(&stroke.writer.author.0.to_le_bytes());
        put_varint(&mut buf, stroke.writer.lamport);
        buf.push(u8::from(stroke.tombstone));
        if !stroke.tombstone {
            put_stroke_data(&mut buf, &StrokeData::new(stroke.points.clone(), stroke.brush));
        }
    }

    put_varint(&mut buf, doc.metadata.len() as u64);
    for (key, entry) in &doc.metadata {
        put_bytes(&mut buf, key.as_bytes());
        buf.extend_from_slice(&entry.op.author.0.to_le_bytes());
        put_varint(&mut buf, entry.op.counter);
        put_metadata_value(&mut buf, &entry.value);
    }
    buf
}

/// Decode a document body.
pub fn decode_document(body: &[u8]) -> Result<Document, MalformedPatchError> {
    let (observed, used) = VersionVector::decode(body)?;
    let mut reader = ByteReader::new(&body[used..]);
    let mut doc = Document {
        observed,
        ..Document::default()
    };

    // Smallest stroke record: two authors, two varints, a flag
    let strokes = reader.length(reader.remaining() / 19)?;
    for _ in 0..strokes {
        let id = OpId::new(AuthorId(reader.u64()?), reader.varint()?);
        let writer = WriterStamp {
            author: AuthorId(reader.u64()?),
            lamport: reader.varint()?,
        };
        let stroke = match reader.u8()? {
            0 => {
                let data = reader.stroke_data()?;
                Stroke {
                    id,
                    points: data.points,
                    brush: data.brush,
                    tombstone: false,
                    writer,
                }
            }
            1 => Stroke {
                id,
                points: Vec::new(),
                brush: 0,
                tombstone: true,
                writer,
            },
            other => {
                let detail = format!("bad tombstone flag {other}");
                return Err(DecodeError::InvalidEncoding(detail).into());
            }
        };
        if doc.strokes.insert(id, stroke).is_some() {
            return Err(MalformedPatchError::Invalid(format!("duplicate stroke {id}")));
        }
    }

    let entries = reader.length(reader.remaining() / 11)?;
    for _ in 0..entries {
        let key = reader.string()?;
        let op = OpId::new(AuthorId(reader.u64()?), reader.varint()?);
        let value = reader.metadata_value()?;
        if doc.metadata.insert(key, MetadataEntry::new(op, value)).is_some() {
            return Err(MalformedPatchError::Invalid("duplicate metadata key".into()));
        }
    }

    if !reader.is_empty() {
        return Err(MalformedPatchError::TrailingBytes(reader.remaining()));
    }
    Ok(doc)
}

/// Serialize a snapshot file.
pub fn encode_snapshot(snapshot: &Snapshot, compressor: Option<&Compressor>) -> Vec<u8> {
    let raw = encode_document(&snapshot.document);
    let (flags, body) = match compressor.map(|c| c.compress(&raw)) {
        Some(Ok(CompressResult::Compressed(body))) => (FLAG_COMPRESSED, body),
        _ => (0, raw),
    };

    let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + body.len());
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    buf.push(flags);
    buf.extend_from_slice(&snapshot.version.to_le_bytes());
    buf.extend_from_slice(&snapshot.log_position.to_le_bytes());
    buf.extend_from_slice(&snapshot.created_at_ms.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(&body).to_le_bytes());
    let header_crc = crc32c(&buf);
    buf.extend_from_slice(&header_crc.to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Parse and verify a snapshot file.
pub fn decode_snapshot(
    path: &Path,
    bytes: &[u8],
    compressor: &Compressor,
) -> Result<Snapshot, SnapshotError> {
    let corrupt = |reason: String| SnapshotError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < SNAPSHOT_HEADER_SIZE {
        return Err(corrupt(format!("file too short ({} bytes)", bytes.len())));
    }
    if &bytes[0..7] != SNAPSHOT_MAGIC {
        return Err(corrupt("bad magic".into()));
    }
    if crc32c(&bytes[..44]) != read_u32(bytes, 44) {
        return Err(corrupt("header crc mismatch".into()));
    }
    let version = read_u32(bytes, 7);
    if version != SNAPSHOT_FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {version}")));
    }
    let flags = bytes[11];
    let body_len = read_u32(bytes, 36) as usize;
    let body = &bytes[SNAPSHOT_HEADER_SIZE..];
    if body.len() != body_len {
        return Err(corrupt(format!(
            "body length {} does not match header {body_len}",
            body.len()
        )));
    }
    if crc32c(body) != read_u32(bytes, 40) {
        return Err(corrupt("body crc mismatch".into()));
    }

    let decompressed;
    let body = if flags & FLAG_COMPRESSED != 0 {
        decompressed = compressor
            .decompress(body)
            .map_err(|e| corrupt(e.to_string()))?;
        decompressed.as_slice()
    } else {
        body
    };

    Ok(Snapshot {
        version: read_u64(bytes, 12),
        log_position: read_u64(bytes, 20),
        created_at_ms: read_u64(bytes, 28),
        document: Arc::new(decode_document(body)?),
    })
}

/// Write a snapshot atomically: temp file, fsync, rename, fsync directory.
pub fn write_snapshot_file(
    dir: &Path,
    snapshot: &Snapshot,
    compressor: Option<&Compressor>,
) -> Result<PathBuf, SnapshotError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SnapshotError::Io { path, source }
    };

    let name = snapshot_file_name(snapshot.version);
    let tmp_path = dir.join(format!("{name}.tmp"));
    let final_path = dir.join(&name);
    let bytes = encode_snapshot(snapshot, compressor);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(io(&tmp_path))?;
    file.write_all(&bytes).map_err(io(&tmp_path))?;
    file.sync_all().map_err(io(&tmp_path))?;
    drop(file);

    fs::rename(&tmp_path, &final_path).map_err(io(&final_path))?;
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io(dir))?;
    Ok(final_path)
}

/// Read and verify a snapshot file.
pub fn read_snapshot_file(path: &Path, compressor: &Compressor) -> Result<Snapshot, SnapshotError> {
    let bytes = fs::read(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_snapshot(path, &bytes, compressor)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(arr)
}
