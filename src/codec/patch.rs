//! Patch frames: compact, self-validating batches of operations.
//!
//! Frame layout:
//!
//! ```text
//! +0   Magic "INKP" (4 bytes)
//! +4   Format version (1 byte)
//! +5   Flags (1 byte): COMPRESSED=0x01, DELTA=0x02
//! +6   Base fingerprint (4 bytes LE32, crc32c of the base vector; 0 if not DELTA)
//! +10  Op count (4 bytes LE32)
//! +14  Body length (4 bytes LE32)
//! +18  Body (zstd-compressed if COMPRESSED)
//! ```
//!
//! Body layout, all integers LEB128 unless noted:
//!
//! ```text
//! author table:  count, then each author as LE64, strictly ascending
//! per op:        author index, counter,
//!                context diff: n, then n x (author index, counter; 0 = absent),
//!                kind tag (u8), kind payload
//! ```
//!
//! Each op's causal context is written as the entries that differ from the
//! previous op's context. The first op diffs against the base vector (DELTA)
//! or the empty vector.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::compression::{CompressResult, CompressionError, Compressor};
use super::wire::{ByteReader, put_bytes, put_metadata_value, put_stroke_data, put_varint};
use crate::config::CodecConfig;
use crate::core::{
    AuthorId, MalformedPatchError, OpId, OpKind, Operation, PATCH_FLAG_COMPRESSED,
    PATCH_FLAG_DELTA, PATCH_FORMAT_VERSION, PATCH_HEADER_SIZE, PATCH_MAGIC, VersionVector,
};

const KNOWN_FLAGS: u8 = PATCH_FLAG_COMPRESSED | PATCH_FLAG_DELTA;

/// Smallest possible encoded op: author idx, counter, empty diff, tag.
const MIN_OP_SIZE: usize = 4;

/// Parsed patch frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    /// Flag bits.
    pub flags: u8,
    /// Fingerprint of the base vector (DELTA frames).
    pub base_fingerprint: u32,
    /// Number of operations in the body.
    pub count: u32,
    /// Length of the (possibly compressed) body.
    pub body_len: u32,
}

impl PatchHeader {
    /// Parse and validate the fixed-size header.
    pub fn parse(data: &[u8]) -> Result<Self, MalformedPatchError> {
        if data.len() < PATCH_HEADER_SIZE {
            return Err(MalformedPatchError::Truncated {
                expected: PATCH_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if &data[0..4] != PATCH_MAGIC {
            return Err(MalformedPatchError::BadMagic);
        }
        if data[4] != PATCH_FORMAT_VERSION {
            return Err(MalformedPatchError::VersionMismatch {
                expected: PATCH_FORMAT_VERSION,
                got: data[4],
            });
        }
        let flags = data[5];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(MalformedPatchError::Invalid(format!(
                "unknown flag bits {:#04x}",
                flags & !KNOWN_FLAGS
            )));
        }
        let word =
            |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        Ok(Self {
            flags,
            base_fingerprint: word(6),
            count: word(10),
            body_len: word(14),
        })
    }

    /// Check if the body is compressed.
    pub fn is_compressed(&self) -> bool {
        self.flags & PATCH_FLAG_COMPRESSED != 0
    }

    /// Check if contexts are delta-encoded against a base vector.
    pub fn is_delta(&self) -> bool {
        self.flags & PATCH_FLAG_DELTA != 0
    }

    /// Total frame length including header.
    pub fn frame_len(&self) -> usize {
        PATCH_HEADER_SIZE + self.body_len as usize
    }
}

/// Encoder/decoder for operation batches.
#[derive(Debug, Clone)]
pub struct PatchCodec {
    compress: bool,
    compressor: Compressor,
}

impl PatchCodec {
    /// Create a codec from settings.
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            compress: config.compress,
            compressor: Compressor::new(config),
        }
    }

    /// Encode a batch with self-contained causal contexts.
    pub fn encode(&self, ops: &[Operation]) -> Vec<u8> {
        self.encode_frame(ops, &VersionVector::new(), false)
    }

    /// Encode a batch whose first context is written relative to `base`.
    ///
    /// The receiver must decode with the same base.
    pub fn encode_delta(&self, ops: &[Operation], base: &VersionVector) -> Vec<u8> {
        self.encode_frame(ops, base, true)
    }

    /// Decode a frame produced by [`encode`](Self::encode).
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Operation>, MalformedPatchError> {
        self.decode_delta(data, &VersionVector::new())
    }

    /// Decode a frame, resolving a DELTA body against `base`.
    ///
    /// Non-delta frames ignore `base`.
    pub fn decode_delta(
        &self,
        data: &[u8],
        base: &VersionVector,
    ) -> Result<Vec<Operation>, MalformedPatchError> {
        let header = PatchHeader::parse(data)?;
        let frame_len = header.frame_len();
        if data.len() < frame_len {
            return Err(MalformedPatchError::Truncated {
                expected: frame_len,
                actual: data.len(),
            });
        }
        if data.len() > frame_len {
            return Err(MalformedPatchError::TrailingBytes(data.len() - frame_len));
        }

        let empty = VersionVector::new();
        let base = if header.is_delta() {
            let expected = base.fingerprint();
            if header.base_fingerprint != expected {
                return Err(MalformedPatchError::BaseMismatch {
                    expected,
                    got: header.base_fingerprint,
                });
            }
            base
        } else {
            &empty
        };

        let raw = &data[PATCH_HEADER_SIZE..];
        let decompressed;
        let body = if header.is_compressed() {
            decompressed = self
                .compressor
                .decompress(raw)
                .map_err(|e| MalformedPatchError::Decompression(e.to_string()))?;
            decompressed.as_slice()
        } else {
            raw
        };

        let ops = decode_body(body, header.count, base)?;
        debug!(
            ops = ops.len(),
            bytes = data.len(),
            compressed = header.is_compressed(),
            delta = header.is_delta(),
            "decoded patch"
        );
        Ok(ops)
    }

    fn encode_frame(&self, ops: &[Operation], base: &VersionVector, delta: bool) -> Vec<u8> {
        let body = encode_body(ops, base);

        let mut flags = if delta { PATCH_FLAG_DELTA } else { 0 };
        let body = if self.compress {
            match self.compressor.compress(&body) {
                Ok(CompressResult::Compressed(compressed)) => {
                    flags |= PATCH_FLAG_COMPRESSED;
                    compressed
                }
                Ok(CompressResult::Uncompressed(raw)) => raw,
                Err(CompressionError::Unsupported) => body,
                Err(e) => {
                    debug!(error = %e, "compression failed, sending raw body");
                    body
                }
            }
        } else {
            body
        };

        let mut frame = Vec::with_capacity(PATCH_HEADER_SIZE + body.len());
        frame.extend_from_slice(PATCH_MAGIC);
        frame.push(PATCH_FORMAT_VERSION);
        frame.push(flags);
        let fingerprint = if delta { base.fingerprint() } else { 0 };
        frame.extend_from_slice(&fingerprint.to_le_bytes());
        frame.extend_from_slice(&(ops.len() as u32).to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

impl Default for PatchCodec {
    fn default() -> Self {
        Self::new(&CodecConfig::default())
    }
}

/// Entries of `next` that differ from `prev` (0 = removed).
fn context_diff(prev: &VersionVector, next: &VersionVector) -> Vec<(AuthorId, u64)> {
    prev.authors_union(next)
        .into_iter()
        .filter_map(|author| {
            let value = next.get(author);
            (prev.get(author) != value).then_some((author, value))
        })
        .collect()
}

fn encode_body(ops: &[Operation], base: &VersionVector) -> Vec<u8> {
    let mut diffs = Vec::with_capacity(ops.len());
    let mut authors = BTreeSet::new();
    let mut prev = base;
    for op in ops {
        let diff = context_diff(prev, &op.causal_context);
        authors.insert(op.id.author);
        authors.extend(diff.iter().map(|&(a, _)| a));
        if let OpKind::DeleteStroke { target } = &op.kind {
            authors.insert(target.author);
        }
        diffs.push(diff);
        prev = &op.causal_context;
    }

    let index: BTreeMap<AuthorId, u64> = authors
        .iter()
        .enumerate()
        .map(|(i, &a)| (a, i as u64))
        .collect();

    let mut buf = Vec::new();
    put_varint(&mut buf, authors.len() as u64);
    for author in &authors {
        buf.extend_from_slice(&author.0.to_le_bytes());
    }

    for (op, diff) in ops.iter().zip(diffs) {
        put_varint(&mut buf, index[&op.id.author]);
        put_varint(&mut buf, op.id.counter);
        put_varint(&mut buf, diff.len() as u64);
        for (author, counter) in diff {
            put_varint(&mut buf, index[&author]);
            put_varint(&mut buf, counter);
        }
        buf.push(op.kind.tag());
        match &op.kind {
            OpKind::InsertStroke(data) => put_stroke_data(&mut buf, data),
            OpKind::DeleteStroke { target } => {
                put_varint(&mut buf, index[&target.author]);
                put_varint(&mut buf, target.counter);
            }
            OpKind::UpdateMetadata { key, value } => {
                put_bytes(&mut buf, key.as_bytes());
                put_metadata_value(&mut buf, value);
            }
        }
    }
    buf
}

fn decode_body(
    body: &[u8],
    count: u32,
    base: &VersionVector,
) -> Result<Vec<Operation>, MalformedPatchError> {
    let mut reader = ByteReader::new(body);

    let table_len = reader.length(reader.remaining() / 8)?;
    let mut authors = Vec::with_capacity(table_len);
    for _ in 0..table_len {
        let author = AuthorId(reader.u64()?);
        if authors.last().is_some_and(|&last| last >= author) {
            return Err(MalformedPatchError::Invalid(
                "author table not strictly ascending".into(),
            ));
        }
        authors.push(author);
    }
    let author_at = |idx: u64| -> Result<AuthorId, MalformedPatchError> {
        usize::try_from(idx)
            .ok()
            .and_then(|i| authors.get(i).copied())
            .ok_or_else(|| MalformedPatchError::Invalid(format!("author index {idx} out of range")))
    };

    let capacity = (count as usize).min(reader.remaining() / MIN_OP_SIZE);
    let mut ops = Vec::with_capacity(capacity);
    let mut context = base.clone();
    for decoded in 0..count {
        if reader.is_empty() {
            return Err(MalformedPatchError::CountMismatch {
                expected: count,
                actual: decoded,
            });
        }

        let author = author_at(reader.varint()?)?;
        let counter = reader.varint()?;
        if counter == 0 {
            return Err(MalformedPatchError::Invalid("zero op counter".into()));
        }
        let id = OpId::new(author, counter);

        let changes = reader.length(authors.len())?;
        let mut last_idx = None;
        for _ in 0..changes {
            let idx = reader.varint()?;
            if last_idx.is_some_and(|last| last >= idx) {
                return Err(MalformedPatchError::Invalid(
                    "context diff not strictly ascending".into(),
                ));
            }
            last_idx = Some(idx);
            context.set(author_at(idx)?, reader.varint()?);
        }
        // Lamport rule: an op's counter exceeds everything it observed
        if counter <= context.max_counter() {
            return Err(MalformedPatchError::Invalid(format!(
                "op {id} does not follow its causal context"
            )));
        }

        let kind = match reader.u8()? {
            1 => OpKind::InsertStroke(reader.stroke_data()?),
            2 => {
                let target_author = author_at(reader.varint()?)?;
                let target_counter = reader.varint()?;
                if target_counter == 0 {
                    return Err(MalformedPatchError::Invalid("zero delete target".into()));
                }
                OpKind::DeleteStroke {
                    target: OpId::new(target_author, target_counter),
                }
            }
            3 => OpKind::UpdateMetadata {
                key: reader.string()?,
                value: reader.metadata_value()?,
            },
            tag => return Err(MalformedPatchError::UnknownKind(tag)),
        };

        ops.push(Operation::new(id, context.clone(), kind));
    }

    if !reader.is_empty() {
        return Err(MalformedPatchError::TrailingBytes(reader.remaining()));
    }
    Ok(ops)
}
