//! Segment header, record framing, and segment file I/O.
//!
//! Segment layout:
//!
//! ```text
//! +0   Magic "INKLOG" (6 bytes)
//! +6   Format version (4 bytes LE32)
//! +10  Segment id (8 bytes LE64)
//! +18  Author (8 bytes LE64)
//! +26  Highest local counter before this segment (8 bytes LE64)
//! +34  Log position of the first record (8 bytes LE64)
//! +42  crc32c of bytes 0..42 (4 bytes LE32)
//! +46  Records: length (LE32) + crc32c (LE32) + single-op patch frame
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use tracing::debug;

use crate::core::{
    AuthorId, CorruptionError, LogError, LogPosition, RECORD_HEADER_SIZE, SEGMENT_EXTENSION,
    SEGMENT_FORMAT_VERSION, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
};

/// Self-describing segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Sequential segment id.
    pub segment_id: u64,
    /// Local author that owns the log.
    pub author: AuthorId,
    /// Highest local counter written before this segment began.
    pub start_counter: u64,
    /// Log position of the first record.
    pub start_position: LogPosition,
}

impl SegmentHeader {
    /// Encode to the fixed-size header.
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..6].copy_from_slice(SEGMENT_MAGIC);
        buf[6..10].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        buf[10..18].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[18..26].copy_from_slice(&self.author.0.to_le_bytes());
        buf[26..34].copy_from_slice(&self.start_counter.to_le_bytes());
        buf[34..42].copy_from_slice(&self.start_position.to_le_bytes());
        let crc = crc32c(&buf[..42]);
        buf[42..46].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and verify a header. `segment` is the id from the file name.
    pub fn decode(bytes: &[u8], segment: u64) -> Result<Self, CorruptionError> {
        let invalid = |reason: &str| CorruptionError::SegmentHeader {
            segment,
            reason: reason.to_string(),
        };

        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(invalid("segment header truncated"));
        }
        if &bytes[0..6] != SEGMENT_MAGIC {
            return Err(invalid("bad magic"));
        }
        let expected_crc = read_u32(bytes, 42);
        if crc32c(&bytes[..42]) != expected_crc {
            return Err(invalid("header crc mismatch"));
        }
        let version = read_u32(bytes, 6);
        if version != SEGMENT_FORMAT_VERSION {
            return Err(invalid(&format!("unsupported format version {version}")));
        }
        let header = Self {
            segment_id: read_u64(bytes, 10),
            author: AuthorId(read_u64(bytes, 18)),
            start_counter: read_u64(bytes, 26),
            start_position: read_u64(bytes, 34),
        };
        if header.segment_id != segment {
            return Err(invalid("segment id does not match file name"));
        }
        Ok(header)
    }
}

/// Frame a record payload.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// One framed record located in a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFrame {
    /// Byte offset of the frame header.
    pub offset: u64,
    /// Payload byte range within the segment.
    pub payload: Range<usize>,
    /// Whether the payload checksum verified.
    pub crc_ok: bool,
}

/// Structural walk over a segment's bytes.
#[derive(Debug)]
pub struct SegmentScan {
    /// Header, or why it failed.
    pub header: Result<SegmentHeader, CorruptionError>,
    /// Every complete frame, in order.
    pub frames: Vec<RecordFrame>,
    /// Offset of an incomplete trailing frame.
    pub torn_at: Option<u64>,
}

impl SegmentScan {
    /// Walk a segment. Never fails: problems are reported in the result.
    pub fn scan(bytes: &[u8], segment: u64) -> Self {
        let header = SegmentHeader::decode(bytes, segment);
        let mut frames = Vec::new();
        let mut torn_at = None;

        let mut offset = SEGMENT_HEADER_SIZE;
        while offset < bytes.len() {
            if bytes.len() - offset < RECORD_HEADER_SIZE {
                torn_at = Some(offset as u64);
                break;
            }
            let len = read_u32(bytes, offset) as usize;
            let crc = read_u32(bytes, offset + 4);
            let start = offset + RECORD_HEADER_SIZE;
            let Some(end) = start.checked_add(len).filter(|&end| end <= bytes.len()) else {
                torn_at = Some(offset as u64);
                break;
            };
            frames.push(RecordFrame {
                offset: offset as u64,
                payload: start..end,
                crc_ok: crc32c(&bytes[start..end]) == crc,
            });
            offset = end;
        }

        Self {
            header,
            frames,
            torn_at,
        }
    }

    /// First checksum failure, if any.
    pub fn first_bad_frame(&self, segment: u64) -> Option<CorruptionError> {
        self.frames
            .iter()
            .find(|f| !f.crc_ok)
            .map(|f| CorruptionError::RecordChecksum {
                segment,
                offset: f.offset,
            })
    }
}

/// File name for a segment id.
pub fn segment_file_name(segment_id: u64) -> String {
    format!("seg-{segment_id:016x}.{SEGMENT_EXTENSION}")
}

/// Parse a segment id out of a file name.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let hex = name
        .strip_prefix("seg-")?
        .strip_suffix(SEGMENT_EXTENSION)?
        .strip_suffix('.')?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// List segment files in `dir`, ordered by id.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, LogError> {
    let entries = fs::read_dir(dir).map_err(|e| LogError::io(dir, e))?;
    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LogError::io(dir, e))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_segment_file_name) {
            segments.push((id, entry.path()));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Open segment being appended to.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    header: SegmentHeader,
    len: u64,
    records: u64,
}

impl SegmentWriter {
    /// Create a new segment atomically (temp file, fsync, rename, fsync dir).
    pub fn create(dir: &Path, header: SegmentHeader) -> Result<Self, LogError> {
        let file_name = segment_file_name(header.segment_id);
        let tmp_path = dir.join(format!("{file_name}.tmp"));
        let final_path = dir.join(&file_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| LogError::io(&tmp_path, e))?;
        file.write_all(&header.encode())
            .map_err(|e| LogError::io(&tmp_path, e))?;
        file.sync_all().map_err(|e| LogError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(|e| LogError::io(&final_path, e))?;
        fsync_dir(dir)?;

        debug!(
            segment = header.segment_id,
            start_position = header.start_position,
            "created log segment"
        );
        Self::open_append(final_path, header, SEGMENT_HEADER_SIZE as u64, 0)
    }

    /// Reopen an existing segment for appending, truncating it to `len`.
    pub fn open_append(
        path: PathBuf,
        header: SegmentHeader,
        len: u64,
        records: u64,
    ) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;
        let on_disk = file.metadata().map_err(|e| LogError::io(&path, e))?.len();
        if on_disk != len {
            file.set_len(len).map_err(|e| LogError::io(&path, e))?;
            file.sync_all().map_err(|e| LogError::io(&path, e))?;
        }
        drop(file);

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;
        Ok(Self {
            file,
            path,
            header,
            len,
            records,
        })
    }

    /// Header of this segment.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Segment path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the segment including header.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Records written to this segment.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Check if the segment has no records.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Append a framed record. Not durable until [`sync`](Self::sync).
    pub fn append(&mut self, frame: &[u8]) -> Result<(), LogError> {
        self.file
            .write_all(frame)
            .map_err(|e| LogError::io(&self.path, e))?;
        self.len += frame.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// fsync appended data.
    pub fn sync(&self) -> Result<(), LogError> {
        self.file
            .sync_data()
            .map_err(|e| LogError::io(&self.path, e))
    }
}

/// fsync a directory so renames and unlinks are durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), LogError> {
    let file = File::open(dir).map_err(|e| LogError::io(dir, e))?;
    file.sync_all().map_err(|e| LogError::io(dir, e))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(arr)
}
