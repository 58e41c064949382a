//! Lazy, restartable iteration over the operation log.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::segment::SegmentScan;
use crate::codec::PatchCodec;
use crate::core::{CorruptionError, LogError, LogPosition, MalformedPatchError, Operation};

/// Location and extent of one segment.
#[derive(Debug, Clone)]
pub(crate) struct SegmentMeta {
    pub id: u64,
    pub path: PathBuf,
    /// First log position in the segment.
    pub start: LogPosition,
    /// One past the last log position in the segment.
    pub end: LogPosition,
    pub readable: bool,
}

/// Decode a record payload that must hold exactly one operation.
pub(crate) fn decode_record(
    codec: &PatchCodec,
    payload: &[u8],
) -> Result<Operation, MalformedPatchError> {
    let mut ops = codec.decode(payload)?;
    match ops.len() {
        1 => Ok(ops.remove(0)),
        n => Err(MalformedPatchError::CountMismatch {
            expected: 1,
            actual: n as u32,
        }),
    }
}

/// Iterator over `(position, operation)` pairs from a starting position.
///
/// Finite: it ends at the log's length when the reader was created.
/// Unreadable segments are skipped; a segment that fails while being read
/// yields one error and iteration continues with the next segment.
#[derive(Debug)]
pub struct LogReader {
    segments: VecDeque<SegmentMeta>,
    codec: PatchCodec,
    from: LogPosition,
    buffered: VecDeque<(LogPosition, Operation)>,
}

impl LogReader {
    pub(crate) fn new(segments: Vec<SegmentMeta>, codec: PatchCodec, from: LogPosition) -> Self {
        Self {
            segments: segments.into_iter().filter(|s| s.end > from).collect(),
            codec,
            from,
            buffered: VecDeque::new(),
        }
    }

    /// Position the reader started from.
    pub fn start(&self) -> LogPosition {
        self.from
    }

    fn load(&mut self, segment: &SegmentMeta) -> Result<(), LogError> {
        let bytes = fs::read(&segment.path).map_err(|e| LogError::io(&segment.path, e))?;
        let scan = SegmentScan::scan(&bytes, segment.id);
        scan.header.map_err(LogError::Corruption)?;

        let mut entries = Vec::new();
        for (position, frame) in (segment.start..segment.end).zip(&scan.frames) {
            if position < self.from {
                continue;
            }
            if !frame.crc_ok {
                return Err(CorruptionError::RecordChecksum {
                    segment: segment.id,
                    offset: frame.offset,
                }
                .into());
            }
            let op = decode_record(&self.codec, &bytes[frame.payload.clone()]).map_err(|e| {
                CorruptionError::UndecodableRecord {
                    segment: segment.id,
                    offset: frame.offset,
                    reason: e.to_string(),
                }
            })?;
            entries.push((position, op));
        }
        self.buffered.extend(entries);
        Ok(())
    }
}

impl Iterator for LogReader {
    type Item = Result<(LogPosition, Operation), LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                return Some(Ok(entry));
            }
            let segment = self.segments.pop_front()?;
            if !segment.readable {
                debug!(
                    segment = segment.id,
                    start = segment.start,
                    end = segment.end,
                    "skipping unreadable segment"
                );
                continue;
            }
            if let Err(e) = self.load(&segment) {
                return Some(Err(e));
            }
        }
    }
}
