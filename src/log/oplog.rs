//! The segmented, durable, append-only operation log.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::reader::{LogReader, SegmentMeta, decode_record};
use super::segment::{
    SegmentHeader, SegmentScan, SegmentWriter, encode_record, fsync_dir, list_segments,
};
use crate::codec::PatchCodec;
use crate::config::{CodecConfig, Durability, LogConfig};
use crate::core::{
    AuthorId, CorruptionError, LogError, LogPosition, Operation, SEGMENT_EXTENSION,
    VersionVector,
};

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Record written.
    Appended {
        /// Position assigned to the record.
        position: LogPosition,
        /// Framed bytes written.
        bytes: u64,
    },
    /// Operation was already in the log.
    Duplicate,
}

impl AppendOutcome {
    /// Position of a newly written record.
    pub fn position(&self) -> Option<LogPosition> {
        match self {
            AppendOutcome::Appended { position, .. } => Some(*position),
            AppendOutcome::Duplicate => None,
        }
    }

    /// Bytes written (0 for duplicates).
    pub fn bytes(&self) -> u64 {
        match self {
            AppendOutcome::Appended { bytes, .. } => *bytes,
            AppendOutcome::Duplicate => 0,
        }
    }
}

/// A segment found unreadable during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptSegment {
    /// Segment id.
    pub segment_id: u64,
    /// Log positions the segment held.
    pub positions: Range<LogPosition>,
    /// First problem found.
    pub error: CorruptionError,
}

/// What opening the log found.
#[derive(Debug, Clone, Default)]
pub struct LogRecovery {
    /// Readable records.
    pub records: u64,
    /// Segments marked unreadable.
    pub corrupt: Vec<CorruptSegment>,
    /// Bytes of a torn trailing record dropped from the newest segment.
    pub truncated_bytes: u64,
}

impl LogRecovery {
    /// Check if the log opened without corruption.
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

/// Segmented append-only log owned by one local author.
///
/// There is exactly one writer per log; callers serialize access.
#[derive(Debug)]
pub struct OperationLog {
    dir: PathBuf,
    author: AuthorId,
    config: LogConfig,
    codec: PatchCodec,
    sealed: Vec<SegmentMeta>,
    active: SegmentWriter,
    next_position: LogPosition,
    last_local_counter: u64,
    logged: VersionVector,
    floor: LogPosition,
    dirty: bool,
}

impl OperationLog {
    /// Open (or create) the log in `dir`, recovering from any crash.
    pub fn open(
        dir: impl AsRef<Path>,
        author: AuthorId,
        config: LogConfig,
    ) -> Result<(Self, LogRecovery), LogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| LogError::io(&dir, e))?;
        remove_stale_temp_files(&dir)?;

        let codec = record_codec();
        let mut recovery = LogRecovery::default();
        let mut sealed = Vec::new();
        let mut last_local_counter = 0;
        let mut logged = VersionVector::new();
        let mut active = None;

        let segments = list_segments(&dir)?;
        let count = segments.len();
        let mut prev_end: LogPosition = 0;
        for (index, (id, path)) in segments.into_iter().enumerate() {
            let is_newest = index + 1 == count;
            let bytes = fs::read(&path).map_err(|e| LogError::io(&path, e))?;
            let scan = SegmentScan::scan(&bytes, id);

            let mut problem = match &scan.header {
                Ok(header) if header.author != author => Some(CorruptionError::SegmentHeader {
                    segment: id,
                    reason: format!("written by author {}", header.author),
                }),
                Ok(_) => scan.first_bad_frame(id),
                Err(e) => Some(e.clone()),
            };
            if problem.is_none() && !is_newest {
                if let Some(offset) = scan.torn_at {
                    problem = Some(CorruptionError::RecordChecksum {
                        segment: id,
                        offset,
                    });
                }
            }

            let start = scan
                .header
                .as_ref()
                .map(|h| h.start_position)
                .unwrap_or(prev_end);

            let mut ops = Vec::with_capacity(scan.frames.len());
            if problem.is_none() {
                for frame in &scan.frames {
                    match decode_record(&codec, &bytes[frame.payload.clone()]) {
                        Ok(op) => ops.push(op),
                        Err(e) => {
                            problem = Some(CorruptionError::UndecodableRecord {
                                segment: id,
                                offset: frame.offset,
                                reason: e.to_string(),
                            });
                            break;
                        }
                    }
                }
            }

            let torn_extra = u64::from(scan.torn_at.is_some() && !is_newest);
            let end = start + scan.frames.len() as u64 + torn_extra;

            if let Some(error) = problem {
                warn!(segment = id, start, end, error = %error, "log segment unreadable");
                recovery.corrupt.push(CorruptSegment {
                    segment_id: id,
                    positions: start..end,
                    error,
                });
                sealed.push(SegmentMeta {
                    id,
                    path,
                    start,
                    end,
                    readable: false,
                });
                prev_end = end;
                continue;
            }

            let Ok(header) = scan.header else {
                continue;
            };
            last_local_counter = last_local_counter.max(header.start_counter);
            for op in &ops {
                if op.author() == author {
                    last_local_counter = last_local_counter.max(op.id.counter);
                }
                logged.observe(op.id);
            }
            recovery.records += ops.len() as u64;

            if is_newest {
                let valid_len = match scan.torn_at {
                    Some(offset) => {
                        recovery.truncated_bytes = bytes.len() as u64 - offset;
                        warn!(
                            segment = id,
                            bytes = recovery.truncated_bytes,
                            "truncating torn trailing record"
                        );
                        offset
                    }
                    None => bytes.len() as u64,
                };
                active = Some(SegmentWriter::open_append(
                    path,
                    header,
                    valid_len,
                    scan.frames.len() as u64,
                )?);
            } else {
                sealed.push(SegmentMeta {
                    id,
                    path,
                    start,
                    end,
                    readable: true,
                });
            }
            prev_end = end;
        }

        let active = match active {
            Some(active) => active,
            None => {
                let segment_id = sealed.last().map_or(1, |s| s.id + 1);
                SegmentWriter::create(
                    &dir,
                    SegmentHeader {
                        segment_id,
                        author,
                        start_counter: last_local_counter,
                        start_position: prev_end,
                    },
                )?
            }
        };

        let next_position = active.header().start_position + active.records();
        let floor = sealed
            .first()
            .map_or(active.header().start_position, |s| s.start);

        info!(
            author = %author,
            records = recovery.records,
            corrupt = recovery.corrupt.len(),
            next_position,
            "operation log opened"
        );

        let log = Self {
            dir,
            author,
            config,
            codec,
            sealed,
            active,
            next_position,
            last_local_counter,
            logged,
            floor,
            dirty: false,
        };
        Ok((log, recovery))
    }

    /// Append a locally generated operation.
    ///
    /// Fails with [`CorruptionError::CounterRegression`] if a local op does
    /// not strictly increase the local counter.
    pub fn append(&mut self, op: &Operation) -> Result<AppendOutcome, LogError> {
        if op.author() == self.author && op.id.counter <= self.last_local_counter {
            return Err(CorruptionError::CounterRegression {
                author: self.author,
                last: self.last_local_counter,
                got: op.id.counter,
            }
            .into());
        }
        self.write(op)
    }

    /// Append an operation received from a peer. Already-logged ops are
    /// skipped.
    ///
    /// Our own ops echoed back by a peer (e.g. after local data loss) are
    /// accepted without the monotonicity check.
    pub fn append_replicated(&mut self, op: &Operation) -> Result<AppendOutcome, LogError> {
        if self.logged.contains(op.id) {
            return Ok(AppendOutcome::Duplicate);
        }
        self.write(op)
    }

    fn write(&mut self, op: &Operation) -> Result<AppendOutcome, LogError> {
        let payload = self.codec.encode(std::slice::from_ref(op));
        let frame = encode_record(&payload);

        if !self.active.is_empty()
            && self.active.len() + frame.len() as u64 > self.config.max_segment_bytes
        {
            self.rotate()?;
        }

        self.active.append(&frame)?;
        match self.config.durability {
            Durability::PerAppend => self.active.sync()?,
            Durability::Explicit => self.dirty = true,
        }

        let position = self.next_position;
        self.next_position += 1;
        self.logged.observe(op.id);
        if op.author() == self.author {
            self.last_local_counter = self.last_local_counter.max(op.id.counter);
        }

        debug!(
            op = %op.id,
            kind = op.kind.name(),
            position,
            bytes = frame.len(),
            "appended op"
        );
        Ok(AppendOutcome::Appended {
            position,
            bytes: frame.len() as u64,
        })
    }

    fn rotate(&mut self) -> Result<(), LogError> {
        self.active.sync()?;
        self.dirty = false;

        let header = *self.active.header();
        let next = SegmentWriter::create(
            &self.dir,
            SegmentHeader {
                segment_id: header.segment_id + 1,
                author: self.author,
                start_counter: self.last_local_counter,
                start_position: self.next_position,
            },
        )?;
        // Seal only once the successor exists
        self.sealed.push(SegmentMeta {
            id: header.segment_id,
            path: self.active.path().to_path_buf(),
            start: header.start_position,
            end: self.next_position,
            readable: true,
        });
        self.active = next;
        debug!(segment = header.segment_id, "sealed log segment");
        Ok(())
    }

    /// Make every append so far durable.
    ///
    /// Required under [`Durability::Explicit`] before acknowledging ops to
    /// other devices; a no-op under [`Durability::PerAppend`].
    pub fn flush(&mut self) -> Result<(), LogError> {
        if self.dirty {
            self.active.sync()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Read records from `from` to the current end of the log.
    pub fn read(&self, from: LogPosition) -> Result<LogReader, LogError> {
        if from < self.floor {
            return Err(LogError::Compacted {
                requested: from,
                floor: self.floor,
            });
        }
        let mut segments = self.sealed.clone();
        let header = self.active.header();
        segments.push(SegmentMeta {
            id: header.segment_id,
            path: self.active.path().to_path_buf(),
            start: header.start_position,
            end: self.next_position,
            readable: true,
        });
        Ok(LogReader::new(segments, self.codec.clone(), from))
    }

    /// Delete sealed segments that lie wholly below `position`.
    ///
    /// Returns the number of segments removed.
    pub fn truncate_before(&mut self, position: LogPosition) -> Result<usize, LogError> {
        let keep_from = self
            .sealed
            .iter()
            .position(|s| s.end > position)
            .unwrap_or(self.sealed.len());
        if keep_from == 0 {
            return Ok(0);
        }

        let removed: Vec<SegmentMeta> = self.sealed.drain(..keep_from).collect();
        for segment in &removed {
            fs::remove_file(&segment.path).map_err(|e| LogError::io(&segment.path, e))?;
        }
        fsync_dir(&self.dir)?;

        self.floor = self
            .sealed
            .first()
            .map_or(self.active.header().start_position, |s| s.start);
        info!(
            removed = removed.len(),
            floor = self.floor,
            "truncated operation log"
        );
        Ok(removed.len())
    }

    /// Replace the set of ops considered logged.
    ///
    /// Used after recovery so ops lost with a corrupt segment can be logged
    /// again when a peer resends them.
    pub(crate) fn reset_logged(&mut self, observed: VersionVector) {
        self.logged = observed;
    }

    /// Raise the local counter floor (e.g. from a snapshot's vector).
    pub(crate) fn observe_local_counter(&mut self, counter: u64) {
        self.last_local_counter = self.last_local_counter.max(counter);
    }

    /// Local author.
    pub fn author(&self) -> AuthorId {
        self.author
    }

    /// Position the next record will receive.
    pub fn next_position(&self) -> LogPosition {
        self.next_position
    }

    /// First position still retained.
    pub fn floor(&self) -> LogPosition {
        self.floor
    }

    /// Highest local counter ever written.
    pub fn last_local_counter(&self) -> u64 {
        self.last_local_counter
    }

    /// Ops recorded in the log.
    pub fn logged(&self) -> &VersionVector {
        &self.logged
    }

    /// Number of segment files, including the active one.
    pub fn segment_count(&self) -> usize {
        self.sealed.len() + 1
    }

    /// Log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn record_codec() -> PatchCodec {
    PatchCodec::new(&CodecConfig {
        compress: false,
        ..Default::default()
    })
}

fn remove_stale_temp_files(dir: &Path) -> Result<(), LogError> {
    let suffix = format!(".{SEGMENT_EXTENSION}.tmp");
    let entries = fs::read_dir(dir).map_err(|e| LogError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| LogError::io(dir, e))?;
        let is_stale = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(&suffix));
        if is_stale {
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| LogError::io(&path, e))?;
            debug!(path = %path.display(), "removed stale segment temp file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpId, OpKind, SamplePoint, StrokeData};
    use crate::log::segment::segment_file_name;

    const ME: AuthorId = AuthorId(1);
    const PEER: AuthorId = AuthorId(2);

    fn op(author: AuthorId, counter: u64, ctx: &[(AuthorId, u64)]) -> Operation {
        let points = (0..4)
            .map(|i| SamplePoint::new(i as f32, 1.0, i * 10, 0.4))
            .collect();
        Operation::new(
            OpId::new(author, counter),
            ctx.iter().copied().collect(),
            OpKind::InsertStroke(StrokeData::new(points, 1)),
        )
    }

    fn local_ops(n: u64) -> Vec<Operation> {
        (1..=n).map(|c| op(ME, c, &[(ME, c - 1)])).collect()
    }

    fn small_segments() -> LogConfig {
        LogConfig {
            max_segment_bytes: 400,
            durability: Durability::PerAppend,
        }
    }

    fn read_all(log: &OperationLog, from: LogPosition) -> Vec<(LogPosition, Operation)> {
        log.read(from).unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_append_read_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ops = local_ops(5);
        {
            let (mut log, recovery) =
                OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
            assert!(recovery.is_clean());
            for (i, o) in ops.iter().enumerate() {
                assert_eq!(log.append(o).unwrap().position(), Some(i as u64));
            }
        }

        let (log, recovery) = OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
        assert!(recovery.is_clean());
        assert_eq!(recovery.records, 5);
        assert_eq!(log.next_position(), 5);
        assert_eq!(log.last_local_counter(), 5);

        let read: Vec<Operation> = read_all(&log, 0).into_iter().map(|(_, o)| o).collect();
        assert_eq!(read, ops);
        assert_eq!(read_all(&log, 3).first().map(|(p, _)| *p), Some(3));
    }

    #[test]
    fn test_counter_regression_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
        log.append(&op(ME, 5, &[])).unwrap();

        let err = log.append(&op(ME, 3, &[])).unwrap_err();
        assert!(matches!(
            err,
            LogError::Corruption(CorruptionError::CounterRegression { last: 5, got: 3, .. })
        ));
        assert!(log.append(&op(ME, 5, &[])).is_err());
        assert_eq!(log.append(&op(ME, 6, &[(ME, 5)])).unwrap().position(), Some(1));
    }

    #[test]
    fn test_remote_duplicates_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
        let remote = op(PEER, 1, &[]);
        assert!(log.append_replicated(&remote).unwrap().position().is_some());
        assert_eq!(log.append_replicated(&remote).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(log.next_position(), 1);
    }

    #[test]
    fn test_rotation_and_positions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ops = local_ops(12);
        {
            let (mut log, _) = OperationLog::open(dir.path(), ME, small_segments()).unwrap();
            for o in &ops {
                log.append(o).unwrap();
            }
            assert!(log.segment_count() > 2);
        }

        let (log, recovery) = OperationLog::open(dir.path(), ME, small_segments()).unwrap();
        assert!(recovery.is_clean());
        let read = read_all(&log, 0);
        assert_eq!(read.len(), 12);
        for (i, (pos, o)) in read.iter().enumerate() {
            assert_eq!(*pos, i as u64);
            assert_eq!(o, &ops[i]);
        }
    }

    #[test]
    fn test_explicit_durability_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            durability: Durability::Explicit,
            ..Default::default()
        };
        let (mut log, _) = OperationLog::open(dir.path(), ME, config.clone()).unwrap();
        for o in local_ops(3) {
            log.append(&o).unwrap();
        }
        log.flush().unwrap();
        drop(log);

        let (log, _) = OperationLog::open(dir.path(), ME, config).unwrap();
        assert_eq!(log.next_position(), 3);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, _) = OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
            for o in local_ops(3) {
                log.append(&o).unwrap();
            }
        }
        let path = dir.path().join(segment_file_name(1));
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes.truncate(len - 5);
        fs::write(&path, &bytes).unwrap();

        let (mut log, recovery) = OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
        assert!(recovery.is_clean());
        assert!(recovery.truncated_bytes > 0);
        assert_eq!(log.next_position(), 2);

        // The lost op was never acknowledged, so it can be written again
        let third = local_ops(3).pop().unwrap();
        assert_eq!(log.append(&third).unwrap().position(), Some(2));
        assert_eq!(read_all(&log, 0).len(), 3);
    }

    #[test]
    fn test_corrupt_segment_reported_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ops = local_ops(12);
        {
            let (mut log, _) = OperationLog::open(dir.path(), ME, small_segments()).unwrap();
            for o in &ops {
                log.append(o).unwrap();
            }
        }

        // Flip a payload byte in the first segment
        let path = dir.path().join(segment_file_name(1));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let (log, recovery) = OperationLog::open(dir.path(), ME, small_segments()).unwrap();
        assert_eq!(recovery.corrupt.len(), 1);
        let corrupt = &recovery.corrupt[0];
        assert_eq!(corrupt.segment_id, 1);
        assert_eq!(corrupt.positions.start, 0);
        assert!(corrupt.positions.end > 0);

        let read = read_all(&log, 0);
        assert_eq!(read.first().map(|(p, _)| *p), Some(corrupt.positions.end));
        assert_eq!(read.len() as u64, 12 - corrupt.positions.end);
        assert_eq!(log.next_position(), 12);
        // Counters from later segments still guard against reuse
        assert_eq!(log.last_local_counter(), 12);
    }

    #[test]
    fn test_truncate_before_sets_floor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = OperationLog::open(dir.path(), ME, small_segments()).unwrap();
        for o in local_ops(12) {
            log.append(&o).unwrap();
        }
        let segments_before = log.segment_count();

        let removed = log.truncate_before(8).unwrap();
        assert!(removed > 0);
        assert_eq!(log.segment_count(), segments_before - removed);
        assert!(log.floor() > 0 && log.floor() <= 8);

        assert!(matches!(log.read(0), Err(LogError::Compacted { .. })));
        let read = read_all(&log, log.floor());
        assert_eq!(read.last().map(|(p, _)| *p), Some(11));

        // Floor survives reopen
        let floor = log.floor();
        drop(log);
        let (log, _) = OperationLog::open(dir.path(), ME, small_segments()).unwrap();
        assert_eq!(log.floor(), floor);
        assert_eq!(log.next_position(), 12);
    }

    #[test]
    fn test_reader_is_lazy_snapshot_of_length() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
        for o in local_ops(2) {
            log.append(&o).unwrap();
        }
        let reader = log.read(0).unwrap();
        log.append(&op(ME, 3, &[(ME, 2)])).unwrap();
        assert_eq!(reader.count(), 2);
    }

    #[test]
    fn test_stale_temp_removed() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(format!("{}.tmp", segment_file_name(9)));
        fs::write(&stale, b"junk").unwrap();
        let _ = OperationLog::open(dir.path(), ME, LogConfig::default()).unwrap();
        assert!(!stale.exists());
    }
}
