//! Snapshot scheduling, recovery, and retention.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::format::{Snapshot, parse_snapshot_file_name, read_snapshot_file, write_snapshot_file};
use crate::codec::Compressor;
use crate::config::{CodecConfig, SnapshotConfig};
use crate::core::{DataLossWarning, LogPosition, SnapshotError};
use crate::log::CorruptSegment;
use crate::store::Document;

/// Outcome of [`SnapshotManager::maybe_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTrigger {
    /// Neither threshold reached.
    NotDue,
    /// A background snapshot was started.
    Started {
        /// Version being written.
        version: u64,
    },
    /// A snapshot is already being written; this trigger was folded into it.
    Coalesced,
}

/// A snapshot that has been durably written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Snapshot version.
    pub version: u64,
    /// Log position covered.
    pub log_position: LogPosition,
    /// Creation time.
    pub created_at_ms: u64,
    /// File on disk.
    pub path: PathBuf,
}

/// What recovery should rebuild from.
#[derive(Debug, Default)]
pub struct SnapshotRecovery {
    /// Newest valid snapshot, if any.
    pub snapshot: Option<Snapshot>,
    /// Log ranges neither the snapshot nor the log can restore.
    pub warnings: Vec<DataLossWarning>,
}

impl SnapshotRecovery {
    /// Log position replay should start from.
    pub fn replay_from(&self) -> LogPosition {
        self.snapshot.as_ref().map_or(0, |s| s.log_position)
    }
}

#[derive(Debug)]
struct Schedule {
    next_version: u64,
    last_position: LogPosition,
    last_started: Instant,
    last: Option<SnapshotMeta>,
    error: Option<SnapshotError>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    in_flight: AtomicBool,
    schedule: Mutex<Schedule>,
}

/// Writes snapshots off the mutation path, one at a time.
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
    config: SnapshotConfig,
    compressor: Compressor,
    compress: bool,
    shared: Arc<Shared>,
}

impl SnapshotManager {
    /// Open (creating if needed) a snapshot directory.
    pub fn open(
        dir: impl Into<PathBuf>,
        config: SnapshotConfig,
        codec: &CodecConfig,
    ) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        let newest = list_snapshots(&dir)?.last().map_or(0, |(v, _)| *v);

        Ok(Self {
            compressor: Compressor::new(codec),
            compress: codec.compress,
            shared: Arc::new(Shared {
                in_flight: AtomicBool::new(false),
                schedule: Mutex::new(Schedule {
                    next_version: newest + 1,
                    last_position: 0,
                    last_started: Instant::now(),
                    last: None,
                    error: None,
                    worker: None,
                }),
            }),
            dir,
            config,
        })
    }

    /// Snapshot directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record where the recovered state came from, so thresholds count from it.
    pub fn mark_recovered(&self, snapshot: &Snapshot) {
        let mut schedule = self.shared.schedule.lock();
        schedule.last_position = snapshot.log_position;
        schedule.next_version = schedule.next_version.max(snapshot.version + 1);
    }

    /// Whether a threshold has been crossed at `position`.
    pub fn is_due(&self, position: LogPosition, bytes_since: u64) -> bool {
        let schedule = self.shared.schedule.lock();
        let new_data = position > schedule.last_position;
        bytes_since >= self.config.size_threshold
            || (new_data && schedule.last_started.elapsed() >= self.config.time_threshold)
    }

    /// Start a background snapshot if a threshold has been crossed.
    ///
    /// `bytes_since` is the number of log bytes appended since the last
    /// snapshot started. A trigger while one is running is coalesced.
    pub fn maybe_snapshot(
        &self,
        view: Arc<Document>,
        position: LogPosition,
        bytes_since: u64,
    ) -> Result<SnapshotTrigger, SnapshotError> {
        if !self.is_due(position, bytes_since) {
            return Ok(SnapshotTrigger::NotDue);
        }
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(position, "snapshot already in flight, coalescing");
            return Ok(SnapshotTrigger::Coalesced);
        }

        let mut schedule = self.shared.schedule.lock();
        // Reap the previous worker; it has already cleared the flag
        if let Some(previous) = schedule.worker.take() {
            let _ = previous.join();
        }
        let snapshot = begin(&mut schedule, view, position);
        let version = snapshot.version;

        let job = Job {
            dir: self.dir.clone(),
            compressor: self.compress.then(|| self.compressor.clone()),
            retain: self.config.retain,
            shared: Arc::clone(&self.shared),
        };
        let spawned = thread::Builder::new()
            .name("inksync-snapshot".into())
            .spawn(move || job.run(snapshot));
        match spawned {
            Ok(handle) => {
                schedule.worker = Some(handle);
                info!(version, position, bytes_since, "snapshot started");
                Ok(SnapshotTrigger::Started { version })
            }
            Err(source) => {
                self.shared.in_flight.store(false, Ordering::Release);
                Err(SnapshotError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        }
    }

    /// Write a snapshot on the calling thread, after any in-flight one.
    pub fn snapshot_now(
        &self,
        view: Arc<Document>,
        position: LogPosition,
    ) -> Result<SnapshotMeta, SnapshotError> {
        loop {
            self.wait()?;
            if self
                .shared
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            thread::yield_now();
        }
        let snapshot = {
            let mut schedule = self.shared.schedule.lock();
            begin(&mut schedule, view, position)
        };
        let job = Job {
            dir: self.dir.clone(),
            compressor: self.compress.then(|| self.compressor.clone()),
            retain: self.config.retain,
            shared: Arc::clone(&self.shared),
        };
        let result = job.write(&snapshot);
        if let Ok(meta) = &result {
            self.shared.schedule.lock().last = Some(meta.clone());
        }
        self.shared.in_flight.store(false, Ordering::Release);
        result
    }

    /// Block until the in-flight snapshot (if any) finishes.
    ///
    /// Returns the error the background writer hit, if any.
    pub fn wait(&self) -> Result<Option<SnapshotMeta>, SnapshotError> {
        let worker = self.shared.schedule.lock().worker.take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                self.shared.in_flight.store(false, Ordering::Release);
                return Err(SnapshotError::Io {
                    path: self.dir.clone(),
                    source: io::Error::other("snapshot writer panicked"),
                });
            }
        }
        let mut schedule = self.shared.schedule.lock();
        match schedule.error.take() {
            Some(err) => Err(err),
            None => Ok(schedule.last.clone()),
        }
    }

    /// Whether a background snapshot is being written.
    pub fn in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Most recent snapshot this manager completed.
    pub fn last_completed(&self) -> Option<SnapshotMeta> {
        self.shared.schedule.lock().last.clone()
    }

    /// Error from the last background write, if not yet collected.
    pub fn take_error(&self) -> Option<SnapshotError> {
        self.shared.schedule.lock().error.take()
    }

    /// Load the newest snapshot whose checksums verify.
    ///
    /// Corrupt files are skipped with a warning.
    pub fn latest(&self) -> Result<Option<Snapshot>, SnapshotError> {
        for (version, path) in list_snapshots(&self.dir)?.into_iter().rev() {
            match read_snapshot_file(&path, &self.compressor) {
                Ok(snapshot) => {
                    debug!(version, position = snapshot.log_position, "loaded snapshot");
                    return Ok(Some(snapshot));
                }
                Err(err) => warn!(version, error = %err, "skipping invalid snapshot"),
            }
        }
        Ok(None)
    }

    /// Pick the snapshot to rebuild from and report what cannot be restored.
    ///
    /// A corrupt segment's positions are lost unless the snapshot already
    /// covers them.
    pub fn recover(&self, corrupt: &[CorruptSegment]) -> Result<SnapshotRecovery, SnapshotError> {
        let snapshot = self.latest()?;
        let covered = snapshot.as_ref().map_or(0, |s| s.log_position);

        let warnings: Vec<DataLossWarning> = corrupt
            .iter()
            .filter(|seg| seg.positions.end > covered)
            .map(|seg| DataLossWarning {
                segment: seg.segment_id,
                lost: seg.positions.start.max(covered)..seg.positions.end,
            })
            .filter(|w| !w.lost.is_empty())
            .collect();
        for warning in &warnings {
            warn!(
                segment = warning.segment,
                from = warning.lost.start,
                to = warning.lost.end,
                "{warning}"
            );
        }
        if let Some(snapshot) = &snapshot {
            self.mark_recovered(snapshot);
            info!(
                version = snapshot.version,
                position = snapshot.log_position,
                "recovering from snapshot"
            );
        }
        Ok(SnapshotRecovery { snapshot, warnings })
    }

    /// Delete all but the newest `retain` snapshots. Returns files removed.
    pub fn gc(&self, retain: usize) -> Result<usize, SnapshotError> {
        gc_dir(&self.dir, retain, false)
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        if let Some(worker) = self.shared.schedule.lock().worker.take() {
            let _ = worker.join();
        }
    }
}

fn begin(schedule: &mut Schedule, view: Arc<Document>, position: LogPosition) -> Snapshot {
    let version = schedule.next_version;
    schedule.next_version += 1;
    schedule.last_position = position;
    schedule.last_started = Instant::now();
    Snapshot {
        version,
        log_position: position,
        created_at_ms: now_ms(),
        document: view,
    }
}

struct Job {
    dir: PathBuf,
    compressor: Option<Compressor>,
    retain: usize,
    shared: Arc<Shared>,
}

impl Job {
    fn run(self, snapshot: Snapshot) {
        let result = self.write(&snapshot);
        {
            let mut schedule = self.shared.schedule.lock();
            match result {
                Ok(meta) => schedule.last = Some(meta),
                Err(err) => {
                    warn!(version = snapshot.version, error = %err, "snapshot failed");
                    schedule.error = Some(err);
                }
            }
        }
        self.shared.in_flight.store(false, Ordering::Release);
    }

    fn write(&self, snapshot: &Snapshot) -> Result<SnapshotMeta, SnapshotError> {
        let path = write_snapshot_file(&self.dir, snapshot, self.compressor.as_ref())?;
        info!(
            version = snapshot.version,
            position = snapshot.log_position,
            strokes = snapshot.document.strokes().count(),
            "snapshot written"
        );
        gc_dir(&self.dir, self.retain, true)?;
        Ok(SnapshotMeta {
            version: snapshot.version,
            log_position: snapshot.log_position,
            created_at_ms: snapshot.created_at_ms,
            path,
        })
    }
}

/// Snapshot files in ascending version order.
fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>, SnapshotError> {
    let io = |source| SnapshotError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(io)? {
        let entry = entry.map_err(io)?;
        let name = entry.file_name();
        if let Some(version) = name.to_str().and_then(parse_snapshot_file_name) {
            out.push((version, entry.path()));
        }
    }
    out.sort_unstable_by_key(|(v, _)| *v);
    Ok(out)
}

/// `sweep_temp` is only set by the single in-flight writer.
fn gc_dir(dir: &Path, retain: usize, sweep_temp: bool) -> Result<usize, SnapshotError> {
    let snapshots = list_snapshots(dir)?;
    let excess = snapshots.len().saturating_sub(retain.max(1));
    let mut removed = 0;
    for (version, path) in snapshots.into_iter().take(excess) {
        fs::remove_file(&path).map_err(|source| SnapshotError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(version, "removed superseded snapshot");
        removed += 1;
    }
    // Leftovers from a crash mid-write
    if !sweep_temp {
        return Ok(removed);
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                let _ = fs::remove_file(&path);
            }
        }
    }
    Ok(removed)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AuthorId, OpId, OpKind, Operation, StrokeData, VersionVector};
    use std::time::Duration;

    fn config(size_threshold: u64, time_threshold: Duration) -> SnapshotConfig {
        SnapshotConfig {
            size_threshold,
            time_threshold,
            retain: 2,
        }
    }

    fn doc(strokes: u64) -> Arc<Document> {
        let ops: Vec<Operation> = (1..=strokes)
            .map(|c| {
                let ctx: VersionVector = [(AuthorId(1), c - 1)].into_iter().collect();
                Operation::new(
                    OpId::new(AuthorId(1), c),
                    ctx,
                    OpKind::InsertStroke(StrokeData::default()),
                )
            })
            .collect();
        Arc::new(Document::fold(&ops))
    }

    fn corrupt(segment_id: u64, positions: std::ops::Range<u64>) -> CorruptSegment {
        CorruptSegment {
            segment_id,
            positions,
            error: crate::core::CorruptionError::UnreadableSegment {
                segment: segment_id,
            },
        }
    }

    #[test]
    fn test_not_due_below_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(
            dir.path(),
            config(1024, Duration::from_secs(3600)),
            &CodecConfig::default(),
        )
        .unwrap();
        assert_eq!(manager.maybe_snapshot(doc(1), 1, 100).unwrap(), SnapshotTrigger::NotDue);
        assert!(manager.latest().unwrap().is_none());
    }

    #[test]
    fn test_size_threshold_triggers_background_write() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(
            dir.path(),
            config(1024, Duration::from_secs(3600)),
            &CodecConfig::default(),
        )
        .unwrap();
        let trigger = manager.maybe_snapshot(doc(3), 3, 2048).unwrap();
        assert_eq!(trigger, SnapshotTrigger::Started { version: 1 });

        let meta = manager.wait().unwrap().unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.log_position, 3);
        assert!(!manager.in_flight());

        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(*latest.document, *doc(3));
    }

    #[test]
    fn test_time_threshold_needs_new_data() {
        let dir = tempfile::tempdir().unwrap();
        let codec = CodecConfig::default();
        let manager =
            SnapshotManager::open(dir.path(), config(u64::MAX, Duration::ZERO), &codec).unwrap();
        assert_eq!(manager.maybe_snapshot(doc(0), 0, 0).unwrap(), SnapshotTrigger::NotDue);
        assert!(matches!(
            manager.maybe_snapshot(doc(1), 1, 10).unwrap(),
            SnapshotTrigger::Started { .. }
        ));
        manager.wait().unwrap();
        assert_eq!(manager.maybe_snapshot(doc(1), 1, 0).unwrap(), SnapshotTrigger::NotDue);
    }

    #[test]
    fn test_second_trigger_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            SnapshotManager::open(dir.path(), config(1, Duration::ZERO), &CodecConfig::default())
                .unwrap();
        manager.shared.in_flight.store(true, Ordering::Release);
        assert_eq!(manager.maybe_snapshot(doc(2), 2, 10).unwrap(), SnapshotTrigger::Coalesced);
        manager.shared.in_flight.store(false, Ordering::Release);
        assert!(matches!(
            manager.maybe_snapshot(doc(2), 2, 10).unwrap(),
            SnapshotTrigger::Started { .. }
        ));
        manager.wait().unwrap();
    }

    #[test]
    fn test_latest_skips_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            SnapshotManager::open(dir.path(), config(1, Duration::ZERO), &CodecConfig::default())
                .unwrap();
        manager.snapshot_now(doc(2), 2).unwrap();
        let newer = manager.snapshot_now(doc(4), 4).unwrap();

        let mut bytes = fs::read(&newer.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&newer.path, bytes).unwrap();

        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.log_position, 2);
    }

    #[test]
    fn test_gc_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(
            dir.path(),
            SnapshotConfig {
                retain: 10,
                ..config(1, Duration::ZERO)
            },
            &CodecConfig::default(),
        )
        .unwrap();
        for n in 1..=3 {
            manager.snapshot_now(doc(n), n).unwrap();
        }
        fs::write(dir.path().join("snap-0000000000000009.isnap.tmp"), b"partial").unwrap();
        manager.snapshot_now(doc(4), 4).unwrap();

        assert_eq!(manager.gc(2).unwrap(), 2);
        let versions: Vec<u64> = list_snapshots(dir.path())
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(versions, vec![3, 4]);
        assert!(!dir.path().join("snap-0000000000000009.isnap.tmp").exists());
    }

    #[test]
    fn test_versions_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let codec = CodecConfig::default();
            let manager =
                SnapshotManager::open(dir.path(), config(1, Duration::ZERO), &codec).unwrap();
            manager.snapshot_now(doc(1), 1).unwrap();
        }
        let manager =
            SnapshotManager::open(dir.path(), config(1, Duration::ZERO), &CodecConfig::default())
                .unwrap();
        assert_eq!(manager.snapshot_now(doc(2), 2).unwrap().version, 2);
    }

    #[test]
    fn test_recover_reports_uncovered_loss() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            SnapshotManager::open(dir.path(), config(1, Duration::ZERO), &CodecConfig::default())
                .unwrap();
        manager.snapshot_now(doc(3), 1000).unwrap();

        let recovery = manager
            .recover(&[corrupt(4, 900..1000), corrupt(7, 1000..1050), corrupt(8, 980..1010)])
            .unwrap();
        assert_eq!(recovery.replay_from(), 1000);
        assert_eq!(
            recovery.warnings,
            vec![
                DataLossWarning {
                    segment: 7,
                    lost: 1000..1050,
                },
                DataLossWarning {
                    segment: 8,
                    lost: 1000..1010,
                },
            ]
        );
    }

    #[test]
    fn test_recover_without_snapshot_loses_whole_segment() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            SnapshotManager::open(dir.path(), config(1, Duration::ZERO), &CodecConfig::default())
                .unwrap();
        let recovery = manager.recover(&[corrupt(2, 10..20)]).unwrap();
        assert!(recovery.snapshot.is_none());
        assert_eq!(recovery.replay_from(), 0);
        let lost = DataLossWarning {
            segment: 2,
            lost: 10..20,
        };
        assert_eq!(recovery.warnings, vec![lost]);
    }
}
