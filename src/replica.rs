//! One device's replica: log, store and snapshots wired together.
//!
//! The [`Replica`] is the only writer of its operation log. Local capture,
//! remote batches and catch-up adoption all funnel through the log lock, so
//! the log records ops in the order the store applied them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
#[cfg(feature = "runtime")]
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::core::{
    AuthorId, CatchUp, DataLossWarning, InkError, LogError, LogPosition, OpId, OpKind, Operation,
    RemoteApply, SyncError, SyncReplica, VersionVector,
};
use crate::log::{LogRecovery, OperationLog};
use crate::snapshot::{SnapshotManager, SnapshotMeta, SnapshotTrigger};
use crate::store::{Document, DocumentStore};

/// Subdirectory holding log segments.
pub const LOG_DIR: &str = "log";

/// Subdirectory holding snapshots.
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Local op batches buffered for slow feed subscribers.
#[cfg(feature = "runtime")]
const FEED_CAPACITY: usize = 1024;

/// What opening a replica found and did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Snapshot the document was rebuilt from.
    pub snapshot_version: Option<u64>,
    /// Log records replayed on top of the snapshot.
    pub replayed: u64,
    /// What opening the log found.
    pub log: LogRecovery,
    /// Log ranges that could not be restored.
    pub data_loss: Vec<DataLossWarning>,
    /// Ops applied even though some of their dependencies were lost.
    pub forced: usize,
}

impl RecoveryReport {
    /// Check if recovery lost nothing.
    pub fn is_clean(&self) -> bool {
        self.data_loss.is_empty() && self.log.is_clean()
    }
}

#[derive(Debug)]
struct LogState {
    log: OperationLog,
    bytes_since_snapshot: u64,
    /// Ops in the store that the log can no longer reproduce
    gap: VersionVector,
    /// Observed vector of each snapshot, by log position
    snapshot_vectors: BTreeMap<LogPosition, VersionVector>,
    /// Newest snapshot known to be on disk
    durable_snapshot: Option<LogPosition>,
}

impl LogState {
    /// Append ops received from peers and make them durable.
    fn record_replicated(&mut self, ops: &[Operation]) -> Result<(), LogError> {
        let mut bytes = 0;
        for op in ops {
            bytes += self.log.append_replicated(op)?.bytes();
        }
        self.log.flush()?;
        self.bytes_since_snapshot += bytes;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PeerAck {
    acked: VersionVector,
    last_seen: Instant,
}

/// A local replica of one shared document.
pub struct Replica {
    author: AuthorId,
    dir: PathBuf,
    config: CoreConfig,
    store: DocumentStore,
    log: Mutex<LogState>,
    snapshots: SnapshotManager,
    peers: Mutex<HashMap<AuthorId, PeerAck>>,
    #[cfg(feature = "runtime")]
    feed: broadcast::Sender<Vec<Operation>>,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("author", &self.author)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Open (or create) the replica stored in `dir`, recovering from any
    /// crash or corruption.
    pub fn open(
        dir: impl AsRef<Path>,
        author: AuthorId,
        config: CoreConfig,
    ) -> Result<(Self, RecoveryReport), InkError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();

        let (mut log, log_recovery) =
            OperationLog::open(dir.join(LOG_DIR), author, config.log.clone())?;
        let snapshots =
            SnapshotManager::open(dir.join(SNAPSHOT_DIR), config.snapshot.clone(), &config.codec)?;
        let recovery = snapshots.recover(&log_recovery.corrupt)?;

        let mut report = RecoveryReport {
            snapshot_version: recovery.snapshot.as_ref().map(|s| s.version),
            data_loss: recovery.warnings.clone(),
            ..RecoveryReport::default()
        };

        let store = match &recovery.snapshot {
            Some(snapshot) => DocumentStore::from_document(Document::clone(&snapshot.document)),
            None => DocumentStore::new(),
        };

        let mut from = recovery.replay_from();
        if from < log.floor() {
            // The snapshot that justified compaction is gone
            let warning = DataLossWarning {
                segment: 0,
                lost: from..log.floor(),
            };
            warn!(from, floor = log.floor(), "{warning}");
            report.data_loss.push(warning);
            from = log.floor();
        }

        let mut replayed = Vec::new();
        for entry in log.read(from)? {
            match entry {
                Ok((_, op)) => replayed.push(op),
                Err(err) => warn!(error = %err, "skipping unreadable log records"),
            }
        }
        report.replayed = replayed.len() as u64;
        let outcome = store.apply_batch(replayed.iter().cloned());

        if !report.data_loss.is_empty() && outcome.pending > 0 {
            // Dependencies that were lost will never arrive from this log;
            // adopt them in log order so later ops become visible
            for op in &replayed {
                if store.has_observed(op.id) || store.pending_count() == 0 {
                    continue;
                }
                let released = store.adopt_observed(&op.causal_context);
                report.forced += released.len();
            }
            warn!(forced = report.forced, "applied ops whose dependencies were lost");
        }

        let observed = store.version_vector();
        log.observe_local_counter(observed.get(author));
        log.reset_logged(observed);

        let store = store.with_pending_limit(config.sync.max_pending_ops);

        let mut snapshot_vectors = BTreeMap::new();
        let mut gap = VersionVector::new();
        let mut durable_snapshot = None;
        if let Some(snapshot) = &recovery.snapshot {
            let covered = snapshot.document.observed().clone();
            if log.floor() > 0 || !log_recovery.corrupt.is_empty() {
                gap = covered.clone();
            }
            snapshot_vectors.insert(snapshot.log_position, covered);
            durable_snapshot = Some(snapshot.log_position);
        }
        if !report.data_loss.is_empty() {
            // Forced releases left holes the log cannot replay to peers
            gap.merge(&store.version_vector());
        }
        report.log = log_recovery;

        info!(
            author = %author,
            snapshot = ?report.snapshot_version,
            replayed = report.replayed,
            pending = store.pending_count(),
            data_loss = report.data_loss.len(),
            "replica opened"
        );

        #[cfg(feature = "runtime")]
        let (feed, _) = broadcast::channel(FEED_CAPACITY);

        let replica = Self {
            author,
            dir,
            config,
            store,
            log: Mutex::new(LogState {
                log,
                bytes_since_snapshot: 0,
                gap,
                snapshot_vectors,
                durable_snapshot,
            }),
            snapshots,
            peers: Mutex::new(HashMap::new()),
            #[cfg(feature = "runtime")]
            feed,
        };
        Ok((replica, report))
    }

    /// Local author.
    pub fn author(&self) -> AuthorId {
        self.author
    }

    /// Replica directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the replica was opened with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Immutable view of the current document.
    pub fn snapshot_view(&self) -> Arc<Document> {
        self.store.snapshot_view()
    }

    /// Position the next logged op will receive.
    pub fn log_position(&self) -> LogPosition {
        self.log.lock().log.next_position()
    }

    /// First log position still retained.
    pub fn log_floor(&self) -> LogPosition {
        self.log.lock().log.floor()
    }

    /// Remote ops waiting for their dependencies.
    pub fn pending_count(&self) -> usize {
        self.store.pending_count()
    }

    /// Subscribe to ops as they are committed or applied.
    ///
    /// Each sync driver holds one subscription and pushes what it receives.
    #[cfg(feature = "runtime")]
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Operation>> {
        self.feed.subscribe()
    }

    /// Capture a new local operation.
    ///
    /// The op gets the next Lamport counter and the current version vector
    /// as its causal context, and is durably logged before it is applied.
    pub fn capture(&self, kind: OpKind) -> Result<Operation, InkError> {
        let mut state = self.log.lock();
        let context = self.store.version_vector();
        let counter = context
            .max_counter()
            .max(state.log.last_local_counter())
            .checked_add(1)
            .ok_or(InkError::CounterExhausted(self.author))?;
        let op = Operation::new(OpId::new(self.author, counter), context, kind);
        self.commit_locked(&mut state, op.clone())?;
        Ok(op)
    }

    /// Commit a local operation built by the caller.
    pub fn commit_local(&self, op: Operation) -> Result<(), InkError> {
        let invalid = |reason| InkError::InvalidOperation { op: op.id, reason };
        if op.author() != self.author {
            return Err(invalid("not authored by this replica"));
        }
        if !op.is_well_formed() {
            return Err(invalid("counter does not exceed its causal context"));
        }
        let mut state = self.log.lock();
        if !self.store.version_vector().dominates(&op.causal_context) {
            return Err(invalid("causal context names unobserved ops"));
        }
        self.commit_locked(&mut state, op)
    }

    fn commit_locked(&self, state: &mut LogState, op: Operation) -> Result<(), InkError> {
        let appended = state.log.append(&op)?;
        state.bytes_since_snapshot += appended.bytes();
        debug!(op = %op.id, kind = op.kind.name(), "committed local op");
        self.store.apply(op.clone());
        self.publish(vec![op]);
        self.after_commit(state, false);
        Ok(())
    }

    /// Make every logged op durable (needed under explicit durability).
    pub fn flush(&self) -> Result<(), InkError> {
        self.log.lock().log.flush()?;
        Ok(())
    }

    /// Purge stable tombstones, write a snapshot now, then collect old
    /// snapshots and log segments every peer has moved past.
    pub fn compact(&self) -> Result<SnapshotMeta, InkError> {
        let meta = {
            let mut state = self.log.lock();
            state.log.flush()?;
            self.purge_stable_tombstones();
            let view = self.store.snapshot_view();
            let position = state.log.next_position();
            let meta = self.snapshots.snapshot_now(Arc::clone(&view), position)?;
            state
                .snapshot_vectors
                .insert(position, view.observed().clone());
            state.durable_snapshot = Some(position);
            state.bytes_since_snapshot = 0;
            meta
        };
        self.snapshots.gc(self.config.snapshot.retain)?;
        self.truncate_log();
        Ok(meta)
    }

    /// Block until a background snapshot (if any) is written.
    pub fn wait_for_snapshot(&self) -> Result<Option<SnapshotMeta>, InkError> {
        Ok(self.snapshots.wait()?)
    }

    /// Peers whose acknowledgments are being tracked.
    pub fn known_peers(&self) -> Vec<AuthorId> {
        let mut peers: Vec<AuthorId> = self.peers.lock().keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Everything every known peer has acknowledged, capped by what we have.
    ///
    /// `None` while no peer is known.
    pub fn stable_vector(&self) -> Option<VersionVector> {
        let peers = self.peers.lock();
        if peers.is_empty() {
            return None;
        }
        let local = self.store.version_vector();
        Some(peers.values().fold(local, |stable, p| stable.meet(&p.acked)))
    }

    fn purge_stable_tombstones(&self) -> usize {
        let Some(stable) = self.stable_vector() else {
            return 0;
        };
        let purged = self.store.purge_stable_tombstones(&stable);
        if purged > 0 {
            info!(purged, "purged stable tombstones");
        }
        purged
    }

    /// Evaluate snapshot thresholds after a commit.
    fn after_commit(&self, state: &mut LogState, force: bool) {
        if let Some(err) = self.snapshots.take_error() {
            warn!(error = %err, "background snapshot failed");
        }
        if let Some(meta) = self.snapshots.last_completed() {
            state.durable_snapshot = state.durable_snapshot.max(Some(meta.log_position));
        }

        let position = state.log.next_position();
        let bytes_since = if force {
            u64::MAX
        } else {
            state.bytes_since_snapshot
        };
        if !self.snapshots.is_due(position, bytes_since) {
            return;
        }
        if let Err(err) = state.log.flush() {
            warn!(error = %err, "log flush before snapshot failed");
            return;
        }
        self.purge_stable_tombstones();
        let view = self.store.snapshot_view();
        let covered = view.observed().clone();
        match self.snapshots.maybe_snapshot(view, position, bytes_since) {
            Ok(SnapshotTrigger::Started { version }) => {
                debug!(version, position, "snapshot scheduled");
                state.snapshot_vectors.insert(position, covered);
                state.bytes_since_snapshot = 0;
            }
            Ok(SnapshotTrigger::Coalesced | SnapshotTrigger::NotDue) => {}
            Err(err) => warn!(error = %err, "could not start snapshot"),
        }
    }

    /// Drop log segments below the newest snapshot once every known peer
    /// has acknowledged everything the snapshot covers.
    fn truncate_log(&self) {
        let mut state = self.log.lock();
        if let Some(meta) = self.snapshots.last_completed() {
            state.durable_snapshot = state.durable_snapshot.max(Some(meta.log_position));
        }
        let Some(position) = state.durable_snapshot else {
            return;
        };
        if position <= state.log.floor() {
            return;
        }
        let Some(covered) = state.snapshot_vectors.get(&position).cloned() else {
            return;
        };
        {
            let peers = self.peers.lock();
            if peers.is_empty() || !peers.values().all(|p| p.acked.dominates(&covered)) {
                return;
            }
        }
        state.gap.merge(&covered);
        match state.log.truncate_before(position) {
            Ok(removed) => {
                if removed > 0 {
                    let floor = state.log.floor();
                    state.snapshot_vectors = state.snapshot_vectors.split_off(&floor.min(position));
                }
            }
            Err(err) => warn!(error = %err, "log truncation failed"),
        }
    }

    fn expire_peers(&self, peers: &mut HashMap<AuthorId, PeerAck>, now: Instant) {
        let retention = self.config.sync.peer_retention;
        peers.retain(|peer, ack| {
            let keep = now.saturating_duration_since(ack.last_seen) < retention;
            if !keep {
                debug!(peer = %peer, "forgetting idle peer acknowledgments");
            }
            keep
        });
    }

    /// State-based catch-up: ops whose fold reproduces the document.
    fn synthesized_missing(&self, remote: &VersionVector) -> CatchUp {
        let view = self.store.snapshot_view();
        let mut ops: Vec<Operation> = view
            .synthesize_operations()
            .into_iter()
            .filter(|op| !remote.contains(op.id))
            .collect();
        ops.extend(
            self.store
                .pending_ops()
                .into_iter()
                .filter(|op| !remote.contains(op.id)),
        );
        info!(ops = ops.len(), "state-based catch-up");
        CatchUp::from_state(ops)
    }

    #[cfg(feature = "runtime")]
    fn publish(&self, ops: Vec<Operation>) {
        if !ops.is_empty() {
            // No subscribers is fine
            let _ = self.feed.send(ops);
        }
    }

    #[cfg(not(feature = "runtime"))]
    fn publish(&self, _ops: Vec<Operation>) {}
}

fn replica_error(err: impl fmt::Display) -> SyncError {
    SyncError::Replica(err.to_string())
}

impl SyncReplica for Replica {
    fn author(&self) -> AuthorId {
        self.author
    }

    fn version_vector(&self) -> VersionVector {
        self.store.version_vector()
    }

    fn ops_missing(&self, remote: &VersionVector) -> Result<CatchUp, SyncError> {
        let reader = {
            let mut state = self.log.lock();
            state.log.flush().map_err(replica_error)?;
            if !remote.dominates(&state.gap) {
                drop(state);
                return Ok(self.synthesized_missing(remote));
            }
            state.log.read(state.log.floor()).map_err(replica_error)?
        };

        let mut ops = Vec::new();
        for entry in reader {
            match entry {
                Ok((_, op)) if !remote.contains(op.id) => ops.push(op),
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "log unreadable during catch-up");
                    return Ok(self.synthesized_missing(remote));
                }
            }
        }
        Ok(CatchUp::from_log(ops))
    }

    fn apply_remote(&self, ops: Vec<Operation>) -> Result<RemoteApply, SyncError> {
        let mut state = self.log.lock();
        let outcome = self
            .store
            .apply_batch_durably(ops, |applied| state.record_replicated(applied))
            .map_err(replica_error)?;

        let summary = RemoteApply {
            applied: outcome.applied.len(),
            duplicates: outcome.duplicates,
            pending: outcome.pending,
            rejected: outcome.rejected,
        };
        self.publish(outcome.applied);
        self.after_commit(&mut state, false);
        Ok(summary)
    }

    fn adopt_remote_state(&self, remote: &VersionVector) -> Result<(), SyncError> {
        let mut state = self.log.lock();
        if self.store.version_vector().dominates(remote) {
            return Ok(());
        }
        let released = self
            .store
            .adopt_observed_durably(remote, |released| state.record_replicated(released))
            .map_err(replica_error)?;
        info!(released = released.len(), "adopted remote state");
        self.publish(released);
        // Adopted coverage is not in the log; only a snapshot preserves it
        self.after_commit(&mut state, true);
        Ok(())
    }

    fn peer_acknowledged(&self, peer: AuthorId, acked: &VersionVector) {
        {
            let now = Instant::now();
            let mut peers = self.peers.lock();
            let entry = peers.entry(peer).or_insert_with(|| PeerAck {
                acked: VersionVector::new(),
                last_seen: now,
            });
            entry.acked.merge(acked);
            entry.last_seen = now;
            self.expire_peers(&mut peers, now);
        }
        self.truncate_log();
    }
}
