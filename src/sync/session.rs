//! Per-peer sync session state machine.
//!
//! The session is sans-IO: callers feed it frames, local ops, and clock
//! ticks, and carry out the [`SessionAction`]s it returns. It talks to the
//! local replica only through [`SyncReplica`].
//!
//! ```text
//! Disconnected -> Handshaking -> Syncing -> Synced
//!                                   |  ^       |
//!                                   v  |       v
//!                                 Reconciling <-
//!
//! any phase -> Errored (malformed input, version mismatch, remote fault)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::ack::AckTracker;
use super::message::Message;
use super::peer::{PeerRegistry, PeerState};
use crate::codec::PatchCodec;
use crate::config::{CodecConfig, SyncConfig};
use crate::core::{
    AuthorId, FaultCode, Operation, PATCH_FLAG_FINAL, PATCH_FLAG_STATE, SyncError, SyncReplica,
    VersionVector,
};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We dialed and send HELLO.
    Outbound,
    /// We accepted and answer with VECTOR.
    Inbound,
}

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No transport.
    Disconnected,
    /// Waiting for the peer's HELLO or VECTOR.
    Handshaking,
    /// Exchanging catch-up batches.
    Syncing,
    /// Merging remote ops concurrent with our unacknowledged ones.
    Reconciling,
    /// Both catch-ups done and our ops acknowledged; pushing live.
    Synced,
    /// Torn down after a fault; must be re-established, not repaired.
    Errored,
}

impl SessionPhase {
    /// Whether batches and acks flow in this phase.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            SessionPhase::Syncing | SessionPhase::Reconciling | SessionPhase::Synced
        )
    }
}

/// Something the caller must do on the session's behalf.
#[derive(Debug)]
pub enum SessionAction {
    /// Send a message to the peer.
    Send(Message),
    /// Close the transport.
    Close(SyncError),
}

/// One sync session with one remote peer.
pub struct SyncSession<R: SyncReplica + ?Sized> {
    replica: Arc<R>,
    registry: Arc<PeerRegistry>,
    config: SyncConfig,
    codec: PatchCodec,
    role: SessionRole,
    phase: SessionPhase,

    /// Author we dialed (outbound) or learned from HELLO (inbound)
    peer_id: Option<AuthorId>,
    peer: Option<PeerState>,

    /// Vector we announced; incoming contexts are delta-encoded against it
    announced: VersionVector,
    /// Vector the peer announced; outgoing contexts are encoded against it
    peer_announced: VersionVector,
    /// Ops sent on this connection; unlike the cursor this is never
    /// carried to the next session
    sent: VersionVector,

    acks: AckTracker,
    backlog: VecDeque<Operation>,
    catch_up_remaining: usize,
    state_based: bool,
    final_sent: bool,
    final_received: bool,
    next_seq: u64,
    expected_seq: u64,

    started_at: Instant,
    last_recv: Instant,
    last_sent: Instant,
    reconciliations: u64,
}

impl<R: SyncReplica + ?Sized> SyncSession<R> {
    /// Session that will dial `peer`.
    pub fn outbound(
        replica: Arc<R>,
        registry: Arc<PeerRegistry>,
        peer: AuthorId,
        config: SyncConfig,
        codec: &CodecConfig,
    ) -> Self {
        Self::new(replica, registry, SessionRole::Outbound, Some(peer), config, codec)
    }

    /// Session for an accepted connection; the peer identifies itself.
    pub fn inbound(
        replica: Arc<R>,
        registry: Arc<PeerRegistry>,
        config: SyncConfig,
        codec: &CodecConfig,
    ) -> Self {
        Self::new(replica, registry, SessionRole::Inbound, None, config, codec)
    }

    fn new(
        replica: Arc<R>,
        registry: Arc<PeerRegistry>,
        role: SessionRole,
        peer_id: Option<AuthorId>,
        config: SyncConfig,
        codec: &CodecConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            replica,
            registry,
            config,
            codec: PatchCodec::new(codec),
            role,
            phase: SessionPhase::Disconnected,
            peer_id,
            peer: None,
            announced: VersionVector::new(),
            peer_announced: VersionVector::new(),
            sent: VersionVector::new(),
            acks: AckTracker::new(),
            backlog: VecDeque::new(),
            catch_up_remaining: 0,
            state_based: false,
            final_sent: false,
            final_received: false,
            next_seq: 0,
            expected_seq: 0,
            started_at: now,
            last_recv: now,
            last_sent: now,
            reconciliations: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Session role.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Remote author, once known.
    pub fn peer(&self) -> Option<AuthorId> {
        self.peer_id
    }

    /// Live peer state, once established.
    pub fn peer_state(&self) -> Option<&PeerState> {
        self.peer.as_ref()
    }

    /// Ops sent and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.acks.pending_count()
    }

    /// Ops waiting for the in-flight window to open.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Times the session entered `Reconciling`.
    pub fn reconciliations(&self) -> u64 {
        self.reconciliations
    }

    /// Start the session on a fresh transport.
    ///
    /// Outbound sessions send HELLO; a fenced peer is refused.
    pub fn connect(&mut self, now: Instant) -> Result<Vec<SessionAction>, SyncError> {
        if self.phase != SessionPhase::Disconnected {
            return Err(SyncError::InvalidState(format!(
                "connect in phase {:?}",
                self.phase
            )));
        }
        self.started_at = now;
        self.last_recv = now;
        self.last_sent = now;
        self.reset_stream();
        self.set_phase(SessionPhase::Handshaking);

        match (self.role, self.peer_id) {
            (SessionRole::Outbound, Some(peer)) => {
                if let Err(err) = self.registry.ensure_not_fenced(peer) {
                    self.set_phase(SessionPhase::Errored);
                    return Err(err.into());
                }
                self.peer = Some(self.registry.checkout(peer));
                self.announced = self.replica.version_vector();
                Ok(vec![SessionAction::Send(Message::Hello {
                    author: self.replica.author(),
                    vector: self.announced.clone(),
                })])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Handle one received frame.
    pub fn handle_frame(&mut self, frame: &[u8], now: Instant) -> Vec<SessionAction> {
        if !self.is_live() {
            return Vec::new();
        }
        self.last_recv = now;
        match Message::decode(frame) {
            Ok(msg) => self.handle_message(msg, now),
            Err(err) => {
                let err = SyncError::from(err);
                let code = match err {
                    SyncError::VersionMismatch { .. } => FaultCode::VersionMismatch,
                    _ => FaultCode::MalformedPatch,
                };
                self.fail(err, code)
            }
        }
    }

    /// Handle one decoded message.
    pub fn handle_message(&mut self, msg: Message, now: Instant) -> Vec<SessionAction> {
        if !self.is_live() {
            return Vec::new();
        }
        self.last_recv = now;
        debug!(peer = ?self.peer_id, msg = msg.name(), phase = ?self.phase, "sync message");

        match (self.phase, self.role, msg) {
            (_, _, Message::Error { code, detail }) => {
                warn!(peer = ?self.peer_id, %code, %detail, "peer reported fault");
                self.set_phase(SessionPhase::Errored);
                vec![SessionAction::Close(SyncError::Remote { code, detail })]
            }
            (
                SessionPhase::Handshaking,
                SessionRole::Inbound,
                Message::Hello { author, vector },
            ) => self.on_hello(author, vector, now),
            (SessionPhase::Handshaking, SessionRole::Outbound, Message::Vector(vector)) => {
                self.peer_announced = vector;
                self.begin_catch_up(now)
            }
            (phase, _, Message::PatchBatch { seq, flags, patch }) if phase.is_established() => {
                self.on_batch(seq, flags, &patch, now)
            }
            (phase, _, Message::Ack(vector)) if phase.is_established() => self.on_ack(&vector, now),
            (phase, _, msg) => self.fail(
                SyncError::InvalidState(format!("unexpected {} in phase {phase:?}", msg.name())),
                FaultCode::UnexpectedMessage,
            ),
        }
    }

    /// Queue newly applied ops for the peer.
    ///
    /// Before the handshake completes this is a no-op: the catch-up stream
    /// will carry them. Once the in-flight window is full, the ops are kept
    /// queued and `BackpressureExceeded` is returned; they go out as
    /// acknowledgments arrive.
    pub fn push_local(
        &mut self,
        ops: impl IntoIterator<Item = Operation>,
        now: Instant,
    ) -> Result<Vec<SessionAction>, SyncError> {
        match self.phase {
            SessionPhase::Disconnected | SessionPhase::Handshaking => return Ok(Vec::new()),
            SessionPhase::Errored => {
                return Err(SyncError::InvalidState("push on errored session".into()));
            }
            _ => {}
        }
        let paused = self.window() == 0;
        self.enqueue(ops);
        if paused {
            let peer = self.peer_id.unwrap_or_default();
            warn!(
                peer = %peer,
                outstanding = self.acks.pending_count(),
                queued = self.backlog.len(),
                "sync pushes paused"
            );
            return Err(SyncError::BackpressureExceeded {
                peer,
                outstanding: self.acks.pending_count(),
                limit: self.config.max_outstanding,
            });
        }
        Ok(self.flush(now))
    }

    /// Re-read everything the peer may lack from the replica and queue it.
    ///
    /// Used when the caller lost track of which local ops were pushed.
    pub fn resync(&mut self, now: Instant) -> Result<Vec<SessionAction>, SyncError> {
        if !self.phase.is_established() {
            return Ok(Vec::new());
        }
        let known = self.known_by_peer();
        let catch_up = self.replica.ops_missing(&known)?;
        self.enqueue(catch_up.ops);
        Ok(self.flush(now))
    }

    /// Drive timers: handshake and idle timeouts, keepalive ACKs.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Handshaking
                if now.saturating_duration_since(self.started_at)
                    >= self.config.handshake_timeout =>
            {
                self.timeout("handshake")
            }
            phase if phase.is_established() => {
                if now.saturating_duration_since(self.last_recv) >= self.config.idle_timeout {
                    return self.timeout("idle");
                }
                if now.saturating_duration_since(self.last_sent) >= self.config.idle_timeout / 3 {
                    self.last_sent = now;
                    return vec![SessionAction::Send(Message::Ack(self.replica.version_vector()))];
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Tear the session down and hand peer state back to the registry.
    pub fn disconnect(&mut self) {
        if self.phase != SessionPhase::Errored {
            self.set_phase(SessionPhase::Disconnected);
        }
        self.checkin();
    }

    fn is_live(&self) -> bool {
        !matches!(self.phase, SessionPhase::Disconnected | SessionPhase::Errored)
    }

    fn on_hello(
        &mut self,
        author: AuthorId,
        vector: VersionVector,
        now: Instant,
    ) -> Vec<SessionAction> {
        if author == self.replica.author() {
            return self.fail(
                SyncError::InvalidState(format!("peer claims our author id {author}")),
                FaultCode::UnexpectedMessage,
            );
        }
        self.peer_id = Some(author);
        if let Err(err) = self.registry.ensure_not_fenced(author) {
            self.set_phase(SessionPhase::Errored);
            return vec![
                SessionAction::Send(Message::Error {
                    code: FaultCode::Fenced,
                    detail: err.to_string(),
                }),
                SessionAction::Close(err.into()),
            ];
        }
        self.peer = Some(self.registry.checkout(author));
        self.peer_announced = vector;
        self.announced = self.replica.version_vector();

        let mut actions = vec![SessionAction::Send(Message::Vector(self.announced.clone()))];
        actions.extend(self.begin_catch_up(now));
        actions
    }

    fn begin_catch_up(&mut self, now: Instant) -> Vec<SessionAction> {
        let announced = self.peer_announced.clone();
        if let Some(peer) = self.peer.as_mut() {
            peer.cursor.merge(&announced);
            peer.acked.merge(&announced);
        }
        let catch_up = match self.replica.ops_missing(&announced) {
            Ok(catch_up) => catch_up,
            Err(err) => return self.abort(err),
        };
        info!(
            peer = ?self.peer_id,
            role = ?self.role,
            sending = catch_up.ops.len(),
            state_based = catch_up.state_based,
            "sync handshake complete"
        );
        self.set_phase(SessionPhase::Syncing);
        self.backlog.clear();
        self.state_based = catch_up.state_based;
        self.catch_up_remaining = catch_up.ops.len();
        self.backlog.extend(catch_up.ops);
        let actions = self.flush(now);
        self.advance();
        actions
    }

    fn on_batch(&mut self, seq: u64, flags: u8, patch: &[u8], now: Instant) -> Vec<SessionAction> {
        if seq != self.expected_seq {
            return self.fail(
                SyncError::InvalidState(format!(
                    "batch {seq} out of sequence (expected {})",
                    self.expected_seq
                )),
                FaultCode::UnexpectedMessage,
            );
        }
        self.expected_seq += 1;

        let ops = match self.codec.decode_delta(patch, &self.announced) {
            Ok(ops) => ops,
            Err(err) => return self.fail(err.into(), FaultCode::MalformedPatch),
        };

        let concurrent = self.acks.has_pending()
            && ops.iter().any(|op| {
                self.acks
                    .pending_ids()
                    .any(|local| !op.causal_context.contains(local))
            });
        if let Some(peer) = self.peer.as_mut() {
            for op in &ops {
                peer.cursor.observe(op.id);
            }
        }

        let received = ops.len();
        let outcome = match self.replica.apply_remote(ops) {
            Ok(outcome) => outcome,
            Err(err) => return self.abort(err),
        };
        debug!(
            peer = ?self.peer_id,
            seq,
            received,
            applied = outcome.applied,
            duplicates = outcome.duplicates,
            pending = outcome.pending,
            "applied remote batch"
        );
        if outcome.rejected > 0 {
            return self.fail(
                SyncError::InvalidState(format!(
                    "{} ops overflowed the causal buffer",
                    outcome.rejected
                )),
                FaultCode::UnexpectedMessage,
            );
        }

        if concurrent && self.phase != SessionPhase::Reconciling {
            self.reconciliations += 1;
            self.set_phase(SessionPhase::Reconciling);
        }

        if flags & PATCH_FLAG_FINAL != 0 && !self.final_received {
            self.final_received = true;
            if flags & PATCH_FLAG_STATE != 0 {
                if let Err(err) = self.replica.adopt_remote_state(&self.peer_announced) {
                    return self.abort(err);
                }
            }
            debug!(peer = ?self.peer_id, "remote catch-up complete");
        }

        self.last_sent = now;
        let actions = vec![SessionAction::Send(Message::Ack(self.replica.version_vector()))];
        self.advance();
        actions
    }

    fn on_ack(&mut self, acked: &VersionVector, now: Instant) -> Vec<SessionAction> {
        let (cleared, sample) = self.acks.process_ack(acked, now);
        if let Some(peer) = self.peer.as_mut() {
            peer.acked.merge(acked);
            peer.cursor.merge(acked);
            self.replica.peer_acknowledged(peer.peer, &peer.acked);
        }
        if cleared > 0 {
            debug!(peer = ?self.peer_id, cleared, latency = ?sample, "ops acknowledged");
        }
        let actions = self.flush(now);
        self.advance();
        actions
    }

    /// Everything the peer has or is about to receive on this connection.
    fn known_by_peer(&self) -> VersionVector {
        let mut known = self.peer_announced.clone();
        known.merge(&self.sent);
        if let Some(peer) = &self.peer {
            known.merge(&peer.cursor);
        }
        known
    }

    /// Forget per-connection stream state.
    fn reset_stream(&mut self) {
        self.sent = VersionVector::new();
        self.backlog.clear();
        self.catch_up_remaining = 0;
        self.state_based = false;
        self.final_sent = false;
        self.final_received = false;
        self.next_seq = 0;
        self.expected_seq = 0;
    }

    fn window(&self) -> usize {
        self.config
            .max_outstanding
            .saturating_sub(self.acks.pending_count())
    }

    fn enqueue(&mut self, ops: impl IntoIterator<Item = Operation>) {
        let known = self.known_by_peer();
        let queued: Vec<_> = self.backlog.iter().map(|op| op.id).collect();
        self.backlog.extend(
            ops.into_iter()
                .filter(|op| !known.contains(op.id) && !queued.contains(&op.id)),
        );
    }

    /// Send queued ops while the in-flight window allows.
    fn flush(&mut self, now: Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        loop {
            let room = self.window().min(self.config.max_batch_ops.max(1));
            let mut batch = Vec::new();
            let known = self.known_by_peer();
            while batch.len() < room {
                let Some(op) = self.backlog.pop_front() else {
                    break;
                };
                self.catch_up_remaining = self.catch_up_remaining.saturating_sub(1);
                if !known.contains(op.id) {
                    batch.push(op);
                }
            }
            let send_final = !self.final_sent && self.catch_up_remaining == 0;
            if batch.is_empty() && !send_final {
                break;
            }

            let flags = match (send_final, self.state_based) {
                (true, true) => PATCH_FLAG_FINAL | PATCH_FLAG_STATE,
                (true, false) => PATCH_FLAG_FINAL,
                (false, _) => 0,
            };
            let patch = self.codec.encode_delta(&batch, &self.peer_announced);
            self.acks.register_sent(batch.iter().map(|op| op.id), now);
            for op in &batch {
                self.sent.observe(op.id);
            }
            debug!(
                peer = ?self.peer_id,
                seq = self.next_seq,
                ops = batch.len(),
                bytes = patch.len(),
                final_batch = send_final,
                "sending batch"
            );
            actions.push(SessionAction::Send(Message::PatchBatch {
                seq: self.next_seq,
                flags,
                patch,
            }));
            self.next_seq += 1;
            self.last_sent = now;
            self.final_sent |= send_final;
        }
        actions
    }

    /// Move between Syncing, Reconciling and Synced.
    fn advance(&mut self) {
        let caught_up = self.final_sent
            && self.final_received
            && !self.acks.has_pending()
            && self.backlog.is_empty();
        match self.phase {
            SessionPhase::Reconciling if !self.acks.has_pending() => {
                self.set_phase(if caught_up {
                    SessionPhase::Synced
                } else {
                    SessionPhase::Syncing
                });
            }
            SessionPhase::Syncing if caught_up => self.set_phase(SessionPhase::Synced),
            _ => {}
        }
    }

    /// Protocol fault: report it, count it against the peer, and tear down.
    fn fail(&mut self, err: SyncError, code: FaultCode) -> Vec<SessionAction> {
        warn!(peer = ?self.peer_id, %code, error = %err, "sync session fault");
        self.set_phase(SessionPhase::Errored);
        let mut close = err;
        if code != FaultCode::VersionMismatch {
            if let Some(peer) = self.peer_id {
                if let Err(fenced) = self.registry.record_fault(peer) {
                    close = SyncError::PeerFault(fenced);
                }
            }
        }
        vec![
            SessionAction::Send(Message::Error {
                code,
                detail: close.to_string(),
            }),
            SessionAction::Close(close),
        ]
    }

    /// Local failure: tear down without blaming the peer.
    fn abort(&mut self, err: SyncError) -> Vec<SessionAction> {
        warn!(peer = ?self.peer_id, error = %err, "sync session aborted");
        self.set_phase(SessionPhase::Disconnected);
        vec![SessionAction::Close(err)]
    }

    fn timeout(&mut self, what: &'static str) -> Vec<SessionAction> {
        info!(peer = ?self.peer_id, what, "sync session timed out");
        self.set_phase(SessionPhase::Disconnected);
        vec![SessionAction::Close(SyncError::Timeout(what))]
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            info!(
                peer = ?self.peer_id,
                from = ?self.phase,
                to = ?phase,
                ack_latency = ?self.acks.srtt(),
                "sync phase"
            );
            self.phase = phase;
        }
    }

    fn checkin(&mut self) {
        if let Some(mut peer) = self.peer.take() {
            peer.outstanding = self.acks.pending_count();
            self.registry.checkin(peer);
        }
        self.acks.cancel_all();
    }
}

impl<R: SyncReplica + ?Sized> Drop for SyncSession<R> {
    fn drop(&mut self) {
        self.checkin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CatchUp, MetadataValue, OpId, OpKind, RemoteApply, SamplePoint, StrokeData};
    use crate::store::DocumentStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// In-memory replica: a store plus the ops it applied, in order.
    struct MemReplica {
        author: AuthorId,
        store: DocumentStore,
        log: Mutex<Vec<Operation>>,
        acked: Mutex<Vec<(AuthorId, VersionVector)>>,
        /// Serve catch-up from document state instead of the log
        compacted: AtomicBool,
    }

    impl MemReplica {
        fn new(author: u64) -> Arc<Self> {
            Self::with_store(author, DocumentStore::new())
        }

        fn with_store(author: u64, store: DocumentStore) -> Arc<Self> {
            Arc::new(Self {
                author: AuthorId(author),
                store,
                log: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                compacted: AtomicBool::new(false),
            })
        }

        fn capture(&self, kind: OpKind) -> Operation {
            let context = self.store.version_vector();
            let id = OpId::new(self.author, context.max_counter() + 1);
            let op = Operation::new(id, context, kind);
            self.store.apply(op.clone());
            self.log.lock().push(op.clone());
            op
        }

        fn stroke(&self) -> Operation {
            self.capture(OpKind::InsertStroke(StrokeData::new(
                vec![SamplePoint::new(1.0, 1.0, 0, 0.5)],
                1,
            )))
        }
    }

    impl SyncReplica for MemReplica {
        fn author(&self) -> AuthorId {
            self.author
        }

        fn version_vector(&self) -> VersionVector {
            self.store.version_vector()
        }

        fn ops_missing(&self, remote: &VersionVector) -> Result<CatchUp, SyncError> {
            if self.compacted.load(Ordering::Relaxed) {
                let view = self.store.snapshot_view();
                let ops = view.synthesize_operations();
                return Ok(CatchUp::from_state(
                    ops.into_iter().filter(|op| !remote.contains(op.id)).collect(),
                ));
            }
            Ok(CatchUp::from_log(
                self.log
                    .lock()
                    .iter()
                    .filter(|op| !remote.contains(op.id))
                    .cloned()
                    .collect(),
            ))
        }

        fn apply_remote(&self, ops: Vec<Operation>) -> Result<RemoteApply, SyncError> {
            let outcome = self.store.apply_batch(ops);
            let applied = outcome.applied.len();
            self.log.lock().extend(outcome.applied);
            Ok(RemoteApply {
                applied,
                duplicates: outcome.duplicates,
                pending: outcome.pending,
                rejected: outcome.rejected,
            })
        }

        fn adopt_remote_state(&self, remote: &VersionVector) -> Result<(), SyncError> {
            let released = self.store.adopt_observed(remote);
            self.log.lock().extend(released);
            Ok(())
        }

        fn peer_acknowledged(&self, peer: AuthorId, acked: &VersionVector) {
            self.acked.lock().push((peer, acked.clone()));
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            ..SyncConfig::default()
        }
    }

    fn pair(
        a: &Arc<MemReplica>,
        b: &Arc<MemReplica>,
        config: SyncConfig,
    ) -> (
        SyncSession<MemReplica>,
        SyncSession<MemReplica>,
        Arc<PeerRegistry>,
        Arc<PeerRegistry>,
    ) {
        let reg_a = Arc::new(PeerRegistry::new(config.peer_retention, config.max_peer_faults));
        let reg_b = Arc::new(PeerRegistry::new(config.peer_retention, config.max_peer_faults));
        let (dialer, acceptor) = sessions(a, b, &reg_a, &reg_b, config);
        (dialer, acceptor, reg_a, reg_b)
    }

    /// Fresh sessions over existing registries.
    fn sessions(
        a: &Arc<MemReplica>,
        b: &Arc<MemReplica>,
        reg_a: &Arc<PeerRegistry>,
        reg_b: &Arc<PeerRegistry>,
        config: SyncConfig,
    ) -> (SyncSession<MemReplica>, SyncSession<MemReplica>) {
        let codec = CodecConfig::default();
        let dialer = SyncSession::outbound(
            Arc::clone(a),
            Arc::clone(reg_a),
            b.author,
            config.clone(),
            &codec,
        );
        let acceptor = SyncSession::inbound(Arc::clone(b), Arc::clone(reg_b), config, &codec);
        (dialer, acceptor)
    }

    /// Deliver actions back and forth until both sides go quiet.
    fn pump(
        a: &mut SyncSession<MemReplica>,
        b: &mut SyncSession<MemReplica>,
        mut to_b: Vec<SessionAction>,
        now: Instant,
    ) -> Vec<SyncError> {
        let mut closed = Vec::new();
        let mut to_a = Vec::new();
        for _ in 0..1000 {
            if to_a.is_empty() && to_b.is_empty() {
                break;
            }
            for action in std::mem::take(&mut to_b) {
                match action {
                    SessionAction::Send(msg) => to_a.extend(b.handle_frame(&msg.encode(), now)),
                    SessionAction::Close(err) => closed.push(err),
                }
            }
            for action in std::mem::take(&mut to_a) {
                match action {
                    SessionAction::Send(msg) => to_b.extend(a.handle_frame(&msg.encode(), now)),
                    SessionAction::Close(err) => closed.push(err),
                }
            }
        }
        closed
    }

    fn connect(
        a: &mut SyncSession<MemReplica>,
        b: &mut SyncSession<MemReplica>,
        now: Instant,
    ) -> Vec<SyncError> {
        b.connect(now).unwrap();
        let hello = a.connect(now).unwrap();
        pump(a, b, hello, now)
    }

    #[test]
    fn test_handshake_exchanges_missing_ops() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        a.stroke();
        a.stroke();
        b.stroke();

        let (mut sa, mut sb, _, _) = pair(&a, &b, config());
        let now = Instant::now();
        assert!(connect(&mut sa, &mut sb, now).is_empty());

        assert_eq!(sa.phase(), SessionPhase::Synced);
        assert_eq!(sb.phase(), SessionPhase::Synced);
        assert_eq!(sb.peer(), Some(AuthorId(1)));
        assert_eq!(a.store.snapshot_view(), b.store.snapshot_view());
        assert_eq!(a.store.snapshot_view().visible_count(), 3);
        assert!(!a.acked.lock().is_empty());
    }

    #[test]
    fn test_synced_push_goes_out_immediately() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let (mut sa, mut sb, _, _) = pair(&a, &b, config());
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);
        assert_eq!(sa.phase(), SessionPhase::Synced);

        let op = a.stroke();
        let actions = sa.push_local([op.clone()], now).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(sa.outstanding(), 1);
        pump(&mut sa, &mut sb, actions, now);

        assert!(b.store.has_observed(op.id));
        assert_eq!(sa.outstanding(), 0);
        assert_eq!(sa.phase(), SessionPhase::Synced);

        // Already acknowledged: not pushed again
        assert!(sa.push_local([op], now).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_stroke_and_delete_converge() {
        let a = MemReplica::new(0xA);
        let b = MemReplica::new(0xB);
        let s2 = b.stroke();
        let (mut sa, mut sb, _, _) = pair(&a, &b, config());
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);

        // A inserts S1 while B concurrently deletes S2
        let s1 = a.stroke();
        let del = b.capture(OpKind::DeleteStroke { target: s2.id });
        let to_b = sa.push_local([s1.clone()], now).unwrap();
        let to_a = sb.push_local([del], now).unwrap();
        for action in to_a {
            if let SessionAction::Send(msg) = action {
                let replies = sa.handle_frame(&msg.encode(), now);
                assert_eq!(sa.phase(), SessionPhase::Reconciling);
                pump(&mut sa, &mut sb, replies, now);
            }
        }
        pump(&mut sa, &mut sb, to_b, now);

        for replica in [&a, &b] {
            let view = replica.store.snapshot_view();
            assert!(view.stroke(s1.id).unwrap().is_visible());
            assert!(view.stroke(s2.id).unwrap().tombstone);
        }
        assert_eq!(a.store.snapshot_view(), b.store.snapshot_view());
        assert_eq!(sa.reconciliations(), 1);
        assert_eq!(sa.phase(), SessionPhase::Synced);
    }

    #[test]
    fn test_backpressure_pauses_and_resumes_without_gaps() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let cfg = SyncConfig {
            max_outstanding: 2,
            ..config()
        };
        let (mut sa, mut sb, _, _) = pair(&a, &b, cfg);
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);

        let ops: Vec<Operation> = (0..5).map(|_| a.stroke()).collect();
        let first = sa.push_local(ops[..3].to_vec(), now).unwrap();
        assert_eq!(sa.outstanding(), 2);
        assert_eq!(sa.backlog_len(), 1);

        let err = sa.push_local(ops[3..].to_vec(), now).unwrap_err();
        assert!(matches!(err, SyncError::BackpressureExceeded { outstanding: 2, limit: 2, .. }));
        assert_eq!(sa.backlog_len(), 3);

        // Acks drain the backlog in order
        pump(&mut sa, &mut sb, first, now);
        assert_eq!(sa.backlog_len(), 0);
        assert_eq!(sa.outstanding(), 0);
        for op in &ops {
            assert!(b.store.has_observed(op.id));
        }
        assert_eq!(b.store.pending_count(), 0);
    }

    #[test]
    fn test_malformed_patch_errors_and_fences() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let cfg = SyncConfig {
            max_peer_faults: 2,
            ..config()
        };
        let registry = Arc::new(PeerRegistry::new(cfg.peer_retention, cfg.max_peer_faults));
        let codec = CodecConfig::default();
        let now = Instant::now();

        // Batch 0 was the empty catch-up; garbage arrives as batch 1
        let garbage = Message::PatchBatch {
            seq: 1,
            flags: 0,
            patch: vec![0xDE, 0xAD],
        };
        for attempt in 1..=2 {
            let reg_a = Arc::new(PeerRegistry::new(cfg.peer_retention, cfg.max_peer_faults));
            let (mut sa, mut sb) = sessions(&a, &b, &reg_a, &registry, cfg.clone());
            connect(&mut sa, &mut sb, now);

            let actions = sb.handle_frame(&garbage.encode(), now);
            assert_eq!(sb.phase(), SessionPhase::Errored);
            assert!(matches!(
                &actions[0],
                SessionAction::Send(Message::Error { code: FaultCode::MalformedPatch, .. })
            ));
            match (&actions[1], attempt) {
                (SessionAction::Close(SyncError::MalformedPatch(_)), 1) => {}
                (SessionAction::Close(SyncError::PeerFault(fault)), 2) => {
                    assert_eq!(fault.peer, AuthorId(1));
                }
                (other, _) => panic!("unexpected {other:?}"),
            }
            // Errored sessions ignore further input
            assert!(sb.handle_frame(&garbage.encode(), now).is_empty());
        }

        // Fenced: HELLO is refused
        let mut sb =
            SyncSession::inbound(Arc::clone(&b), Arc::clone(&registry), cfg.clone(), &codec);
        sb.connect(now).unwrap();
        let hello = Message::Hello {
            author: AuthorId(1),
            vector: VersionVector::new(),
        };
        let actions = sb.handle_message(hello, now);
        assert!(matches!(&actions[1], SessionAction::Close(SyncError::PeerFault(_))));

        // And an outbound session to the fenced peer refuses to connect
        let mut out = SyncSession::outbound(
            Arc::clone(&b),
            Arc::clone(&registry),
            AuthorId(1),
            cfg,
            &codec,
        );
        assert!(matches!(out.connect(now), Err(SyncError::PeerFault(_))));
    }

    #[test]
    fn test_version_mismatch_is_not_a_fault() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let (mut sa, mut sb, _, reg_b) = pair(&a, &b, config());
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);

        let mut frame = Message::Ack(VersionVector::new()).encode();
        frame[0] = 0x09;
        let actions = sb.handle_frame(&frame, now);
        assert_eq!(sb.phase(), SessionPhase::Errored);
        assert!(matches!(
            &actions[0],
            SessionAction::Send(Message::Error { code: FaultCode::VersionMismatch, .. })
        ));
        assert!(matches!(&actions[1], SessionAction::Close(SyncError::VersionMismatch { .. })));
        drop(sb);
        assert_eq!(reg_b.get(AuthorId(1)).unwrap().faults, 0);
    }

    #[test]
    fn test_unexpected_message_counts_as_fault() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let (mut sa, mut sb, _, reg_b) = pair(&a, &b, config());
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);

        let actions = sb.handle_message(Message::Vector(VersionVector::new()), now);
        assert!(matches!(
            &actions[0],
            SessionAction::Send(Message::Error { code: FaultCode::UnexpectedMessage, .. })
        ));
        assert_eq!(reg_b.get(AuthorId(1)).unwrap().faults, 1);
    }

    #[test]
    fn test_remote_error_closes() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let (mut sa, mut sb, _, _) = pair(&a, &b, config());
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);

        let actions = sa.handle_message(
            Message::Error {
                code: FaultCode::Fenced,
                detail: "no".into(),
            },
            now,
        );
        assert_eq!(sa.phase(), SessionPhase::Errored);
        assert!(matches!(
            &actions[0],
            SessionAction::Close(SyncError::Remote { code: FaultCode::Fenced, .. })
        ));
    }

    #[test]
    fn test_handshake_timeout() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let (mut sa, _sb, _, _) = pair(&a, &b, config());
        let now = Instant::now();
        sa.connect(now).unwrap();

        assert!(sa.poll(now + Duration::from_secs(1)).is_empty());
        let actions = sa.poll(now + Duration::from_secs(5));
        assert!(matches!(&actions[0], SessionAction::Close(SyncError::Timeout("handshake"))));
        assert_eq!(sa.phase(), SessionPhase::Disconnected);
    }

    #[test]
    fn test_idle_keepalive_then_timeout() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let (mut sa, mut sb, _, _) = pair(&a, &b, config());
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);

        let keepalive = sa.poll(now + Duration::from_secs(11));
        assert!(matches!(&keepalive[0], SessionAction::Send(Message::Ack(_))));
        assert!(sa.poll(now + Duration::from_secs(12)).is_empty());

        let actions = sa.poll(now + Duration::from_secs(30));
        assert!(matches!(&actions[0], SessionAction::Close(SyncError::Timeout("idle"))));
        assert_eq!(sa.phase(), SessionPhase::Disconnected);
    }

    #[test]
    fn test_reconnect_does_not_resend_acknowledged() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let cfg = config();
        let reg_a = Arc::new(PeerRegistry::new(cfg.peer_retention, cfg.max_peer_faults));
        let reg_b = Arc::new(PeerRegistry::new(cfg.peer_retention, cfg.max_peer_faults));
        let now = Instant::now();

        a.stroke();
        a.stroke();
        {
            let (mut sa, mut sb) = sessions(&a, &b, &reg_a, &reg_b, cfg.clone());
            connect(&mut sa, &mut sb, now);
            sa.disconnect();
        }
        assert_eq!(reg_a.get(b.author).unwrap().acked.get(a.author), 2);

        let fresh = a.stroke();
        let (mut sa, mut sb) = sessions(&a, &b, &reg_a, &reg_b, cfg);
        sb.connect(now).unwrap();
        let hello = sa.connect(now).unwrap();
        let replies = sb.handle_frame(
            &match &hello[0] {
                SessionAction::Send(msg) => msg.encode(),
                SessionAction::Close(err) => panic!("{err}"),
            },
            now,
        );
        let mut to_b = Vec::new();
        for action in replies {
            if let SessionAction::Send(msg) = action {
                to_b.extend(sa.handle_frame(&msg.encode(), now));
            }
        }
        // Only the op B lacks is streamed, in the FINAL batch
        let batches: Vec<&Message> = to_b
            .iter()
            .filter_map(|action| match action {
                SessionAction::Send(msg @ Message::PatchBatch { .. }) => Some(msg),
                _ => None,
            })
            .collect();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_final());
        assert_eq!(sa.outstanding(), 1);
        pump(&mut sa, &mut sb, to_b, now);
        assert!(b.store.has_observed(fresh.id));
        assert_eq!(a.store.snapshot_view(), b.store.snapshot_view());
    }

    #[test]
    fn test_metadata_tie_resolves_to_lower_author_on_both() {
        let a = MemReplica::new(0x20);
        let b = MemReplica::new(0x10);
        // Both set the title at Lamport time 1, concurrently
        a.capture(OpKind::UpdateMetadata {
            key: "title".into(),
            value: "Notes".into(),
        });
        b.capture(OpKind::UpdateMetadata {
            key: "title".into(),
            value: "My Notes".into(),
        });

        let (mut sa, mut sb, _, _) = pair(&a, &b, config());
        connect(&mut sa, &mut sb, Instant::now());
        for replica in [&a, &b] {
            assert_eq!(
                replica.store.snapshot_view().metadata("title"),
                Some(&MetadataValue::Text("My Notes".into()))
            );
        }
    }

    #[test]
    fn test_resume_after_dropped_batch_resends() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let cfg = config();
        let reg_a = Arc::new(PeerRegistry::new(cfg.peer_retention, cfg.max_peer_faults));
        let reg_b = Arc::new(PeerRegistry::new(cfg.peer_retention, cfg.max_peer_faults));
        let now = Instant::now();
        let op = a.stroke();

        // The transport dies with A's catch-up batch in flight
        {
            let (mut sa, mut sb) = sessions(&a, &b, &reg_a, &reg_b, cfg.clone());
            sb.connect(now).unwrap();
            let mut lost = Vec::new();
            for action in sa.connect(now).unwrap() {
                let SessionAction::Send(hello) = action else {
                    panic!("hello not sent");
                };
                for reply in sb.handle_frame(&hello.encode(), now) {
                    if let SessionAction::Send(msg) = reply {
                        lost.extend(sa.handle_frame(&msg.encode(), now));
                    }
                }
            }
            let final_flags: Vec<u8> = lost
                .iter()
                .filter_map(|action| match action {
                    SessionAction::Send(Message::PatchBatch { flags, .. }) => Some(*flags),
                    _ => None,
                })
                .collect();
            assert_eq!(final_flags, vec![PATCH_FLAG_FINAL]);
            sa.disconnect();
            sb.disconnect();
        }
        assert!(!b.store.has_observed(op.id));
        assert!(!reg_a.get(b.author).unwrap().cursor.contains(op.id));

        let (mut sa, mut sb) = sessions(&a, &b, &reg_a, &reg_b, cfg);
        assert!(connect(&mut sa, &mut sb, now).is_empty());
        assert!(b.store.snapshot_view().stroke(op.id).is_some());
        assert_eq!(a.store.snapshot_view(), b.store.snapshot_view());
        assert_eq!(sa.phase(), SessionPhase::Synced);
        assert_eq!(sb.phase(), SessionPhase::Synced);
    }

    #[test]
    fn test_state_based_catch_up_adopts_remote_vector() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        a.stroke();
        for value in ["draft", "final"] {
            a.capture(OpKind::UpdateMetadata {
                key: "title".into(),
                value: value.into(),
            });
        }
        a.compacted.store(true, Ordering::Relaxed);

        let (mut sa, mut sb, _, _) = pair(&a, &b, config());
        assert!(connect(&mut sa, &mut sb, Instant::now()).is_empty());

        // The superseded title write is covered without being streamed
        assert_eq!(b.store.version_vector(), a.store.version_vector());
        assert_eq!(a.store.snapshot_view(), b.store.snapshot_view());
        assert_eq!(b.store.pending_count(), 0);
        assert_eq!(sb.phase(), SessionPhase::Synced);
    }

    #[test]
    fn test_causal_buffer_overflow_is_a_fault() {
        let a = MemReplica::new(1);
        let b = MemReplica::with_store(2, DocumentStore::new().with_pending_limit(1));
        let (mut sa, mut sb, _, reg_b) = pair(&a, &b, config());
        let now = Instant::now();
        connect(&mut sa, &mut sb, now);

        // Both ops hang off an ancestor that never arrives
        let ops: Vec<Operation> = (2..=3)
            .map(|counter| {
                let context: VersionVector = [(AuthorId(9), counter - 1)].into_iter().collect();
                let kind = OpKind::InsertStroke(StrokeData::new(
                    vec![SamplePoint::new(2.0, 2.0, 0, 0.5)],
                    1,
                ));
                Operation::new(OpId::new(AuthorId(9), counter), context, kind)
            })
            .collect();
        let codec = PatchCodec::new(&CodecConfig::default());
        let patch = codec.encode_delta(&ops, &VersionVector::new());
        let actions = sb.handle_message(
            Message::PatchBatch {
                seq: 1,
                flags: 0,
                patch,
            },
            now,
        );

        assert_eq!(sb.phase(), SessionPhase::Errored);
        assert!(matches!(
            &actions[0],
            SessionAction::Send(Message::Error {
                code: FaultCode::UnexpectedMessage,
                ..
            })
        ));
        assert_eq!(b.store.pending_count(), 1);
        assert_eq!(reg_b.get(AuthorId(1)).unwrap().faults, 1);
    }

    #[test]
    fn test_idle_peer_state_expires_on_next_session() {
        let a = MemReplica::new(1);
        let b = MemReplica::new(2);
        let c = MemReplica::new(3);
        let cfg = SyncConfig {
            peer_retention: Duration::from_millis(20),
            ..config()
        };
        let (mut sa, mut sb, _, reg_b) = pair(&a, &b, cfg.clone());
        connect(&mut sa, &mut sb, Instant::now());
        sb.disconnect();
        assert!(reg_b.get(a.author).is_some());

        std::thread::sleep(Duration::from_millis(30));
        let reg_c = Arc::new(PeerRegistry::new(cfg.peer_retention, cfg.max_peer_faults));
        let (mut sc, mut sb) = sessions(&c, &b, &reg_c, &reg_b, cfg);
        connect(&mut sc, &mut sb, Instant::now());
        assert!(reg_b.get(a.author).is_none());
        assert!(reg_b.get(c.author).is_some());
    }
}
