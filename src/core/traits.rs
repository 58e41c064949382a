//! Seams between the sync layer and the local replica.

use super::clock::VersionVector;
use super::error::SyncError;
use super::ids::AuthorId;
use super::op::Operation;

/// Summary of applying a remote batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteApply {
    /// Ops newly applied (including ones released from the causal buffer).
    pub applied: usize,
    /// Ops already observed.
    pub duplicates: usize,
    /// Ops buffered awaiting causal dependencies.
    pub pending: usize,
    /// Ops refused because the causal buffer is full.
    pub rejected: usize,
}

/// What a peer lacks, as read from the local replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatchUp {
    /// Ops to stream, in causal order.
    pub ops: Vec<Operation>,
    /// The ops were synthesized from document state rather than read from
    /// the log. Superseded writes are missing from them, so the receiver
    /// must adopt the sender's vector once the stream is complete.
    pub state_based: bool,
}

impl CatchUp {
    /// Catch-up read from the operation log.
    pub fn from_log(ops: Vec<Operation>) -> Self {
        Self {
            ops,
            state_based: false,
        }
    }

    /// Catch-up synthesized from document state.
    pub fn from_state(ops: Vec<Operation>) -> Self {
        Self {
            ops,
            state_based: true,
        }
    }
}

/// The narrow contract a sync session has with the local replica.
///
/// Sessions never share mutable state with each other; everything they
/// learn or teach goes through this trait.
///
/// # Requirements
///
/// - `apply_remote` MUST be idempotent: re-applying observed ops is a no-op
/// - `ops_missing` MUST return every observed op not covered by `remote`,
///   in an order that respects causality, or a state-based equivalent
///   (flagged [`CatchUp::state_based`]) whose effect is completed by
///   `adopt_remote_state`
/// - `version_vector` MUST NOT cover an op before it is durably recorded;
///   coverage adopted without ops is recorded by the next snapshot
pub trait SyncReplica: Send + Sync {
    /// Local author id.
    fn author(&self) -> AuthorId;

    /// Summary of everything observed locally.
    fn version_vector(&self) -> VersionVector;

    /// Operations observed locally that `remote` has not seen.
    fn ops_missing(&self, remote: &VersionVector) -> Result<CatchUp, SyncError>;

    /// Apply (and durably record) operations received from a peer.
    fn apply_remote(&self, ops: Vec<Operation>) -> Result<RemoteApply, SyncError>;

    /// A peer finished a state-based catch-up stream, which covered
    /// everything in `remote` (the vector it announced).
    fn adopt_remote_state(&self, remote: &VersionVector) -> Result<(), SyncError>;

    /// A peer acknowledged everything in `acked`.
    fn peer_acknowledged(&self, peer: AuthorId, acked: &VersionVector) {
        let _ = (peer, acked);
    }
}
