//! Per-peer state that outlives individual sessions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::{AuthorId, PeerFaultError, VersionVector};

/// What we know about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Peer author id.
    pub peer: AuthorId,
    /// Everything the peer has acknowledged.
    pub acked: VersionVector,
    /// Everything the peer is known to have: announced, acknowledged, or
    /// received from it. Resumes pushing from here.
    pub cursor: VersionVector,
    /// Ops that were sent but not acknowledged when the last session ended.
    pub outstanding: usize,
    /// Protocol faults observed.
    pub faults: u32,
    /// Peer is fenced: no further sessions.
    pub fenced: bool,
    /// Last time a session with the peer was active.
    pub last_seen: Instant,
}

impl PeerState {
    /// Fresh state for a newly seen peer.
    pub fn new(peer: AuthorId) -> Self {
        Self {
            peer,
            acked: VersionVector::new(),
            cursor: VersionVector::new(),
            outstanding: 0,
            faults: 0,
            fenced: false,
            last_seen: Instant::now(),
        }
    }

    /// Fencing error for this peer.
    pub fn fault_error(&self) -> PeerFaultError {
        PeerFaultError {
            peer: self.peer,
            faults: self.faults,
        }
    }
}

/// Shared table of [`PeerState`], keyed by author.
///
/// Sessions check an entry out on establishment and back in on teardown.
/// Both sweep out entries idle past the retention window.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<AuthorId, PeerState>>,
    retention: Duration,
    max_faults: u32,
}

impl PeerRegistry {
    /// Create a registry.
    pub fn new(retention: Duration, max_faults: u32) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            retention,
            max_faults: max_faults.max(1),
        }
    }

    /// State for `peer`, creating it if unknown.
    pub fn checkout(&self, peer: AuthorId) -> PeerState {
        self.expire(Instant::now());
        let mut peers = self.peers.lock();
        let state = peers.entry(peer).or_insert_with(|| PeerState::new(peer));
        state.last_seen = Instant::now();
        state.clone()
    }

    /// Store the state a session ended with.
    pub fn checkin(&self, mut state: PeerState) {
        state.last_seen = Instant::now();
        self.expire(state.last_seen);
        let mut peers = self.peers.lock();
        // Faults recorded while the session ran win over the session's copy
        if let Some(existing) = peers.get(&state.peer) {
            state.faults = state.faults.max(existing.faults);
            state.fenced |= existing.fenced;
        }
        peers.insert(state.peer, state);
    }

    /// Snapshot of a peer's state.
    pub fn get(&self, peer: AuthorId) -> Option<PeerState> {
        self.peers.lock().get(&peer).cloned()
    }

    /// Whether `peer` has been fenced.
    pub fn is_fenced(&self, peer: AuthorId) -> bool {
        self.peers.lock().get(&peer).is_some_and(|p| p.fenced)
    }

    /// Refuse a fenced peer.
    pub fn ensure_not_fenced(&self, peer: AuthorId) -> Result<(), PeerFaultError> {
        match self.peers.lock().get(&peer) {
            Some(state) if state.fenced => Err(state.fault_error()),
            _ => Ok(()),
        }
    }

    /// Count a protocol fault. Returns the error once the peer is fenced.
    pub fn record_fault(&self, peer: AuthorId) -> Result<u32, PeerFaultError> {
        let mut peers = self.peers.lock();
        let state = peers.entry(peer).or_insert_with(|| PeerState::new(peer));
        state.faults += 1;
        if state.faults >= self.max_faults {
            if !state.fenced {
                warn!(peer = %peer, faults = state.faults, "peer fenced");
            }
            state.fenced = true;
            return Err(state.fault_error());
        }
        Ok(state.faults)
    }

    /// Lift a fence and clear the fault count.
    pub fn unfence(&self, peer: AuthorId) {
        if let Some(state) = self.peers.lock().get_mut(&peer) {
            state.faults = 0;
            state.fenced = false;
        }
    }

    /// Drop peers idle longer than the retention window. Fenced peers are
    /// kept so the fence holds. Returns the expired authors.
    pub fn expire(&self, now: Instant) -> Vec<AuthorId> {
        let mut expired = Vec::new();
        self.peers.lock().retain(|&peer, state| {
            let idle = now.saturating_duration_since(state.last_seen);
            let keep = state.fenced || idle < self.retention;
            if !keep {
                expired.push(peer);
            }
            keep
        });
        for peer in &expired {
            debug!(peer = %peer, "peer state expired");
        }
        expired
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
