//! Acknowledgment tracking
//!
//! Tracks local ops sent to a peer and not yet acknowledged, and estimates
//! ack latency from the samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::core::{OpId, VersionVector};

/// An op awaiting acknowledgment.
#[derive(Debug, Clone, Copy)]
pub struct PendingAck {
    /// Op sent.
    pub id: OpId,
    /// Time when the batch carrying it was sent.
    pub sent_at: Instant,
}

/// Ops in flight to one peer, in send order.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: VecDeque<PendingAck>,

    /// Highest acknowledged vector
    acked: VersionVector,

    /// Smoothed ack latency and its variance (RFC 6298)
    srtt: Option<Duration>,
    rttvar: Option<Duration>,
}

impl AckTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register ops sent in one batch.
    pub fn register_sent(&mut self, ids: impl IntoIterator<Item = OpId>, now: Instant) {
        for id in ids {
            if self.acked.contains(id) {
                continue;
            }
            self.pending.push_back(PendingAck { id, sent_at: now });
        }
    }

    /// Process an incoming ACK.
    ///
    /// Returns how many pending ops it covered and an ack latency sample
    /// taken from the oldest of them.
    pub fn process_ack(
        &mut self,
        acked: &VersionVector,
        now: Instant,
    ) -> (usize, Option<Duration>) {
        self.acked.merge(acked);
        let before = self.pending.len();
        let mut sample = None;
        let covered = &self.acked;
        self.pending.retain(|p| {
            if covered.contains(p.id) {
                sample.get_or_insert_with(|| now.saturating_duration_since(p.sent_at));
                false
            } else {
                true
            }
        });
        if let Some(rtt) = sample {
            self.update_rtt(rtt);
        }
        (before - self.pending.len(), sample)
    }

    /// Update latency estimates using RFC 6298 smoothing
    fn update_rtt(&mut self, rtt: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let srtt_secs = srtt.as_secs_f64();
                let rtt_secs = rtt.as_secs_f64();
                // RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R'|
                let new_rttvar = 0.75 * rttvar.as_secs_f64() + 0.25 * (srtt_secs - rtt_secs).abs();
                // SRTT = 7/8 SRTT + 1/8 R'
                let new_srtt = 0.875 * srtt_secs + 0.125 * rtt_secs;
                self.srtt = Some(Duration::from_secs_f64(new_srtt));
                self.rttvar = Some(Duration::from_secs_f64(new_rttvar));
            }
            _ => {
                self.srtt = Some(rtt);
                self.rttvar = Some(rtt / 2);
            }
        }
    }

    /// Smoothed ack latency, if sampled.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Ops awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether anything is awaiting acknowledgment.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Ids awaiting acknowledgment, oldest first.
    pub fn pending_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        self.pending.iter().map(|p| p.id)
    }

    /// Everything acknowledged so far.
    pub fn acked(&self) -> &VersionVector {
        &self.acked
    }

    /// Forget pending ops (session ended).
    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }
}
