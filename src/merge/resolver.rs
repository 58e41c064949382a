//! Deterministic conflict resolution.
//!
//! Pure functions, no I/O. Every merge here is a join: commutative,
//! associative, and idempotent, so replicas that observe the same set of
//! operations in any order materialize the same document.

use std::collections::btree_map::Entry;

use crate::core::{OpId, Operation, VersionVector};
use crate::store::{Document, MetadataEntry, Stroke};

/// One side of a conflict: the write's id and, when known, its context.
#[derive(Debug, Clone, Copy)]
pub struct Claim<'a> {
    /// Operation id of the write.
    pub id: OpId,
    /// Causal context of the write, if still available.
    pub context: Option<&'a VersionVector>,
}

impl<'a> Claim<'a> {
    /// Claim backed by a full operation.
    pub fn of(op: &'a Operation) -> Self {
        Self {
            id: op.id,
            context: Some(&op.causal_context),
        }
    }

    /// Claim known only by id (e.g. a materialized entry).
    pub fn bare(id: OpId) -> Self {
        Self { id, context: None }
    }
}

/// Which claim wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Both claims are the same write.
    Identical,
    /// The existing claim stands.
    KeepCurrent,
    /// The incoming claim replaces the existing one.
    TakeIncoming,
}

/// Decide between two writes to the same stroke or metadata key.
///
/// A write that causally follows the other wins. Concurrent writes fall back
/// to [`WriterStamp`](crate::core::WriterStamp) order: higher Lamport
/// timestamp, then lower author id.
pub fn resolve(current: Claim<'_>, incoming: Claim<'_>) -> Resolution {
    if current.id == incoming.id {
        return Resolution::Identical;
    }
    if incoming.context.is_some_and(|c| c.contains(current.id)) {
        return Resolution::TakeIncoming;
    }
    if current.context.is_some_and(|c| c.contains(incoming.id)) {
        return Resolution::KeepCurrent;
    }
    if incoming.id.stamp() > current.id.stamp() {
        Resolution::TakeIncoming
    } else {
        Resolution::KeepCurrent
    }
}

/// Join two states of the same stroke.
///
/// Deletion is permanent: once either side is tombstoned the result is, and
/// its geometry is dropped. The writer is the later of the two.
pub fn merge_stroke(a: &Stroke, b: &Stroke) -> Stroke {
    debug_assert_eq!(a.id, b.id, "merging different strokes");
    let tombstone = a.tombstone || b.tombstone;
    let writer = a.writer.max(b.writer);
    if tombstone {
        return Stroke {
            id: a.id,
            points: Vec::new(),
            brush: 0,
            tombstone,
            writer,
        };
    }
    // Both sides came from the same insert
    Stroke {
        writer,
        ..a.clone()
    }
}

/// Join two writes to the same metadata key (last writer wins).
pub fn merge_entry(a: &MetadataEntry, b: &MetadataEntry) -> MetadataEntry {
    match resolve(Claim::bare(a.op), Claim::bare(b.op)) {
        Resolution::TakeIncoming => b.clone(),
        Resolution::Identical | Resolution::KeepCurrent => a.clone(),
    }
}

/// Join two documents.
pub fn merge_documents(a: &Document, b: &Document) -> Document {
    let mut out = a.clone();
    for stroke in b.strokes.values() {
        out.join_stroke(stroke.clone());
    }
    for (key, entry) in &b.metadata {
        match out.metadata.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                let merged = merge_entry(existing.get(), entry);
                existing.insert(merged);
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
    }
    out.observed.merge(&b.observed);
    out
}
