//! Materialized document state.

use std::collections::BTreeMap;

use crate::core::{
    MetadataValue, OpId, OpKind, Operation, SamplePoint, StrokeData, VersionVector, WriterStamp,
};
use crate::merge::{merge_entry, merge_stroke};

/// A stroke as seen by readers.
#[derive(Debug, Clone, PartialEq)]
pub struct Stroke {
    /// Id of the insert operation that created the stroke.
    pub id: OpId,
    /// Geometry; empty once deleted.
    pub points: Vec<SamplePoint>,
    /// Brush identifier.
    pub brush: u32,
    /// Set once any delete for this stroke has been observed.
    pub tombstone: bool,
    /// Latest operation that touched the stroke.
    pub writer: WriterStamp,
}

impl Stroke {
    /// Stroke created by an insert.
    pub fn inserted(id: OpId, data: &StrokeData) -> Self {
        Self {
            id,
            points: data.points.clone(),
            brush: data.brush,
            tombstone: false,
            writer: id.stamp(),
        }
    }

    /// Tombstone marker left by a delete.
    pub fn deleted(target: OpId, by: OpId) -> Self {
        Self {
            id: target,
            points: Vec::new(),
            brush: 0,
            tombstone: true,
            writer: by.stamp(),
        }
    }

    /// Check if the stroke is visible.
    pub fn is_visible(&self) -> bool {
        !self.tombstone
    }
}

/// A metadata field and the write that set it.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    /// Current value (`Cleared` if removed).
    pub value: MetadataValue,
    /// Precedence of the winning write.
    pub writer: WriterStamp,
    /// Winning operation.
    pub op: OpId,
}

impl MetadataEntry {
    /// Entry written by `op`.
    pub fn new(op: OpId, value: MetadataValue) -> Self {
        Self {
            value,
            writer: op.stamp(),
            op,
        }
    }
}

/// Materialized page: the fold of every observed operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub(crate) strokes: BTreeMap<OpId, Stroke>,
    pub(crate) metadata: BTreeMap<String, MetadataEntry>,
    pub(crate) observed: VersionVector,
}

impl Document {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a document from scratch. The result does not depend on the
    /// order of `ops`.
    pub fn fold<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut doc = Self::new();
        for op in ops {
            doc.apply(op);
        }
        doc
    }

    /// Fold one operation in. Re-applying an op leaves the document unchanged.
    pub fn apply(&mut self, op: &Operation) {
        match &op.kind {
            OpKind::InsertStroke(data) => {
                self.join_stroke(Stroke::inserted(op.id, data));
            }
            OpKind::DeleteStroke { target } => {
                self.join_stroke(Stroke::deleted(*target, op.id));
            }
            OpKind::UpdateMetadata { key, value } => {
                let incoming = MetadataEntry::new(op.id, value.clone());
                match self.metadata.get_mut(key) {
                    Some(entry) => *entry = merge_entry(entry, &incoming),
                    None => {
                        self.metadata.insert(key.clone(), incoming);
                    }
                }
            }
        }
        self.observed.observe(op.id);
    }

    pub(crate) fn join_stroke(&mut self, incoming: Stroke) {
        match self.strokes.get_mut(&incoming.id) {
            Some(stroke) => *stroke = merge_stroke(stroke, &incoming),
            None => {
                self.strokes.insert(incoming.id, incoming);
            }
        }
    }

    /// Every stroke, including tombstones, in id order.
    pub fn strokes(&self) -> impl Iterator<Item = &Stroke> {
        self.strokes.values()
    }

    /// Visible strokes in deterministic (id) order.
    pub fn visible_strokes(&self) -> impl Iterator<Item = &Stroke> {
        self.strokes.values().filter(|s| s.is_visible())
    }

    /// Look up a stroke by the id of its insert.
    pub fn stroke(&self, id: OpId) -> Option<&Stroke> {
        self.strokes.get(&id)
    }

    /// Number of visible strokes.
    pub fn visible_count(&self) -> usize {
        self.visible_strokes().count()
    }

    /// Number of retained tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.strokes.values().filter(|s| s.tombstone).count()
    }

    /// Current value of a metadata field (`None` if unset or cleared).
    pub fn metadata(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata
            .get(key)
            .map(|e| &e.value)
            .filter(|v| !v.is_cleared())
    }

    /// Every metadata entry, including cleared ones.
    pub fn metadata_entries(&self) -> impl Iterator<Item = (&str, &MetadataEntry)> {
        self.metadata.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Operations folded into this document.
    pub fn observed(&self) -> &VersionVector {
        &self.observed
    }

    /// Check if an operation has been folded in.
    pub fn has_observed(&self, id: OpId) -> bool {
        self.observed.contains(id)
    }

    /// Check if nothing has been observed.
    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    /// Drop tombstones whose insert and delete are covered by `stable`.
    ///
    /// `stable` should be the meet of every known peer's acknowledged vector:
    /// no peer can still send an operation that needs the marker.
    pub fn purge_stable_tombstones(&mut self, stable: &VersionVector) -> usize {
        let before = self.strokes.len();
        self.strokes.retain(|id, stroke| {
            let delete = OpId::new(stroke.writer.author, stroke.writer.lamport);
            !(stroke.tombstone && stable.contains(*id) && stable.contains(delete))
        });
        before - self.strokes.len()
    }

    /// Operations whose fold reproduces this document's state.
    ///
    /// Used to catch up a peer that is behind the log's compaction floor.
    /// Superseded writes are not reproduced. Ops come out in id order and
    /// each context lists only earlier synthesized ops with a lower counter,
    /// so a receiver applying them in order never waits on a dependency.
    pub fn synthesize_ops(&self) -> Vec<(OpId, OpKind)> {
        let mut ops = Vec::new();
        for stroke in self.strokes.values() {
            if stroke.tombstone {
                let delete = OpId::new(stroke.writer.author, stroke.writer.lamport);
                ops.push((delete, OpKind::DeleteStroke { target: stroke.id }));
            } else {
                let data = StrokeData::new(stroke.points.clone(), stroke.brush);
                ops.push((stroke.id, OpKind::InsertStroke(data)));
            }
        }
        for (key, entry) in &self.metadata {
            ops.push((
                entry.op,
                OpKind::UpdateMetadata {
                    key: key.clone(),
                    value: entry.value.clone(),
                },
            ));
        }
        ops.sort_by_key(|(id, _)| *id);
        ops.dedup_by_key(|(id, _)| *id);
        ops
    }

    /// [`synthesize_ops`](Self::synthesize_ops) with causal contexts attached.
    pub fn synthesize_operations(&self) -> Vec<Operation> {
        let mut frontier = VersionVector::new();
        let mut current = VersionVector::new();
        let mut current_counter = 0;
        let mut out = Vec::new();
        for (id, kind) in self.synthesize_ops() {
            if id.counter != current_counter {
                frontier.merge(&current);
                current_counter = id.counter;
            }
            current.observe(id);
            out.push(Operation::new(id, frontier.clone(), kind));
        }
        out
    }
}
