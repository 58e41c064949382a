//! Causally consistent document store with copy-on-write views.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::document::Document;
use crate::core::{DEFAULT_MAX_PENDING_OPS, OpId, Operation, VersionVector};

/// Result of applying one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    /// Applied. `released` lists buffered ops that became ready as a
    /// consequence, in the order they were applied.
    Applied {
        /// Ops released from the causal buffer.
        released: Vec<Operation>,
    },
    /// Already observed (or already buffered).
    Duplicate,
    /// Buffered until its causal context is satisfied.
    Pending,
    /// Not ready and the causal buffer is full.
    Rejected,
}

/// Result of applying a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Every op newly applied, including released ones, in apply order.
    pub applied: Vec<Operation>,
    /// Ops skipped as already observed.
    pub duplicates: usize,
    /// Ops left waiting for dependencies.
    pub pending: usize,
    /// Ops refused because the causal buffer is full.
    pub rejected: usize,
}

#[derive(Debug, Clone)]
struct WriterState {
    doc: Arc<Document>,
    pending: BTreeMap<OpId, Operation>,
    pending_limit: usize,
}

impl WriterState {
    fn new(doc: Arc<Document>) -> Self {
        Self {
            doc,
            pending: BTreeMap::new(),
            pending_limit: DEFAULT_MAX_PENDING_OPS,
        }
    }

    fn apply_one(&mut self, op: Operation, applied: &mut Vec<Operation>) -> ApplyResult {
        if self.doc.observed.contains(op.id) || self.pending.contains_key(&op.id) {
            return ApplyResult::Duplicate;
        }
        if !self.doc.observed.dominates(&op.causal_context) {
            if self.pending.len() >= self.pending_limit {
                warn!(op = %op.id, limit = self.pending_limit, "causal buffer full");
                return ApplyResult::Rejected;
            }
            debug!(op = %op.id, "buffering op until its context is satisfied");
            self.pending.insert(op.id, op);
            return ApplyResult::Pending;
        }

        Arc::make_mut(&mut self.doc).apply(&op);
        applied.push(op);
        let first_released = applied.len();
        self.release_ready(applied);
        ApplyResult::Applied {
            released: applied[first_released..].to_vec(),
        }
    }

    fn apply_batch(&mut self, ops: impl IntoIterator<Item = Operation>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for op in ops {
            match self.apply_one(op, &mut outcome.applied) {
                ApplyResult::Duplicate => outcome.duplicates += 1,
                ApplyResult::Rejected => outcome.rejected += 1,
                ApplyResult::Applied { .. } | ApplyResult::Pending => {}
            }
        }
        outcome.pending = self.pending.len();
        outcome
    }

    fn adopt(&mut self, covered: &VersionVector) -> Vec<Operation> {
        if self.doc.observed.dominates(covered) {
            return Vec::new();
        }
        Arc::make_mut(&mut self.doc).observed.merge(covered);
        // Buffered ops now covered were superseded by the adopted state
        let observed = self.doc.observed.clone();
        self.pending.retain(|id, _| !observed.contains(*id));

        let mut released = Vec::new();
        self.release_ready(&mut released);
        released
    }

    /// Apply every buffered op whose context is now satisfied.
    fn release_ready(&mut self, applied: &mut Vec<Operation>) {
        loop {
            let ready: Vec<OpId> = self
                .pending
                .values()
                .filter(|op| self.doc.observed.dominates(&op.causal_context))
                .map(|op| op.id)
                .collect();
            if ready.is_empty() {
                return;
            }
            let doc = Arc::make_mut(&mut self.doc);
            for id in ready {
                if let Some(op) = self.pending.remove(&id) {
                    debug!(op = %op.id, "released buffered op");
                    doc.apply(&op);
                    applied.push(op);
                }
            }
        }
    }
}

impl Default for WriterState {
    fn default() -> Self {
        Self::new(Arc::default())
    }
}

/// The materialized document plus the causal delivery buffer.
///
/// Mutations are serialized by an internal mutex. Readers get immutable
/// `Arc<Document>` views that are swapped once per call and never torn.
/// The `*_durably` variants run a persist step between computing a change
/// and publishing it; if it fails, nothing changes.
#[derive(Debug, Default)]
pub struct DocumentStore {
    published: RwLock<Arc<Document>>,
    writer: Mutex<WriterState>,
}

impl DocumentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from a recovered snapshot.
    pub fn from_document(doc: Document) -> Self {
        let doc = Arc::new(doc);
        Self {
            published: RwLock::new(Arc::clone(&doc)),
            writer: Mutex::new(WriterState::new(doc)),
        }
    }

    /// Cap the number of ops buffered for missing dependencies.
    pub fn with_pending_limit(self, limit: usize) -> Self {
        self.writer.lock().pending_limit = limit.max(1);
        self
    }

    /// Apply one operation.
    pub fn apply(&self, op: Operation) -> ApplyResult {
        let mut state = self.writer.lock();
        let mut applied = Vec::new();
        let result = state.apply_one(op, &mut applied);
        if !applied.is_empty() {
            self.publish(&state);
        }
        result
    }

    /// Apply a batch and publish the result once.
    pub fn apply_batch(&self, ops: impl IntoIterator<Item = Operation>) -> BatchOutcome {
        match self.apply_batch_durably(ops, |_| Ok::<(), Infallible>(())) {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Apply a batch, hand the newly applied ops to `persist`, and publish
    /// only if it succeeds. On error the store is left untouched.
    pub fn apply_batch_durably<E>(
        &self,
        ops: impl IntoIterator<Item = Operation>,
        persist: impl FnOnce(&[Operation]) -> Result<(), E>,
    ) -> Result<BatchOutcome, E> {
        self.stage(
            |state| state.apply_batch(ops),
            |outcome| persist(&outcome.applied),
        )
    }

    /// Mark `covered` as observed without its individual ops.
    ///
    /// Used after a state-based catch-up, whose ops reproduce the remote
    /// document but not every superseded write. Returns ops released from
    /// the causal buffer.
    pub fn adopt_observed(&self, covered: &VersionVector) -> Vec<Operation> {
        match self.adopt_observed_durably(covered, |_| Ok::<(), Infallible>(())) {
            Ok(released) => released,
            Err(never) => match never {},
        }
    }

    /// [`adopt_observed`](Self::adopt_observed) with a persist step for the
    /// released ops.
    pub fn adopt_observed_durably<E>(
        &self,
        covered: &VersionVector,
        persist: impl FnOnce(&[Operation]) -> Result<(), E>,
    ) -> Result<Vec<Operation>, E> {
        self.stage(|state| state.adopt(covered), |released| persist(released))
    }

    /// Drop tombstones covered by `stable`. Returns how many were purged.
    pub fn purge_stable_tombstones(&self, stable: &VersionVector) -> usize {
        let mut state = self.writer.lock();
        let purgeable = state
            .doc
            .strokes()
            .any(|s| s.tombstone && stable.contains(s.id));
        if !purgeable {
            return 0;
        }
        let purged = Arc::make_mut(&mut state.doc).purge_stable_tombstones(stable);
        if purged > 0 {
            self.publish(&state);
        }
        purged
    }

    /// Immutable view of the current document.
    pub fn snapshot_view(&self) -> Arc<Document> {
        Arc::clone(&self.published.read())
    }

    /// Operations applied so far.
    pub fn version_vector(&self) -> VersionVector {
        self.published.read().observed.clone()
    }

    /// Check if an op has been applied.
    pub fn has_observed(&self, id: OpId) -> bool {
        self.published.read().has_observed(id)
    }

    /// Number of ops waiting for dependencies.
    pub fn pending_count(&self) -> usize {
        self.writer.lock().pending.len()
    }

    /// Ops waiting for dependencies, in id order.
    pub fn pending_ops(&self) -> Vec<Operation> {
        self.writer.lock().pending.values().cloned().collect()
    }

    /// Run `mutate` on a copy of the writer state and install the copy
    /// once `persist` accepts the result.
    fn stage<T, E>(
        &self,
        mutate: impl FnOnce(&mut WriterState) -> T,
        persist: impl FnOnce(&T) -> Result<(), E>,
    ) -> Result<T, E> {
        let mut state = self.writer.lock();
        let mut staged = state.clone();
        let result = mutate(&mut staged);
        persist(&result)?;
        let changed = !Arc::ptr_eq(&staged.doc, &state.doc);
        *state = staged;
        if changed {
            self.publish(&state);
        }
        Ok(result)
    }

    fn publish(&self, state: &WriterState) {
        *self.published.write() = Arc::clone(&state.doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AuthorId, OpKind, SamplePoint, StrokeData};
    use proptest::prelude::*;

    fn vv(entries: &[(u64, u64)]) -> VersionVector {
        entries.iter().map(|&(a, c)| (AuthorId(a), c)).collect()
    }

    fn insert(author: u64, counter: u64, ctx: &[(u64, u64)]) -> Operation {
        Operation::new(
            OpId::new(AuthorId(author), counter),
            vv(ctx),
            OpKind::InsertStroke(StrokeData::new(
                vec![SamplePoint::new(counter as f32, author as f32, 0, 1.0)],
                0,
            )),
        )
    }

    fn delete(author: u64, counter: u64, ctx: &[(u64, u64)], target: &Operation) -> Operation {
        Operation::new(
            OpId::new(AuthorId(author), counter),
            vv(ctx),
            OpKind::DeleteStroke { target: target.id },
        )
    }

    #[test]
    fn test_apply_and_duplicate() {
        let store = DocumentStore::new();
        let op = insert(1, 1, &[]);
        assert_eq!(
            store.apply(op.clone()),
            ApplyResult::Applied { released: vec![] }
        );
        assert_eq!(store.apply(op.clone()), ApplyResult::Duplicate);
        assert!(store.has_observed(op.id));
        assert_eq!(store.snapshot_view().visible_count(), 1);
    }

    #[test]
    fn test_out_of_order_delete_waits_for_insert() {
        let store = DocumentStore::new();
        let ins = insert(1, 1, &[]);
        let del = delete(2, 2, &[(1, 1)], &ins);

        assert_eq!(store.apply(del.clone()), ApplyResult::Pending);
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.snapshot_view().strokes().count(), 0);

        assert_eq!(
            store.apply(ins.clone()),
            ApplyResult::Applied {
                released: vec![del.clone()]
            }
        );
        assert_eq!(store.pending_count(), 0);
        let view = store.snapshot_view();
        assert!(view.stroke(ins.id).is_some_and(|s| s.tombstone));
        assert_eq!(view.observed(), &vv(&[(1, 1), (2, 2)]));
    }

    #[test]
    fn test_views_are_immutable() {
        let store = DocumentStore::new();
        store.apply(insert(1, 1, &[]));
        let before = store.snapshot_view();

        store.apply(insert(1, 2, &[(1, 1)]));
        assert_eq!(before.visible_count(), 1);
        assert_eq!(store.snapshot_view().visible_count(), 2);
    }

    #[test]
    fn test_batch_counts() {
        let store = DocumentStore::new();
        let a = insert(1, 1, &[]);
        let b = insert(1, 2, &[(1, 1)]);
        let orphan = insert(2, 9, &[(3, 8)]);
        store.apply(a.clone());

        let outcome = store.apply_batch(vec![a, b.clone(), orphan]);
        assert_eq!(outcome.applied, vec![b]);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.pending, 1);
    }

    #[test]
    fn test_adopt_observed_releases_waiting_ops() {
        let store = DocumentStore::new();
        // Depends on 1@5, which a state catch-up superseded
        let waiting = insert(2, 6, &[(1, 5)]);
        assert_eq!(store.apply(waiting.clone()), ApplyResult::Pending);

        let released = store.adopt_observed(&vv(&[(1, 5)]));
        assert_eq!(released, vec![waiting]);
        assert_eq!(store.version_vector(), vv(&[(1, 5), (2, 6)]));
    }

    #[test]
    fn test_from_document_and_purge() {
        let ins = insert(1, 1, &[]);
        let del = delete(1, 2, &[(1, 1)], &ins);
        let store = DocumentStore::from_document(Document::fold([&ins, &del]));
        assert_eq!(store.apply(ins), ApplyResult::Duplicate);

        assert_eq!(store.purge_stable_tombstones(&vv(&[(1, 1)])), 0);
        assert_eq!(store.purge_stable_tombstones(&vv(&[(1, 2)])), 1);
        assert_eq!(store.snapshot_view().tombstone_count(), 0);
    }

    #[test]
    fn test_failed_persist_leaves_store_untouched() {
        let store = DocumentStore::new();
        let base = insert(1, 1, &[]);
        store.apply(base.clone());
        let view = store.snapshot_view();

        let next = insert(1, 2, &[(1, 1)]);
        let orphan = insert(2, 9, &[(3, 8)]);
        let mut seen = Vec::new();
        let result = store.apply_batch_durably(vec![next.clone(), orphan], |applied| {
            seen = applied.to_vec();
            Err("disk full")
        });
        assert_eq!(result, Err("disk full"));
        assert_eq!(seen, vec![next.clone()]);
        assert!(Arc::ptr_eq(&store.snapshot_view(), &view));
        assert_eq!(store.version_vector(), vv(&[(1, 1)]));
        assert_eq!(store.pending_count(), 0);

        // A later attempt applies normally
        let outcome = store
            .apply_batch_durably(vec![next.clone()], |_| Ok::<(), &str>(()))
            .unwrap();
        assert_eq!(outcome.applied, vec![next]);
        assert_eq!(store.version_vector(), vv(&[(1, 2)]));
    }

    #[test]
    fn test_failed_adopt_persist_keeps_buffer() {
        let store = DocumentStore::new();
        let waiting = insert(2, 6, &[(1, 5)]);
        store.apply(waiting);
        let result = store.adopt_observed_durably(&vv(&[(1, 5)]), |_| Err(()));
        assert_eq!(result, Err(()));
        assert_eq!(store.pending_count(), 1);
        assert!(store.version_vector().is_empty());
    }

    #[test]
    fn test_pending_limit_rejects_overflow() {
        let store = DocumentStore::new().with_pending_limit(2);
        let orphans: Vec<Operation> = (1..=4).map(|i| insert(2, 10 + i, &[(3, 9)])).collect();
        let outcome = store.apply_batch(orphans);
        assert_eq!(outcome.pending, 2);
        assert_eq!(outcome.rejected, 2);
        assert_eq!(store.apply(insert(4, 20, &[(3, 9)])), ApplyResult::Rejected);

        // Ready ops are never refused
        assert!(matches!(
            store.apply(insert(1, 1, &[])),
            ApplyResult::Applied { .. }
        ));
    }

    /// Random causal history over three authors; each op observes a random
    /// prefix of the history that includes its author's previous op.
    fn arb_history() -> impl Strategy<Value = Vec<Operation>> {
        proptest::collection::vec((1u64..4, any::<u16>(), any::<bool>()), 1..30).prop_map(
            |steps| {
                let mut ops: Vec<Operation> = Vec::new();
                let mut last_own: BTreeMap<u64, usize> = BTreeMap::new();
                for (i, (author, seen, del)) in steps.into_iter().enumerate() {
                    let min = last_own.get(&author).map_or(0, |&j| j + 1);
                    let prefix = min + (seen as usize) % (i - min + 1);
                    let ctx: VersionVector = ops[..prefix]
                        .iter()
                        .map(|o| (o.id.author, o.id.counter))
                        .collect();
                    let own = ops
                        .iter()
                        .filter(|o| o.id.author.0 == author)
                        .map(|o| o.id.counter)
                        .max()
                        .unwrap_or(0);
                    let counter = ctx.max_counter().max(own) + 1;
                    let target = ops[..prefix]
                        .iter()
                        .filter(|o| matches!(o.kind, OpKind::InsertStroke(_)))
                        .map(|o| o.id)
                        .last();
                    let kind = match (del, target) {
                        (true, Some(target)) => OpKind::DeleteStroke { target },
                        _ => OpKind::InsertStroke(StrokeData::default()),
                    };
                    last_own.insert(author, i);
                    ops.push(Operation::new(OpId::new(AuthorId(author), counter), ctx, kind));
                }
                ops
            },
        )
    }

    proptest! {
        #[test]
        fn prop_any_delivery_order_converges(
            (history, delivery) in arb_history()
                .prop_flat_map(|h| (Just(h.clone()), Just(h).prop_shuffle()))
        ) {
            let in_order = DocumentStore::new();
            let outcome = in_order.apply_batch(history.clone());
            prop_assert_eq!(outcome.pending, 0);

            let shuffled = DocumentStore::new();
            for op in delivery.clone() {
                shuffled.apply(op);
            }
            // Redelivery is harmless
            shuffled.apply_batch(delivery);

            prop_assert_eq!(shuffled.pending_count(), 0);
            prop_assert_eq!(&*shuffled.snapshot_view(), &*in_order.snapshot_view());
            prop_assert_eq!(&*shuffled.snapshot_view(), &Document::fold(&history));
        }
    }
}
