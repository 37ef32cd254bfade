//! The queue snapshot: both operation queues plus the overlay.
//!
//! This is the in-memory form of the three durable records the sync layer
//! persists. All queue rules live here so they can be tested without IO:
//!
//! - deleting a payment that only exists locally cancels its pending upserts
//!   and enqueues nothing
//! - deleting a store that only exists locally cancels every pending
//!   operation for it and for its payments
//! - deleting a remote store drops its pending edits and payment operations
//! - deleting any record drops its overrides so it cannot reappear
//! - once a create commits, every reference to the local id is remapped,
//!   including operations enqueued later that still carry the local id

use crate::{
    error::Result, Error, Month, OperationId, Overlay, Override, PendingOperation, QueueKind,
    QueuedOp, RecordId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which durable records an update touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Touched {
    pub stores: bool,
    pub payments: bool,
    pub overrides: bool,
}

impl Touched {
    pub fn queue(kind: QueueKind) -> Self {
        let mut touched = Touched::default();
        touched.mark(kind);
        touched
    }

    pub fn mark(&mut self, kind: QueueKind) {
        match kind {
            QueueKind::Stores => self.stores = true,
            QueueKind::Payments => self.payments = true,
        }
    }

    pub fn includes(&self, kind: QueueKind) -> bool {
        match kind {
            QueueKind::Stores => self.stores,
            QueueKind::Payments => self.payments,
        }
    }

    pub fn any(&self) -> bool {
        self.stores || self.payments || self.overrides
    }

    pub fn union(self, other: Touched) -> Touched {
        Touched {
            stores: self.stores || other.stores,
            payments: self.payments || other.payments,
            overrides: self.overrides || other.overrides,
        }
    }
}

/// Pending store operations, pending payment operations and the overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    #[serde(default)]
    pub pending_stores: Vec<QueuedOp>,
    #[serde(default)]
    pub pending_payments: Vec<QueuedOp>,
    #[serde(default)]
    pub overrides: Overlay,
    /// Local ids whose creates committed, mapped to their server ids. Only
    /// kept for the life of the process.
    #[serde(skip)]
    aliases: BTreeMap<RecordId, RecordId>,
}

impl QueueSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from its three persisted records.
    pub fn from_parts(
        pending_stores: Vec<QueuedOp>,
        pending_payments: Vec<QueuedOp>,
        overrides: Overlay,
    ) -> Self {
        Self {
            pending_stores,
            pending_payments,
            overrides,
            aliases: BTreeMap::new(),
        }
    }

    /// The id `id` is known by now: its server id once its create has
    /// committed, otherwise `id` itself.
    pub fn resolve(&self, id: &RecordId) -> RecordId {
        self.aliases.get(id).unwrap_or(id).clone()
    }

    pub fn queue(&self, kind: QueueKind) -> &[QueuedOp] {
        match kind {
            QueueKind::Stores => &self.pending_stores,
            QueueKind::Payments => &self.pending_payments,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut Vec<QueuedOp> {
        match kind {
            QueueKind::Stores => &mut self.pending_stores,
            QueueKind::Payments => &mut self.pending_payments,
        }
    }

    /// Pending operations of `kind`, in queue order.
    pub fn operations(&self, kind: QueueKind) -> impl Iterator<Item = &PendingOperation> {
        self.queue(kind).iter().map(|queued| &queued.operation)
    }

    pub fn find(&self, kind: QueueKind, op_id: &str) -> Option<&QueuedOp> {
        self.queue(kind).iter().find(|queued| queued.op_id == op_id)
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).len()
    }

    /// True when neither queue holds an operation.
    pub fn is_drained(&self) -> bool {
        self.pending_stores.is_empty() && self.pending_payments.is_empty()
    }

    /// Whether a `CreateStore` for `id` is still queued.
    pub fn has_store_create(&self, id: &RecordId) -> bool {
        self.operations(QueueKind::Stores).any(|op| {
            matches!(op, PendingOperation::CreateStore { record } if &record.id == id)
        })
    }

    /// Whether any queued operation still references `id`.
    pub fn references(&self, id: &RecordId) -> bool {
        QueueKind::ALL
            .into_iter()
            .flat_map(|kind| self.operations(kind))
            .any(|op| op.references(id))
    }

    /// Append an operation, applying the cancellation rules for deletes of
    /// records that never reached the remote store.
    pub fn enqueue(&mut self, mut queued: QueuedOp) -> Touched {
        let mut touched = Touched::default();

        for (from, to) in &self.aliases {
            queued.operation.remap(from, to);
        }

        match &queued.operation {
            PendingOperation::DeletePayment { id, .. } if id.is_local() => {
                let id = id.clone();
                // Upserts the view collapsed into this payment share its slot.
                let slot = self.payment_slot(&id);
                let cancelled = self.cancel_collect(QueueKind::Payments, |op| match op {
                    PendingOperation::CreateOrUpdatePayment { record } => {
                        record.id == id
                            || slot.as_ref().is_some_and(|(store_id, month)| {
                                record.slot() == (store_id, *month)
                            })
                    }
                    other => other.target_id() == &id,
                });
                touched.payments = !cancelled.is_empty();
                touched.overrides = self.overrides.remove(&id).is_some();
                for other in &cancelled {
                    touched.overrides |= self.overrides.remove(other).is_some();
                }
                return touched;
            }
            PendingOperation::DeleteStore { id } if id.is_local() => {
                let id = id.clone();
                if self.cancel(QueueKind::Stores, |op| op.references(&id)) > 0 {
                    touched.stores = true;
                }
                let cancelled = self.cancel_payments_of(&id);
                touched.payments = !cancelled.is_empty();
                touched.overrides = self.drop_store_overrides(&id, &cancelled);
                return touched;
            }
            PendingOperation::DeleteStore { id } => {
                let id = id.clone();
                self.cancel(QueueKind::Stores, |op| op.target_id() == &id);
                let cancelled = self.cancel_payments_of(&id);
                touched.payments = !cancelled.is_empty();
                touched.overrides = self.drop_store_overrides(&id, &cancelled);
            }
            PendingOperation::DeletePayment { id, .. } => {
                let id = id.clone();
                if self.cancel(QueueKind::Payments, |op| op.target_id() == &id) > 0 {
                    touched.payments = true;
                }
                touched.overrides = self.overrides.remove(&id).is_some();
            }
            _ => {}
        }

        let kind = queued.kind();
        self.queue_mut(kind).push(queued);
        touched.mark(kind);
        touched
    }

    /// Replace a whole queue. This is the only way a queue shrinks outside of
    /// the cancellation rules, and `ops` must be the complete remaining set.
    pub fn replace_all(&mut self, kind: QueueKind, ops: Vec<QueuedOp>) {
        *self.queue_mut(kind) = ops;
    }

    /// Rewrite every reference to `from` in both queues and the overlay.
    /// Operations enqueued later under `from` are rewritten as they arrive.
    pub fn remap(&mut self, from: &RecordId, to: &RecordId) -> Touched {
        let mut touched = Touched::default();
        if from.is_local() && from != to {
            self.aliases.insert(from.clone(), to.clone());
        }
        for kind in QueueKind::ALL {
            for queued in self.queue_mut(kind).iter_mut() {
                if queued.operation.remap(from, to) {
                    touched.mark(kind);
                }
            }
        }
        touched.overrides = self.overrides.rekey(from, to);
        touched
    }

    /// Remove a finished operation and apply the identifier remapping its
    /// commit produced, as one step.
    pub fn settle(
        &mut self,
        kind: QueueKind,
        op_id: &str,
        remap: Option<(&RecordId, &RecordId)>,
    ) -> Result<Touched> {
        let queue = self.queue_mut(kind);
        let position = queue
            .iter()
            .position(|queued| queued.op_id == op_id)
            .ok_or_else(|| Error::InvalidQueue(format!("operation {op_id} is not queued")))?;

        let mut remaining = queue.clone();
        remaining.remove(position);
        self.replace_all(kind, remaining);

        let mut touched = Touched::queue(kind);
        if let Some((from, to)) = remap {
            if from != to {
                touched = touched.union(self.remap(from, to));
            }
        }
        Ok(touched)
    }

    pub fn set_override(&mut self, id: RecordId, fields: Override) {
        let id = self.resolve(&id);
        self.overrides.apply(id, fields);
    }

    pub fn clear_override(&mut self, id: &RecordId) -> bool {
        self.overrides.remove(id).is_some()
    }

    /// Operation ids currently queued under `kind`.
    pub fn op_ids(&self, kind: QueueKind) -> Vec<OperationId> {
        self.queue(kind)
            .iter()
            .map(|queued| queued.op_id.clone())
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidQueue(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidQueue(e.to_string()))
    }

    fn cancel(&mut self, kind: QueueKind, doomed: impl Fn(&PendingOperation) -> bool) -> usize {
        self.cancel_collect(kind, doomed).len()
    }

    /// Remove matching operations, returning their target ids.
    fn cancel_collect(
        &mut self,
        kind: QueueKind,
        doomed: impl Fn(&PendingOperation) -> bool,
    ) -> Vec<RecordId> {
        let mut cancelled = Vec::new();
        self.queue_mut(kind).retain(|queued| {
            let doomed = doomed(&queued.operation);
            if doomed {
                cancelled.push(queued.operation.target_id().clone());
            }
            !doomed
        });
        cancelled
    }

    /// The `(store, month)` slot the latest queued upsert of payment `id`
    /// writes to.
    fn payment_slot(&self, id: &RecordId) -> Option<(RecordId, Month)> {
        self.operations(QueueKind::Payments)
            .filter_map(|op| match op {
                PendingOperation::CreateOrUpdatePayment { record } if &record.id == id => {
                    Some((record.store_id.clone(), record.transaction_month))
                }
                _ => None,
            })
            .last()
    }

    /// Drop the overrides of a deleted store, of the given payments and of
    /// any committed payment created under the store.
    fn drop_store_overrides(&mut self, store_id: &RecordId, payments: &[RecordId]) -> bool {
        let dropped = self.overrides.retain(|id, fields| {
            let created_under_store = matches!(
                fields,
                Override::CreatedPayment(record) if &record.store_id == store_id
            );
            id != store_id && !payments.contains(id) && !created_under_store
        });
        dropped > 0
    }

    /// Cancel every payment operation of a store, returning the affected
    /// payment ids.
    fn cancel_payments_of(&mut self, store_id: &RecordId) -> Vec<RecordId> {
        let affected: Vec<RecordId> = self
            .operations(QueueKind::Payments)
            .filter(|op| op.store_id() == store_id)
            .map(|op| op.target_id().clone())
            .collect();
        self.cancel(QueueKind::Payments, |op| op.store_id() == store_id);
        affected
    }
}
