//! Optimistic overlay.
//!
//! Holds, per record id, the fields a local mutation most recently set. The
//! overlay masks remote snapshots that have not caught up yet and is dropped
//! entry by entry once the remote reports the same values.
//!
//! Edits are kept as partial patches. A create that has been committed
//! remotely but not yet reported by a snapshot is kept as the full record, so
//! it stays visible in between.

use crate::{PaymentPatch, PaymentRecord, RecordId, StorePatch, StoreRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field values a local mutation set on one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Override {
    Store(StorePatch),
    Payment(PaymentPatch),
    CreatedStore(StoreRecord),
    CreatedPayment(PaymentRecord),
}

impl Override {
    pub fn is_empty(&self) -> bool {
        match self {
            Override::Store(patch) => patch.is_empty(),
            Override::Payment(patch) => patch.is_empty(),
            Override::CreatedStore(_) | Override::CreatedPayment(_) => false,
        }
    }

    /// Whether every overridden field equals the remote record's value.
    pub fn satisfied_by(&self, record: RemoteRecord<'_>) -> bool {
        match (self, record) {
            (Override::Store(patch), RemoteRecord::Store(store)) => patch.matches(store),
            (Override::CreatedStore(created), RemoteRecord::Store(store)) => {
                StorePatch::from_record(created).matches(store)
            }
            (Override::Payment(patch), RemoteRecord::Payment(payment)) => patch.matches(payment),
            (Override::CreatedPayment(created), RemoteRecord::Payment(payment)) => {
                PaymentPatch::from_record(created).matches(payment)
            }
            _ => false,
        }
    }

    /// Layer the overridden store fields onto `record`.
    pub fn patch_store(&self, record: &mut StoreRecord) {
        match self {
            Override::Store(patch) => patch.apply_to(record),
            Override::CreatedStore(created) => record.overwrite_contact(created),
            Override::Payment(_) | Override::CreatedPayment(_) => {}
        }
    }

    /// Layer the overridden payment fields onto `record`.
    pub fn patch_payment(&self, record: &mut PaymentRecord) {
        match self {
            Override::Payment(patch) => patch.apply_to(record),
            Override::CreatedPayment(created) => record.overwrite_mutable(created),
            Override::Store(_) | Override::CreatedStore(_) => {}
        }
    }
}

/// A remote record offered to [`Overlay::reconcile`].
#[derive(Debug, Clone, Copy)]
pub enum RemoteRecord<'a> {
    Store(&'a StoreRecord),
    Payment(&'a PaymentRecord),
}

impl RemoteRecord<'_> {
    pub fn id(&self) -> &RecordId {
        match self {
            RemoteRecord::Store(record) => &record.id,
            RemoteRecord::Payment(record) => &record.id,
        }
    }
}

/// Map from record id to its active override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Overlay {
    entries: BTreeMap<RecordId, Override>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer `fields` over whatever override `id` already has. An override of
    /// a different record kind is replaced outright.
    pub fn apply(&mut self, id: RecordId, fields: Override) {
        if fields.is_empty() {
            return;
        }
        let merged = layer(self.entries.remove(&id), fields);
        self.entries.insert(id, merged);
    }

    pub fn get(&self, id: &RecordId) -> Option<&Override> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<Override> {
        self.entries.remove(id)
    }

    /// Drop the override for `record` if every overridden field already
    /// equals the remote value. Returns whether it was dropped.
    pub fn reconcile(&mut self, record: RemoteRecord<'_>) -> bool {
        let satisfied = self
            .entries
            .get(record.id())
            .is_some_and(|fields| fields.satisfied_by(record));
        if satisfied {
            self.entries.remove(record.id());
        }
        satisfied
    }

    /// Move the override held under `from` to `to`, layering it over any
    /// override `to` already has.
    pub fn rekey(&mut self, from: &RecordId, to: &RecordId) -> bool {
        match self.entries.remove(from) {
            Some(fields) => {
                let merged = layer(self.entries.remove(to), fields);
                self.entries.insert(to.clone(), merged);
                true
            }
            None => false,
        }
    }

    /// Drop every entry `keep` rejects, returning how many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&RecordId, &Override) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, fields| keep(id, fields));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &Override)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn layer(base: Option<Override>, newer: Override) -> Override {
    match (base, newer) {
        (Some(Override::Store(mut base)), Override::Store(newer)) => {
            base.merge(newer);
            Override::Store(base)
        }
        (Some(Override::Payment(mut base)), Override::Payment(newer)) => {
            base.merge(newer);
            Override::Payment(base)
        }
        (Some(Override::CreatedStore(mut created)), Override::Store(newer)) => {
            newer.apply_to(&mut created);
            Override::CreatedStore(created)
        }
        (Some(Override::CreatedPayment(mut created)), Override::Payment(newer)) => {
            newer.apply_to(&mut created);
            Override::CreatedPayment(created)
        }
        // Edits made while the create was still queued are newer than it.
        (Some(Override::Store(older)), Override::CreatedStore(mut created)) => {
            older.apply_to(&mut created);
            Override::CreatedStore(created)
        }
        (Some(Override::Payment(older)), Override::CreatedPayment(mut created)) => {
            older.apply_to(&mut created);
            Override::CreatedPayment(created)
        }
        (_, newer) => newer,
    }
}
