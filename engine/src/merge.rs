//! Reconciliation of remote snapshots with local state.
//!
//! The merger is a pure function of the latest remote snapshot and the queue
//! snapshot (both queues plus the overlay). It produces the view model shown
//! to the user and the list of overrides that are no longer needed.
//!
//! # Algorithm
//!
//! 1. Start from the remote snapshot, or nothing if none has arrived yet
//! 2. Prune overrides the remote has caught up with, and overrides whose
//!    record can no longer appear
//! 3. Replay pending store operations
//! 4. Replay pending payment operations: match by id, then by
//!    `(storeId, transactionMonth)`, else append
//! 5. Layer the remaining overrides on top
//! 6. Group payments per store, sorted by month, and total them

use crate::{
    Overlay, Override, PaymentRecord, PendingOperation, QueueKind, QueueSnapshot, RecordId,
    RemoteRecord, StoreRecord,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Full contents of both remote collections as last reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    #[serde(default)]
    pub stores: Vec<StoreRecord>,
    #[serde(default)]
    pub payments: Vec<PaymentRecord>,
}

impl RemoteSnapshot {
    pub fn store(&self, id: &RecordId) -> Option<&StoreRecord> {
        self.stores.iter().find(|store| &store.id == id)
    }

    pub fn payment(&self, id: &RecordId) -> Option<&PaymentRecord> {
        self.payments.iter().find(|payment| &payment.id == id)
    }
}

/// One store as displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreView {
    /// The store record. Its `total_revenue`/`entries` are the remote
    /// aggregates, kept for comparison only.
    pub store: StoreRecord,
    /// Payments in calendar month order
    pub payments: Vec<PaymentRecord>,
    /// Sum of `payment_amount` over `payments`
    pub total_revenue: Decimal,
    /// Number of `payments`
    pub entries: u64,
    /// Whether operations touching this store are still queued
    pub pending: bool,
}

/// Result of a merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedView {
    pub stores: Vec<StoreView>,
    /// Overrides that should be cleared from the persisted overlay
    pub stale_overrides: Vec<RecordId>,
}

impl MergedView {
    pub fn store(&self, id: &RecordId) -> Option<&StoreView> {
        self.stores.iter().find(|view| &view.store.id == id)
    }

    pub fn store_named(&self, name: &str) -> Option<&StoreView> {
        self.stores.iter().find(|view| view.store.name == name)
    }

    pub fn payment(&self, id: &RecordId) -> Option<&PaymentRecord> {
        self.stores
            .iter()
            .flat_map(|view| view.payments.iter())
            .find(|payment| &payment.id == id)
    }

    pub fn total_revenue(&self) -> Decimal {
        self.stores.iter().map(|view| view.total_revenue).sum()
    }
}

/// Merges a remote snapshot with the local queues and overlay.
pub struct Merger<'a> {
    remote: Option<&'a RemoteSnapshot>,
    queue: &'a QueueSnapshot,
}

impl<'a> Merger<'a> {
    /// `remote` is `None` until the first snapshot arrives. Without one,
    /// nothing is pruned since absence from the remote proves nothing.
    pub fn new(remote: Option<&'a RemoteSnapshot>, queue: &'a QueueSnapshot) -> Self {
        Self { remote, queue }
    }

    pub fn merge(&self) -> MergedView {
        let (overlay, stale_overrides) = self.prune();
        let mut pending = HashSet::new();

        let (mut stores, mut payments) = match self.remote {
            Some(remote) => (remote.stores.clone(), remote.payments.clone()),
            None => (Vec::new(), Vec::new()),
        };

        self.replay_store_ops(&mut stores, &mut pending);
        self.replay_payment_ops(&mut payments, &mut pending);
        layer_overlay(&overlay, &mut stores, &mut payments);

        MergedView {
            stores: group(stores, payments, &pending),
            stale_overrides,
        }
    }

    /// Work out which overrides are no longer needed. Returns the overlay
    /// that should still be applied and the ids of the dropped entries.
    fn prune(&self) -> (Overlay, Vec<RecordId>) {
        let mut overlay = self.queue.overrides.clone();
        let Some(remote) = self.remote else {
            return (overlay, Vec::new());
        };

        let mut stale = Vec::new();
        for store in &remote.stores {
            if overlay.reconcile(RemoteRecord::Store(store)) {
                stale.push(store.id.clone());
            }
        }
        for payment in &remote.payments {
            if overlay.reconcile(RemoteRecord::Payment(payment)) {
                stale.push(payment.id.clone());
            }
        }

        let vanished: Vec<RecordId> = overlay
            .iter()
            .filter(|(id, fields)| self.vanished(remote, id, fields))
            .map(|(id, _)| id.clone())
            .collect();
        for id in vanished {
            overlay.remove(&id);
            stale.push(id);
        }

        stale.sort();
        (overlay, stale)
    }

    /// An override whose record will never show up remotely again.
    fn vanished(&self, remote: &RemoteSnapshot, id: &RecordId, fields: &Override) -> bool {
        if self.queue.references(id) {
            return false;
        }
        if id.is_local() {
            // Nothing queued will ever commit this id.
            return true;
        }
        match fields {
            Override::Store(_) => remote.store(id).is_none(),
            Override::Payment(_) => remote.payment(id).is_none(),
            // Committed but possibly not yet reported.
            Override::CreatedStore(_) => false,
            Override::CreatedPayment(created) => remote
                .payments
                .iter()
                .any(|payment| &payment.id != id && payment.slot() == created.slot()),
        }
    }

    fn replay_store_ops(&self, stores: &mut Vec<StoreRecord>, pending: &mut HashSet<RecordId>) {
        for op in self.queue.operations(QueueKind::Stores) {
            match op {
                PendingOperation::CreateStore { record } => {
                    match stores.iter_mut().find(|store| store.id == record.id) {
                        Some(existing) => existing.overwrite_contact(record),
                        None => stores.push(record.clone()),
                    }
                    pending.insert(record.id.clone());
                }
                PendingOperation::RenameStore { id, name } => {
                    if let Some(store) = stores.iter_mut().find(|store| &store.id == id) {
                        store.name.clone_from(name);
                    }
                    pending.insert(id.clone());
                }
                PendingOperation::RelocateStore { id, location } => {
                    if let Some(store) = stores.iter_mut().find(|store| &store.id == id) {
                        store.location.clone_from(location);
                    }
                    pending.insert(id.clone());
                }
                PendingOperation::DeleteStore { id } => {
                    stores.retain(|store| &store.id != id);
                }
                PendingOperation::CreateOrUpdatePayment { .. }
                | PendingOperation::DeletePayment { .. } => {}
            }
        }
    }

    fn replay_payment_ops(
        &self,
        payments: &mut Vec<PaymentRecord>,
        pending: &mut HashSet<RecordId>,
    ) {
        for op in self.queue.operations(QueueKind::Payments) {
            match op {
                PendingOperation::CreateOrUpdatePayment { record } => {
                    upsert_payment(payments, record);
                    pending.insert(record.store_id.clone());
                }
                PendingOperation::DeletePayment { id, store_id } => {
                    payments.retain(|payment| &payment.id != id);
                    pending.insert(store_id.clone());
                }
                _ => {}
            }
        }
    }
}

/// Apply one pending upsert to the working set.
fn upsert_payment(payments: &mut Vec<PaymentRecord>, record: &PaymentRecord) {
    let index = match payments.iter().position(|payment| payment.id == record.id) {
        Some(index) => {
            payments[index].overwrite_mutable(record);
            index
        }
        None => match payments
            .iter()
            .position(|payment| payment.slot() == record.slot())
        {
            Some(index) => {
                payments[index].overwrite_mutable(record);
                index
            }
            None => {
                payments.push(record.clone());
                payments.len() - 1
            }
        },
    };

    // An edit that moved the month onto an occupied slot folds into the
    // occupant, which stays canonical.
    let moved = &payments[index];
    let occupant = payments
        .iter()
        .position(|payment| payment.id != moved.id && payment.slot() == moved.slot());
    if let Some(occupant) = occupant {
        let fields = payments.remove(index);
        let occupant = if occupant > index { occupant - 1 } else { occupant };
        payments[occupant].overwrite_mutable(&fields);
    }
}

fn layer_overlay(
    overlay: &Overlay,
    stores: &mut Vec<StoreRecord>,
    payments: &mut Vec<PaymentRecord>,
) {
    for (id, fields) in overlay.iter() {
        match fields {
            Override::Store(_) | Override::CreatedStore(_) => {
                match stores.iter_mut().find(|store| &store.id == id) {
                    Some(store) => fields.patch_store(store),
                    None => {
                        if let Override::CreatedStore(created) = fields {
                            stores.push(created.clone());
                        }
                    }
                }
            }
            Override::Payment(_) | Override::CreatedPayment(_) => {
                match payments.iter_mut().find(|payment| &payment.id == id) {
                    Some(payment) => fields.patch_payment(payment),
                    None => {
                        if let Override::CreatedPayment(created) = fields {
                            let taken = payments
                                .iter()
                                .any(|payment| payment.slot() == created.slot());
                            if !taken {
                                payments.push(created.clone());
                            }
                        }
                    }
                }
            }
        }
    }
}

fn group(
    mut stores: Vec<StoreRecord>,
    payments: Vec<PaymentRecord>,
    pending: &HashSet<RecordId>,
) -> Vec<StoreView> {
    let mut by_store: BTreeMap<RecordId, Vec<PaymentRecord>> = BTreeMap::new();
    for payment in payments {
        by_store
            .entry(payment.store_id.clone())
            .or_default()
            .push(payment);
    }

    stores.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    stores
        .into_iter()
        .map(|store| {
            let mut payments = by_store.remove(&store.id).unwrap_or_default();
            payments.sort_by(|a, b| {
                a.transaction_month
                    .cmp(&b.transaction_month)
                    .then(a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
            let total_revenue = payments.iter().map(|payment| payment.payment_amount).sum();
            let entries = payments.len() as u64;
            let pending = pending.contains(&store.id);
            StoreView {
                store,
                payments,
                total_revenue,
                entries,
                pending,
            }
        })
        .collect()
}
