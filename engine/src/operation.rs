//! Pending operation types.
//!
//! Every local mutation is captured as an operation carrying the full payload
//! needed to replay it against the remote store later, possibly after a
//! restart. Operations live in one of two queues, see [`QueueKind`].

use crate::{PaymentRecord, RecordId, StoreRecord, Timestamp};
use serde::{Deserialize, Serialize};

/// Unique identifier for a queued operation.
pub type OperationId = String;

/// The two durable operation queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueKind {
    Stores,
    Payments,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Stores, QueueKind::Payments];

    /// Name of the durable record holding this queue.
    pub fn record_name(self) -> &'static str {
        match self {
            QueueKind::Stores => "pendingStores",
            QueueKind::Payments => "pendingPayments",
        }
    }
}

/// A local mutation waiting to be replayed against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PendingOperation {
    CreateStore { record: StoreRecord },
    RenameStore { id: RecordId, name: String },
    RelocateStore { id: RecordId, location: String },
    DeleteStore { id: RecordId },
    /// Upsert keyed by `(storeId, transactionMonth)`.
    CreateOrUpdatePayment { record: PaymentRecord },
    DeletePayment { id: RecordId, store_id: RecordId },
}

impl PendingOperation {
    /// The queue this operation belongs to.
    pub fn kind(&self) -> QueueKind {
        match self {
            PendingOperation::CreateStore { .. }
            | PendingOperation::RenameStore { .. }
            | PendingOperation::RelocateStore { .. }
            | PendingOperation::DeleteStore { .. } => QueueKind::Stores,
            PendingOperation::CreateOrUpdatePayment { .. }
            | PendingOperation::DeletePayment { .. } => QueueKind::Payments,
        }
    }

    /// The record this operation mutates.
    pub fn target_id(&self) -> &RecordId {
        match self {
            PendingOperation::CreateStore { record } => &record.id,
            PendingOperation::RenameStore { id, .. }
            | PendingOperation::RelocateStore { id, .. }
            | PendingOperation::DeleteStore { id }
            | PendingOperation::DeletePayment { id, .. } => id,
            PendingOperation::CreateOrUpdatePayment { record } => &record.id,
        }
    }

    /// The store this operation belongs to.
    pub fn store_id(&self) -> &RecordId {
        match self {
            PendingOperation::CreateOrUpdatePayment { record } => &record.store_id,
            PendingOperation::DeletePayment { store_id, .. } => store_id,
            _ => self.target_id(),
        }
    }

    /// Whether any identifier carried by this operation equals `id`.
    pub fn references(&self, id: &RecordId) -> bool {
        self.target_id() == id || self.store_id() == id
    }

    /// Rewrite every occurrence of `from` to `to`. Returns whether anything
    /// changed.
    pub fn remap(&mut self, from: &RecordId, to: &RecordId) -> bool {
        let mut changed = false;
        let mut swap = |slot: &mut RecordId| {
            if slot == from {
                *slot = to.clone();
                changed = true;
            }
        };

        match self {
            PendingOperation::CreateStore { record } => swap(&mut record.id),
            PendingOperation::RenameStore { id, .. }
            | PendingOperation::RelocateStore { id, .. }
            | PendingOperation::DeleteStore { id } => swap(id),
            PendingOperation::CreateOrUpdatePayment { record } => {
                swap(&mut record.id);
                swap(&mut record.store_id);
            }
            PendingOperation::DeletePayment { id, store_id } => {
                swap(id);
                swap(store_id);
            }
        }

        changed
    }

    /// Short name used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            PendingOperation::CreateStore { .. } => "create_store",
            PendingOperation::RenameStore { .. } => "rename_store",
            PendingOperation::RelocateStore { .. } => "relocate_store",
            PendingOperation::DeleteStore { .. } => "delete_store",
            PendingOperation::CreateOrUpdatePayment { .. } => "upsert_payment",
            PendingOperation::DeletePayment { .. } => "delete_payment",
        }
    }
}

/// An operation as it sits in a durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOp {
    pub op_id: OperationId,
    /// When the operation was accepted locally (milliseconds since epoch)
    pub queued_at: Timestamp,
    pub operation: PendingOperation,
}

impl QueuedOp {
    pub fn new(
        op_id: impl Into<OperationId>,
        operation: PendingOperation,
        queued_at: Timestamp,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            queued_at,
            operation,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.operation.kind()
    }
}
