//! Remote document store.
//!
//! The remote holds two collections, `stores` and `transactions`, under an
//! application namespace. It streams full-collection snapshots, answers the
//! exact-match `(storeId, transactionMonth)` query, and commits batches of at
//! most [`MAX_BATCH_WRITES`] writes atomically.

mod memory;
mod postgres;

pub use memory::MemoryRemote;
pub use postgres::PgRemote;

use crate::config::MAX_BATCH_WRITES;
use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_engine::{Month, PaymentPatch, PaymentRecord, RecordId, StorePatch, StoreRecord};

/// A stream of full-collection snapshots, one per remote change.
pub type SnapshotStream<T> = BoxStream<'static, Result<Vec<T>, RemoteError>>;

/// The two remote collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Stores,
    Transactions,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Stores, Collection::Transactions];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Stores => "stores",
            Collection::Transactions => "transactions",
        }
    }

    /// The delete write for a document of this collection.
    pub fn delete(self, id: RecordId) -> Write {
        match self {
            Collection::Stores => Write::DeleteStore(id),
            Collection::Transactions => Write::DeletePayment(id),
        }
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// The record's id is ignored; the remote assigns one.
    CreateStore(StoreRecord),
    /// The record's id is ignored; the remote assigns one.
    CreatePayment(PaymentRecord),
    UpdateStore { id: RecordId, patch: StorePatch },
    UpdatePayment { id: RecordId, patch: PaymentPatch },
    /// Incremental change to a store's aggregates.
    AdjustStore {
        id: RecordId,
        revenue: Decimal,
        entries: i64,
    },
    DeleteStore(RecordId),
    DeletePayment(RecordId),
}

impl Write {
    /// Every id this write sends to the remote. All must be remote ids.
    fn references(&self) -> Vec<&RecordId> {
        match self {
            Write::CreateStore(_) => Vec::new(),
            Write::CreatePayment(record) => vec![&record.store_id],
            Write::UpdateStore { id, .. }
            | Write::UpdatePayment { id, .. }
            | Write::AdjustStore { id, .. }
            | Write::DeleteStore(id)
            | Write::DeletePayment(id) => vec![id],
        }
    }

    fn is_create(&self) -> bool {
        matches!(self, Write::CreateStore(_) | Write::CreatePayment(_))
    }
}

/// Reject batches the remote would refuse before touching it.
pub(crate) fn check_batch(writes: &[Write]) -> Result<(), RemoteError> {
    if writes.len() > MAX_BATCH_WRITES {
        return Err(RemoteError::BatchTooLarge(writes.len()));
    }
    for write in writes {
        if let Some(local) = write.references().into_iter().find(|id| id.is_local()) {
            return Err(RemoteError::LocalReference(local.clone()));
        }
    }
    Ok(())
}

/// Remote store errors.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote record not found: {0}")]
    NotFound(RecordId),

    #[error("batch of {0} writes exceeds the limit of {max}", max = MAX_BATCH_WRITES)]
    BatchTooLarge(usize),

    #[error("local id {0} cannot be sent to the remote store")]
    LocalReference(RecordId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to decode remote document: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Connectivity and permission failures clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Unavailable(_) | RemoteError::PermissionDenied(_) => true,
            RemoteError::Database(e) => !matches!(
                e,
                sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_)
            ),
            RemoteError::NotFound(_)
            | RemoteError::BatchTooLarge(_)
            | RemoteError::LocalReference(_)
            | RemoteError::Decode(_) => false,
        }
    }
}

/// The remote document store the sync worker replays against.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Snapshots of the `stores` collection. The first item is the current
    /// contents.
    async fn watch_stores(&self) -> Result<SnapshotStream<StoreRecord>, RemoteError>;

    /// Snapshots of the `transactions` collection. The first item is the
    /// current contents.
    async fn watch_payments(&self) -> Result<SnapshotStream<PaymentRecord>, RemoteError>;

    /// The payment held for `(store_id, month)`, if any.
    async fn find_payment(
        &self,
        store_id: &RecordId,
        month: Month,
    ) -> Result<Option<PaymentRecord>, RemoteError>;

    async fn get_payment(&self, id: &RecordId) -> Result<Option<PaymentRecord>, RemoteError>;

    /// Ids of every payment booked against `store_id`.
    async fn payments_of(&self, store_id: &RecordId) -> Result<Vec<RecordId>, RemoteError>;

    async fn list_ids(&self, collection: Collection) -> Result<Vec<RecordId>, RemoteError>;

    /// Apply `writes` atomically. Returns the ids assigned to the create
    /// writes, in batch order.
    async fn commit(&self, writes: Vec<Write>) -> Result<Vec<RecordId>, RemoteError>;
}

/// Commit `writes` in consecutive batches of at most `batch_limit`. Batches
/// are atomic individually, not as a whole.
pub async fn commit_chunked(
    remote: &dyn RemoteStore,
    writes: Vec<Write>,
    batch_limit: usize,
) -> Result<Vec<RecordId>, RemoteError> {
    let limit = batch_limit.clamp(1, MAX_BATCH_WRITES);
    let mut created = Vec::new();
    for chunk in writes.chunks(limit) {
        created.extend(remote.commit(chunk.to_vec()).await?);
    }
    Ok(created)
}

/// Delete every document of `collection`. Returns how many were deleted.
pub async fn reset_collection(
    remote: &dyn RemoteStore,
    collection: Collection,
    batch_limit: usize,
) -> Result<usize, RemoteError> {
    let ids = remote.list_ids(collection).await?;
    let count = ids.len();
    let writes = ids.into_iter().map(|id| collection.delete(id)).collect();
    commit_chunked(remote, writes, batch_limit).await?;

    tracing::info!(collection = collection.name(), deleted = count, "Collection reset");
    Ok(count)
}
