//! In-process remote store.
//!
//! Behaves like the hosted document store: server-assigned ids, atomic
//! batches, full snapshots pushed on every change, no uniqueness enforcement.
//! Connectivity can be switched off and single calls can be made to fail,
//! which is what the offline tests drive.

use super::{check_batch, Collection, RemoteError, RemoteStore, SnapshotStream, Write};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tally_engine::{Month, PaymentRecord, RecordId, StoreRecord};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Default, Clone)]
struct Documents {
    stores: Vec<StoreRecord>,
    payments: Vec<PaymentRecord>,
}

/// Remote store kept in memory.
#[derive(Debug)]
pub struct MemoryRemote {
    documents: Mutex<Documents>,
    stores_tx: watch::Sender<Vec<StoreRecord>>,
    payments_tx: watch::Sender<Vec<PaymentRecord>>,
    offline: AtomicBool,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
    commits: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (stores_tx, _) = watch::channel(Vec::new());
        let (payments_tx, _) = watch::channel(Vec::new());
        Self {
            documents: Mutex::new(Documents::default()),
            stores_tx,
            payments_tx,
            offline: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    /// While offline every call fails with [`RemoteError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail as if the connection dropped.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of calls made, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of batches committed.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn stores(&self) -> Vec<StoreRecord> {
        self.documents.lock().await.stores.clone()
    }

    pub async fn payments(&self) -> Vec<PaymentRecord> {
        self.documents.lock().await.payments.clone()
    }

    pub async fn store_named(&self, name: &str) -> Option<StoreRecord> {
        self.documents
            .lock()
            .await
            .stores
            .iter()
            .find(|store| store.name == name)
            .cloned()
    }

    fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("client is offline".into()));
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RemoteError::Unavailable("connection reset".into()));
        }
        Ok(())
    }

    fn publish(&self, documents: &Documents) {
        self.stores_tx.send_replace(documents.stores.clone());
        self.payments_tx.send_replace(documents.payments.clone());
    }
}

fn snapshots<T>(rx: watch::Receiver<Vec<T>>) -> SnapshotStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let snapshot = rx.borrow_and_update().clone();
        Some((Ok(snapshot), (rx, false)))
    })
    .boxed()
}

fn new_id() -> RecordId {
    RecordId::remote(uuid::Uuid::new_v4().simple().to_string())
}

fn apply(documents: &mut Documents, write: Write) -> Result<Option<RecordId>, RemoteError> {
    match write {
        Write::CreateStore(mut record) => {
            let id = new_id();
            record.id = id.clone();
            documents.stores.push(record);
            Ok(Some(id))
        }
        Write::CreatePayment(mut record) => {
            let id = new_id();
            record.id = id.clone();
            documents.payments.push(record);
            Ok(Some(id))
        }
        Write::UpdateStore { id, patch } => {
            let store = documents
                .stores
                .iter_mut()
                .find(|store| store.id == id)
                .ok_or(RemoteError::NotFound(id))?;
            patch.apply_to(store);
            Ok(None)
        }
        Write::UpdatePayment { id, patch } => {
            let payment = documents
                .payments
                .iter_mut()
                .find(|payment| payment.id == id)
                .ok_or(RemoteError::NotFound(id))?;
            patch.apply_to(payment);
            Ok(None)
        }
        Write::AdjustStore {
            id,
            revenue,
            entries,
        } => {
            let store = documents
                .stores
                .iter_mut()
                .find(|store| store.id == id)
                .ok_or(RemoteError::NotFound(id))?;
            store.total_revenue += revenue;
            store.entries = store.entries.saturating_add_signed(entries);
            Ok(None)
        }
        Write::DeleteStore(id) => {
            documents.stores.retain(|store| store.id != id);
            Ok(None)
        }
        Write::DeletePayment(id) => {
            documents.payments.retain(|payment| payment.id != id);
            Ok(None)
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn watch_stores(&self) -> Result<SnapshotStream<StoreRecord>, RemoteError> {
        self.enter()?;
        Ok(snapshots(self.stores_tx.subscribe()))
    }

    async fn watch_payments(&self) -> Result<SnapshotStream<PaymentRecord>, RemoteError> {
        self.enter()?;
        Ok(snapshots(self.payments_tx.subscribe()))
    }

    async fn find_payment(
        &self,
        store_id: &RecordId,
        month: Month,
    ) -> Result<Option<PaymentRecord>, RemoteError> {
        self.enter()?;
        let documents = self.documents.lock().await;
        Ok(documents
            .payments
            .iter()
            .find(|payment| &payment.store_id == store_id && payment.transaction_month == month)
            .cloned())
    }

    async fn get_payment(&self, id: &RecordId) -> Result<Option<PaymentRecord>, RemoteError> {
        self.enter()?;
        let documents = self.documents.lock().await;
        Ok(documents.payments.iter().find(|payment| &payment.id == id).cloned())
    }

    async fn payments_of(&self, store_id: &RecordId) -> Result<Vec<RecordId>, RemoteError> {
        self.enter()?;
        let documents = self.documents.lock().await;
        Ok(documents
            .payments
            .iter()
            .filter(|payment| &payment.store_id == store_id)
            .map(|payment| payment.id.clone())
            .collect())
    }

    async fn list_ids(&self, collection: Collection) -> Result<Vec<RecordId>, RemoteError> {
        self.enter()?;
        let documents = self.documents.lock().await;
        Ok(match collection {
            Collection::Stores => documents.stores.iter().map(|s| s.id.clone()).collect(),
            Collection::Transactions => documents.payments.iter().map(|p| p.id.clone()).collect(),
        })
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<Vec<RecordId>, RemoteError> {
        self.enter()?;
        check_batch(&writes)?;

        let mut documents = self.documents.lock().await;
        // Applied to a copy so a failing write leaves nothing behind.
        let mut staged = documents.clone();
        let mut created = Vec::new();
        for write in writes {
            let is_create = write.is_create();
            if let Some(id) = apply(&mut staged, write)? {
                if is_create {
                    created.push(id);
                }
            }
        }

        *documents = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.publish(&documents);
        Ok(created)
    }
}
