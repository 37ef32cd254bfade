//! Root composition.
//!
//! [`Tally`] owns the queue store, the event bus, the readiness gate, the
//! snapshot listener and the sync worker, and is the only entry point the
//! presentation layer talks to. Every mutation is validated, queued durably
//! and reflected in [`Tally::view`] before it returns; the remote sees it on
//! the next drain.

use crate::config::Config;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::listener::{ListenerStatus, SnapshotListener, SnapshotReceiver};
use crate::readiness::Readiness;
use crate::remote::{reset_collection, Collection, RemoteStore};
use crate::storage::{QueueBackend, QueueStore};
use crate::worker::{DrainReport, SyncWorker};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tally_engine::{
    Error as EngineError, MergedView, Merger, Override, PaymentDraft, PaymentPatch,
    PaymentRecord, PendingOperation, QueueKind, QueuedOp, RecordId, RemoteSnapshot, StoreDraft,
    StorePatch, StoreRecord, Touched,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Point-in-time sync status for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub ready: bool,
    pub pending_stores: usize,
    pub pending_payments: usize,
    pub overrides: usize,
    pub listener: ListenerStatus,
    pub last_drain: Option<DrainReport>,
    /// Soft, user-facing note; never an error dialog.
    pub message: Option<String>,
}

/// Documents deleted by an administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub stores: usize,
    pub transactions: usize,
}

pub struct Tally {
    config: Config,
    queue: Arc<QueueStore>,
    remote: Arc<dyn RemoteStore>,
    bus: EventBus,
    readiness: Readiness,
    listener: SnapshotListener,
    worker: Arc<SyncWorker>,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl Tally {
    /// Open the queue store and start the listener, the worker and the
    /// override pruner. Nothing talks to the remote until
    /// [`authenticate`](Self::authenticate).
    pub fn start(
        config: Config,
        backend: impl QueueBackend + 'static,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Arc<Self>> {
        let queue = Arc::new(QueueStore::open(backend)?);
        let bus = EventBus::new();
        let readiness = Readiness::new();

        let listener = SnapshotListener::spawn(Arc::clone(&remote), readiness.clone());
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&queue),
            Arc::clone(&remote),
            bus.clone(),
            config.batch_limit,
        ));

        // Exits on its own after `shutdown`, finishing the item in flight.
        worker.spawn(readiness.clone(), config.retry_interval);
        let pruner = spawn_pruner(Arc::clone(&queue), listener.snapshots());

        tracing::info!(app_id = %config.app_id, "Tally client started");

        Ok(Arc::new(Self {
            config,
            queue,
            remote,
            bus,
            readiness,
            listener,
            worker,
            pruner: Mutex::new(Some(pruner)),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flip the readiness gate. Returns `true` the first time only.
    pub fn authenticate(&self) -> bool {
        let opened = self.readiness.mark_ready();
        if opened {
            tracing::info!("Session established, sync enabled");
        }
        opened
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn snapshots(&self) -> SnapshotReceiver {
        self.listener.snapshots()
    }

    pub fn create_store(&self, draft: StoreDraft) -> Result<StoreRecord> {
        let record = draft.into_record(RecordId::local(new_token()), crate::now_millis())?;
        self.enqueue(PendingOperation::CreateStore {
            record: record.clone(),
        })?;
        Ok(record)
    }

    pub fn rename_store(&self, id: &RecordId, name: &str) -> Result<()> {
        let name = required(name, "name")?;
        let id = self.require_store(id)?.id;
        self.enqueue(PendingOperation::RenameStore {
            id: id.clone(),
            name: name.clone(),
        })?;
        self.optimistic_edit(&id, Override::Store(StorePatch::name(name)))
    }

    pub fn relocate_store(&self, id: &RecordId, location: &str) -> Result<()> {
        let location = location.trim().to_string();
        let id = self.require_store(id)?.id;
        self.enqueue(PendingOperation::RelocateStore {
            id: id.clone(),
            location: location.clone(),
        })?;
        self.optimistic_edit(&id, Override::Store(StorePatch::location(location)))
    }

    /// Delete a store together with its payments.
    pub fn delete_store(&self, id: &RecordId) -> Result<()> {
        let id = self.require_store(id)?.id;
        self.enqueue(PendingOperation::DeleteStore { id })
    }

    /// Record a payment for a store shown in the current view.
    pub fn record_payment(&self, mut draft: PaymentDraft) -> Result<PaymentRecord> {
        draft.validate()?;
        draft.store_id = self.require_store(&draft.store_id)?.id;

        let record = draft.into_record(RecordId::local(new_token()), crate::now_millis())?;
        self.enqueue(PendingOperation::CreateOrUpdatePayment {
            record: record.clone(),
        })?;
        Ok(record)
    }

    /// Replace the mutable fields of a payment. Store and creation time are
    /// kept from the existing record.
    pub fn edit_payment(&self, id: &RecordId, draft: PaymentDraft) -> Result<PaymentRecord> {
        draft.validate()?;
        let existing = self.require_payment(id)?;

        let mut record = draft.into_record(existing.id.clone(), existing.created_at)?;
        record.store_id = existing.store_id;
        self.enqueue(PendingOperation::CreateOrUpdatePayment {
            record: record.clone(),
        })?;
        let fields = Override::Payment(PaymentPatch::from_record(&record));
        self.optimistic_edit(&record.id, fields)?;
        Ok(record)
    }

    pub fn delete_payment(&self, id: &RecordId) -> Result<()> {
        let existing = self.require_payment(id)?;
        self.enqueue(PendingOperation::DeletePayment {
            id: existing.id,
            store_id: existing.store_id,
        })
    }

    /// The reconciled view: latest snapshot, pending operations and overlay.
    /// Overrides the merge found stale are cleared on the way.
    pub fn view(&self) -> Result<MergedView> {
        let snapshot = self.listener.latest();
        let view = merge(snapshot.as_deref(), &self.queue)?;
        Ok(view)
    }

    pub fn status(&self) -> Status {
        let queue = self.queue.snapshot();
        let ready = self.is_ready();
        let listener = self.listener.status();
        let last_drain = self.worker.last_report();
        let pending = queue.len(QueueKind::Stores) + queue.len(QueueKind::Payments);

        let message = if !ready {
            Some("Not signed in. Changes are saved on this device.".to_string())
        } else if let ListenerStatus::Failed(reason) = &listener {
            Some(format!("Live updates unavailable: {reason}"))
        } else {
            match &last_drain {
                Some(report) if !report.is_clean() && report.retryable => Some(format!(
                    "Offline. {pending} change(s) will sync when the connection returns."
                )),
                Some(report) if !report.is_clean() => Some(format!(
                    "Some changes could not be synced: {}",
                    report.last_error.as_deref().unwrap_or("unknown error")
                )),
                _ if pending > 0 => Some(format!("Syncing {pending} change(s).")),
                _ => None,
            }
        };

        Status {
            ready,
            pending_stores: queue.len(QueueKind::Stores),
            pending_payments: queue.len(QueueKind::Payments),
            overrides: queue.overrides.len(),
            listener,
            last_drain,
            message,
        }
    }

    /// Drain now instead of waiting for the next trigger. Returns `None`
    /// before readiness or when a drain is already running.
    pub async fn drain_now(&self) -> Result<Option<DrainReport>> {
        if !self.is_ready() {
            return Ok(None);
        }
        self.worker.drain().await
    }

    /// Delete every document of both remote collections.
    pub async fn admin_reset(&self) -> Result<ResetReport> {
        let limit = self.config.batch_limit;
        let transactions =
            reset_collection(self.remote.as_ref(), Collection::Transactions, limit).await?;
        let stores = reset_collection(self.remote.as_ref(), Collection::Stores, limit).await?;
        Ok(ResetReport {
            stores,
            transactions,
        })
    }

    /// Stop the background tasks. The worker finishes its current item.
    pub fn shutdown(&self) {
        self.worker.shutdown();
        self.listener.unsubscribe();
        let pruner = self
            .pruner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pruner) = pruner {
            pruner.abort();
            tracing::info!("Tally client stopped");
        }
    }

    fn enqueue(&self, operation: PendingOperation) -> Result<()> {
        let label = operation.label();
        let record_id = operation.target_id().clone();
        let queued = QueuedOp::new(crate::new_op_id(), operation, crate::now_millis());
        let touched = self.queue.enqueue(queued)?;

        tracing::debug!(op = label, record_id = %record_id, "Operation queued");
        self.publish(touched);
        Ok(())
    }

    fn optimistic_edit(&self, id: &RecordId, fields: Override) -> Result<()> {
        self.queue.set_override(id.clone(), fields.clone())?;
        self.bus.publish(Event::OptimisticEdit {
            id: id.clone(),
            fields,
        });
        Ok(())
    }

    fn publish(&self, touched: Touched) {
        for kind in QueueKind::ALL {
            if touched.includes(kind) {
                self.bus.publish(Event::queue_changed(kind));
            }
        }
    }

    /// The store as currently shown. A local id whose create has committed
    /// resolves to the server record.
    fn require_store(&self, id: &RecordId) -> Result<StoreRecord> {
        self.view()?
            .store(&self.queue.resolve(id))
            .map(|view| view.store.clone())
            .ok_or_else(|| EngineError::RecordNotFound(id.to_string()).into())
    }

    fn require_payment(&self, id: &RecordId) -> Result<PaymentRecord> {
        self.view()?
            .payment(&self.queue.resolve(id))
            .cloned()
            .ok_or_else(|| EngineError::RecordNotFound(id.to_string()).into())
    }
}

impl Drop for Tally {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn merge(snapshot: Option<&RemoteSnapshot>, queue: &QueueStore) -> Result<MergedView> {
    let view = Merger::new(snapshot, &queue.snapshot()).merge();
    if !view.stale_overrides.is_empty() {
        let cleared = queue.clear_overrides(&view.stale_overrides)?;
        tracing::debug!(cleared, "Stale overrides pruned");
    }
    Ok(view)
}

/// Prune the overlay whenever a new snapshot arrives, so overrides do not
/// pile up while nobody reads the view.
fn spawn_pruner(queue: Arc<QueueStore>, mut snapshots: SnapshotReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if let Err(e) = merge(snapshot.as_deref(), &queue) {
                tracing::warn!(error = %e, "Failed to prune overrides");
            }
        }
    })
}

fn required(value: &str, field: &'static str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::MissingRequiredField(field).into());
    }
    Ok(value.to_string())
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
