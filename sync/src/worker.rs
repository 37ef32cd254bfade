//! Sync worker.
//!
//! Replays queued operations against the remote store, one at a time, store
//! queue first. Every item is re-read from the queue right before it runs, so
//! remapping done by an earlier item in the same drain is always visible to
//! its dependents. A drain never overlaps another; a trigger that arrives
//! mid-drain is coalesced into a single follow-up pass.

use crate::error::{Result, SyncError};
use crate::events::{Event, EventBus};
use crate::readiness::Readiness;
use crate::remote::{commit_chunked, RemoteError, RemoteStore, Write};
use crate::storage::{OverlayChanges, QueueStore};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tally_engine::{
    Override, PaymentPatch, PaymentRecord, PendingOperation, QueueKind, QueuedOp, RecordId,
    StorePatch, StoreRecord, Touched,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Outcome of the last completed drain pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub committed: usize,
    /// Removed without effect: targets that never reached the remote or
    /// are gone from it.
    pub dropped: usize,
    /// Left queued behind a creator that has not committed yet.
    pub deferred: usize,
    /// Left queued after a remote failure.
    pub failed: usize,
    pub last_error: Option<String>,
    /// Whether every failure was of the kind that clears up on retry.
    pub retryable: bool,
    pub finished_at: DateTime<Utc>,
}

impl DrainReport {
    fn new() -> Self {
        Self {
            committed: 0,
            dropped: 0,
            deferred: 0,
            failed: 0,
            last_error: None,
            retryable: true,
            finished_at: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// What replaying one operation amounted to.
enum Outcome {
    Committed(Commit),
    Dropped(&'static str),
    Deferred,
}

struct Commit {
    remap: Option<(RecordId, RecordId)>,
    overlay: OverlayChanges,
    /// Undoes a create whose operation was cancelled while in flight.
    compensate: Option<PendingOperation>,
}

impl Commit {
    fn overlay(overlay: OverlayChanges) -> Outcome {
        Outcome::Committed(Commit {
            remap: None,
            overlay,
            compensate: None,
        })
    }
}

pub struct SyncWorker {
    queue: Arc<QueueStore>,
    remote: Arc<dyn RemoteStore>,
    bus: EventBus,
    batch_limit: usize,
    gate: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    shutdown: watch::Sender<bool>,
    last_report: Mutex<Option<DrainReport>>,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<QueueStore>,
        remote: Arc<dyn RemoteStore>,
        bus: EventBus,
        batch_limit: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            remote,
            bus,
            batch_limit,
            gate: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            shutdown,
            last_report: Mutex::new(None),
        }
    }

    /// Run the trigger loop in the background. Nothing drains before
    /// `readiness` holds; after that a drain runs on every queue change event
    /// and every `retry_interval` while the queues are not empty.
    pub fn spawn(
        self: &Arc<Self>,
        readiness: Readiness,
        retry_interval: Duration,
    ) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run(readiness, retry_interval).await })
    }

    async fn run(&self, readiness: Readiness, retry_interval: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = readiness.wait() => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }

        let mut events = self.bus.subscribe();
        let mut retry = tokio::time::interval(retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                event = events.recv() => match event {
                    Ok(event) if event.queue().is_none() => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                // The first tick completes immediately, draining whatever a
                // previous run left behind.
                _ = retry.tick() => {
                    if self.queue.is_drained() {
                        continue;
                    }
                }
            }

            if let Err(e) = self.drain().await {
                tracing::error!(error = %e, "Drain aborted");
            }
        }

        tracing::debug!("Sync worker stopped");
    }

    /// Stop scheduling items. An item already in flight completes.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn last_report(&self) -> Option<DrainReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain both queues. Returns `None` when another drain was already
    /// running; that drain then makes one more pass.
    pub async fn drain(&self) -> Result<Option<DrainReport>> {
        let Ok(_gate) = self.gate.try_lock() else {
            self.rerun.store(true, Ordering::SeqCst);
            tracing::debug!("Drain already running, coalescing trigger");
            return Ok(None);
        };

        let report = loop {
            self.rerun.store(false, Ordering::SeqCst);
            let report = self.drain_once().await?;
            if !self.rerun.swap(false, Ordering::SeqCst) || self.is_shutdown() {
                break report;
            }
        };

        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        Ok(Some(report))
    }

    async fn drain_once(&self) -> Result<DrainReport> {
        let mut report = DrainReport::new();
        let mut touched = Touched::default();

        tracing::info!(
            pending_stores = self.queue.len(QueueKind::Stores),
            pending_payments = self.queue.len(QueueKind::Payments),
            "Drain started"
        );

        'kinds: for kind in QueueKind::ALL {
            let op_ids: Vec<String> = self
                .queue
                .peek_all(kind)
                .into_iter()
                .map(|queued| queued.op_id)
                .collect();

            for op_id in op_ids {
                if self.is_shutdown() {
                    break 'kinds;
                }
                // Re-read: remapping may have rewritten it, or it was cancelled.
                let Some(queued) = self.queue.find(kind, &op_id) else {
                    continue;
                };

                match self.replay(&queued.operation).await {
                    Ok(Outcome::Committed(commit)) => {
                        tracing::debug!(
                            op_id = %op_id,
                            op = queued.operation.label(),
                            record_id = %queued.operation.target_id(),
                            store_id = %queued.operation.store_id(),
                            "Operation committed"
                        );
                        touched = touched.union(self.settle(kind, &op_id, commit)?);
                        report.committed += 1;
                    }
                    Ok(Outcome::Dropped(reason)) => {
                        tracing::debug!(
                            op_id = %op_id,
                            op = queued.operation.label(),
                            reason,
                            "Operation dropped"
                        );
                        touched = touched.union(self.discard(kind, &op_id)?);
                        report.dropped += 1;
                    }
                    Ok(Outcome::Deferred) => {
                        report.deferred += 1;
                    }
                    Err(SyncError::Remote(RemoteError::NotFound(id))) => {
                        tracing::warn!(
                            op_id = %op_id,
                            op = queued.operation.label(),
                            record_id = %id,
                            "Target no longer exists remotely, dropping operation"
                        );
                        touched = touched.union(self.discard(kind, &op_id)?);
                        report.dropped += 1;
                    }
                    Err(e @ (SyncError::Remote(_) | SyncError::Engine(_))) => {
                        tracing::warn!(
                            op_id = %op_id,
                            op = queued.operation.label(),
                            record_id = %queued.operation.target_id(),
                            error = %e,
                            "Operation failed, keeping it queued"
                        );
                        report.failed += 1;
                        report.retryable &= e.is_retryable();
                        report.last_error = Some(e.to_string());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        for kind in QueueKind::ALL {
            if touched.includes(kind) {
                self.bus.publish(Event::queue_changed(kind));
            }
        }

        report.finished_at = Utc::now();
        tracing::info!(
            committed = report.committed,
            dropped = report.dropped,
            deferred = report.deferred,
            failed = report.failed,
            "Drain finished"
        );
        Ok(report)
    }

    fn settle(&self, kind: QueueKind, op_id: &str, commit: Commit) -> Result<Touched> {
        let remap = commit.remap.as_ref().map(|(from, to)| (from, to));
        match self.queue.settle(kind, op_id, remap, commit.overlay) {
            Ok(touched) => Ok(touched),
            Err(SyncError::Engine(tally_engine::Error::InvalidQueue(_))) => {
                // Cancelled by a local delete while the commit was in flight.
                let Some(operation) = commit.compensate else {
                    return Ok(Touched::default());
                };
                tracing::warn!(
                    op_id = %op_id,
                    record_id = %operation.target_id(),
                    "Operation cancelled in flight, queueing delete of the created record"
                );
                let queued = QueuedOp::new(crate::new_op_id(), operation, crate::now_millis());
                self.queue.enqueue(queued)
            }
            Err(e) => Err(e),
        }
    }

    fn discard(&self, kind: QueueKind, op_id: &str) -> Result<Touched> {
        match self.queue.settle(kind, op_id, None, OverlayChanges::default()) {
            Err(SyncError::Engine(tally_engine::Error::InvalidQueue(_))) => Ok(Touched::default()),
            other => other,
        }
    }

    async fn replay(&self, operation: &PendingOperation) -> Result<Outcome> {
        match operation {
            PendingOperation::CreateStore { record } => self.create_store(record).await,
            PendingOperation::RenameStore { id, name } => {
                self.update_store(id, StorePatch::name(name.clone())).await
            }
            PendingOperation::RelocateStore { id, location } => {
                self.update_store(id, StorePatch::location(location.clone()))
                    .await
            }
            PendingOperation::DeleteStore { id } => self.delete_store(id).await,
            PendingOperation::CreateOrUpdatePayment { record } => {
                self.upsert_payment(record).await
            }
            PendingOperation::DeletePayment { id, .. } => self.delete_payment(id).await,
        }
    }

    async fn create_store(&self, record: &StoreRecord) -> Result<Outcome> {
        if record.id.is_remote() {
            return Ok(Outcome::Dropped("store already committed"));
        }

        let ids = self
            .remote
            .commit(vec![Write::CreateStore(record.clone())])
            .await?;
        let id = created_id(ids)?;

        let mut created = record.clone();
        created.id = id.clone();
        Ok(Outcome::Committed(Commit {
            remap: Some((record.id.clone(), id.clone())),
            overlay: OverlayChanges::set(id.clone(), Override::CreatedStore(created)),
            compensate: Some(PendingOperation::DeleteStore { id }),
        }))
    }

    async fn update_store(&self, id: &RecordId, patch: StorePatch) -> Result<Outcome> {
        if id.is_local() {
            return Ok(self.behind_creator(id));
        }

        self.remote
            .commit(vec![Write::UpdateStore {
                id: id.clone(),
                patch: patch.clone(),
            }])
            .await?;
        Ok(Commit::overlay(OverlayChanges::set(
            id.clone(),
            Override::Store(patch),
        )))
    }

    async fn delete_store(&self, id: &RecordId) -> Result<Outcome> {
        if id.is_local() {
            return Ok(Outcome::Dropped("store never reached the remote"));
        }

        let payments = self.remote.payments_of(id).await?;
        let mut writes: Vec<Write> = payments.iter().cloned().map(Write::DeletePayment).collect();
        // Last, so a partial failure never strands payments without a store.
        writes.push(Write::DeleteStore(id.clone()));
        commit_chunked(self.remote.as_ref(), writes, self.batch_limit).await?;

        let mut cleared = payments;
        cleared.push(id.clone());
        Ok(Commit::overlay(OverlayChanges::clear(cleared)))
    }

    /// Apply a payment by its `(store, month)` slot. The slot holder wins
    /// over the record's own id: a payment moved onto an occupied month is
    /// folded into the occupant and the superseded record deleted.
    async fn upsert_payment(&self, record: &PaymentRecord) -> Result<Outcome> {
        if record.store_id.is_local() {
            return Ok(self.behind_creator(&record.store_id));
        }

        let slot_holder = self
            .remote
            .find_payment(&record.store_id, record.transaction_month)
            .await?;
        let previous = if record.id.is_remote() {
            self.remote.get_payment(&record.id).await?
        } else {
            None
        };

        let patch = PaymentPatch::from_record(record);
        let mut writes = Vec::new();
        let mut overlay = OverlayChanges::default();

        let canonical = match (slot_holder, previous) {
            (Some(holder), previous) => {
                writes.push(Write::UpdatePayment {
                    id: holder.id.clone(),
                    patch: patch.clone(),
                });
                writes.extend(adjust(
                    &record.store_id,
                    record.payment_amount - holder.payment_amount,
                    0,
                ));
                if let Some(superseded) = previous.filter(|p| p.id != holder.id) {
                    writes.push(Write::DeletePayment(superseded.id.clone()));
                    writes.extend(adjust(&superseded.store_id, -superseded.payment_amount, -1));
                    overlay.clear.push(superseded.id);
                }
                holder.id
            }
            (None, Some(previous)) => {
                writes.push(Write::UpdatePayment {
                    id: previous.id.clone(),
                    patch: patch.clone(),
                });
                writes.extend(adjust(
                    &record.store_id,
                    record.payment_amount - previous.payment_amount,
                    0,
                ));
                previous.id
            }
            (None, None) => {
                writes.push(Write::CreatePayment(record.clone()));
                writes.extend(adjust(&record.store_id, record.payment_amount, 1));
                let id = created_id(self.remote.commit(writes).await?)?;

                let mut created = record.clone();
                created.id = id.clone();
                overlay
                    .set
                    .push((id.clone(), Override::CreatedPayment(created)));
                return Ok(Outcome::Committed(Commit {
                    remap: remap(&record.id, &id),
                    overlay,
                    compensate: Some(PendingOperation::DeletePayment {
                        id,
                        store_id: record.store_id.clone(),
                    }),
                }));
            }
        };

        self.remote.commit(writes).await?;
        overlay
            .set
            .push((canonical.clone(), Override::Payment(patch)));
        Ok(Outcome::Committed(Commit {
            remap: remap(&record.id, &canonical),
            overlay,
            compensate: None,
        }))
    }

    async fn delete_payment(&self, id: &RecordId) -> Result<Outcome> {
        if id.is_local() {
            return Ok(Outcome::Dropped("payment never reached the remote"));
        }
        let Some(payment) = self.remote.get_payment(id).await? else {
            return Ok(Outcome::Dropped("payment already gone remotely"));
        };

        let mut writes = vec![Write::DeletePayment(id.clone())];
        writes.extend(adjust(&payment.store_id, -payment.payment_amount, -1));
        self.remote.commit(writes).await?;

        Ok(Commit::overlay(OverlayChanges::clear(vec![id.clone()])))
    }

    /// An operation on a record whose create has not committed yet waits
    /// for it; with no creator left it can never run.
    fn behind_creator(&self, id: &RecordId) -> Outcome {
        if self.queue.has_store_create(id) {
            Outcome::Deferred
        } else {
            Outcome::Dropped("store was never created remotely")
        }
    }
}

fn created_id(ids: Vec<RecordId>) -> Result<RecordId> {
    ids.into_iter().next().ok_or_else(|| {
        SyncError::Remote(RemoteError::Decode("create returned no id".to_string()))
    })
}

fn remap(from: &RecordId, to: &RecordId) -> Option<(RecordId, RecordId)> {
    (from != to).then(|| (from.clone(), to.clone()))
}

/// Aggregate delta for a store, skipped when it changes nothing.
fn adjust(store_id: &RecordId, revenue: Decimal, entries: i64) -> Option<Write> {
    (!revenue.is_zero() || entries != 0).then(|| Write::AdjustStore {
        id: store_id.clone(),
        revenue,
        entries,
    })
}
