//! Remote snapshot listener.
//!
//! Waits for readiness, subscribes to both remote collections and publishes a
//! combined [`RemoteSnapshot`] every time either collection changes. Nothing is
//! published until both collections have reported once, so the merger never
//! sees stores without their payments. A failed subscription is reported and
//! left alone; resubscribing is the owner's call.

use crate::readiness::Readiness;
use crate::remote::{RemoteError, RemoteStore};
use futures::StreamExt;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tally_engine::RemoteSnapshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Latest combined snapshot, `None` until both collections reported.
pub type SnapshotReceiver = watch::Receiver<Option<Arc<RemoteSnapshot>>>;

/// Lifecycle of the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ListenerStatus {
    /// Waiting for readiness.
    Waiting,
    Live,
    Failed(String),
    Stopped,
}

pub struct SnapshotListener {
    snapshots: SnapshotReceiver,
    status: watch::Receiver<ListenerStatus>,
    status_tx: Arc<watch::Sender<ListenerStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotListener {
    /// Start listening in the background once `readiness` holds.
    pub fn spawn(remote: Arc<dyn RemoteStore>, readiness: Readiness) -> Self {
        let (snapshot_tx, snapshots) = watch::channel(None);
        let (status_tx, status) = watch::channel(ListenerStatus::Waiting);
        let status_tx = Arc::new(status_tx);

        let task = {
            let status_tx = Arc::clone(&status_tx);
            tokio::spawn(async move {
                readiness.wait().await;
                if let Err(e) = listen(remote.as_ref(), &snapshot_tx, &status_tx).await {
                    tracing::error!(error = %e, "Remote snapshot subscription failed");
                    status_tx.send_replace(ListenerStatus::Failed(e.to_string()));
                }
            })
        };

        Self {
            snapshots,
            status,
            status_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn snapshots(&self) -> SnapshotReceiver {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> Option<Arc<RemoteSnapshot>> {
        self.snapshots.borrow().clone()
    }

    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    /// Tear the subscription down. Safe to call more than once; returns
    /// whether this call stopped it.
    pub fn unsubscribe(&self) -> bool {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.abort();
                self.status_tx.send_replace(ListenerStatus::Stopped);
                tracing::debug!("Remote snapshot subscription stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for SnapshotListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn listen(
    remote: &dyn RemoteStore,
    snapshot_tx: &watch::Sender<Option<Arc<RemoteSnapshot>>>,
    status_tx: &watch::Sender<ListenerStatus>,
) -> Result<(), RemoteError> {
    let mut stores = remote.watch_stores().await?;
    let mut payments = remote.watch_payments().await?;
    status_tx.send_replace(ListenerStatus::Live);
    tracing::info!("Remote snapshot subscription live");

    let mut latest_stores = None;
    let mut latest_payments = None;
    loop {
        tokio::select! {
            next = stores.next() => match next {
                Some(snapshot) => latest_stores = Some(snapshot?),
                None => return Err(RemoteError::Unavailable("stores subscription closed".into())),
            },
            next = payments.next() => match next {
                Some(snapshot) => latest_payments = Some(snapshot?),
                None => {
                    return Err(RemoteError::Unavailable(
                        "transactions subscription closed".into(),
                    ))
                }
            },
        }

        if let (Some(stores), Some(payments)) = (&latest_stores, &latest_payments) {
            let snapshot = RemoteSnapshot {
                stores: Vec::clone(stores),
                payments: Vec::clone(payments),
            };
            tracing::debug!(
                stores = snapshot.stores.len(),
                payments = snapshot.payments.len(),
                "Remote snapshot received"
            );
            snapshot_tx.send_replace(Some(Arc::new(snapshot)));
        }
    }
}
