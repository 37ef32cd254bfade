//! End-to-end behavior of the offline write path against the in-process
//! remote store.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tally_engine::{
    Clearance, Month, PaymentDraft, PendingOperation, QueuedOp, RecordId, RemoteSnapshot,
    StoreDraft, StoreRecord,
};
use tally_sync::{
    Config, EventBus, FileBackend, MemoryBackend, MemoryRemote, QueueStore, SyncWorker, Tally,
};

struct Client {
    tally: Arc<Tally>,
    remote: Arc<MemoryRemote>,
}

fn client_with(remote: Arc<MemoryRemote>) -> Client {
    let config = Config::local(std::env::temp_dir());
    let tally = Tally::start(config, MemoryBackend::new(), remote.clone()).unwrap();
    Client { tally, remote }
}

fn client() -> Client {
    client_with(Arc::new(MemoryRemote::new()))
}

fn store_draft(name: &str) -> StoreDraft {
    StoreDraft {
        name: name.into(),
        owner: "Efua".into(),
        location: "Accra".into(),
        ..StoreDraft::default()
    }
}

fn payment_draft(store_id: &RecordId, amount: i64, month: Month) -> PaymentDraft {
    PaymentDraft {
        store_id: store_id.clone(),
        sender_name: "Ama".into(),
        sim_cards_sold: 10,
        payment_amount: Decimal::from(amount),
        status: None,
        transaction_month: month,
        remark: String::new(),
        receipt_collection_date: None,
        clearance: None,
    }
}

/// Drain until both queues are empty.
async fn sync(tally: &Tally) {
    for _ in 0..200 {
        tally.drain_now().await.unwrap();
        let status = tally.status();
        if status.pending_stores + status.pending_payments == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queues did not drain: {:?}", tally.status());
}

/// Wait until the listener delivers a snapshot matching `pred`.
async fn remote_reports(tally: &Tally, pred: impl Fn(&RemoteSnapshot) -> bool) {
    let mut snapshots = tally.snapshots();
    tokio::time::timeout(
        Duration::from_secs(2),
        snapshots.wait_for(|snapshot| snapshot.as_deref().is_some_and(|s| pred(s))),
    )
    .await
    .expect("snapshot never arrived")
    .unwrap();
}

async fn only_store(remote: &MemoryRemote) -> StoreRecord {
    let stores = remote.stores().await;
    assert_eq!(stores.len(), 1, "expected exactly one remote store");
    stores.into_iter().next().unwrap()
}

#[tokio::test]
async fn offline_kiosk_syncs_with_server_ids() {
    let Client { tally, remote } = client();

    let store = tally.create_store(store_draft("Kiosk A")).unwrap();
    assert!(store.id.is_local());
    tally
        .record_payment(payment_draft(&store.id, 5000, Month::March))
        .unwrap();

    let view = tally.view().unwrap();
    let shown = view.store_named("Kiosk A").unwrap();
    assert_eq!(shown.total_revenue, Decimal::from(5000));
    assert!(shown.pending);
    assert_eq!(remote.calls(), 0);

    tally.authenticate();
    sync(&tally).await;

    let server = only_store(&remote).await;
    assert!(server.id.is_remote());
    assert_eq!(server.total_revenue, Decimal::from(5000));
    assert_eq!(server.entries, 1);

    let payments = remote.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].store_id, server.id);

    let status = tally.status();
    assert_eq!((status.pending_stores, status.pending_payments), (0, 0));

    remote_reports(&tally, |s| s.payments.len() == 1).await;
    let view = tally.view().unwrap();
    assert_eq!(view.stores.len(), 1);
    let shown = &view.stores[0];
    assert_eq!(shown.store.id, server.id);
    assert_eq!(shown.payments[0].store_id, server.id);
    assert_eq!(shown.total_revenue, Decimal::from(5000));
}

#[tokio::test]
async fn same_month_twice_leaves_one_payment() {
    let Client { tally, remote } = client();
    tally.authenticate();

    let store = tally.create_store(store_draft("S1")).unwrap();
    sync(&tally).await;
    let store_id = only_store(&remote).await.id;
    remote_reports(&tally, |s| s.stores.len() == 1).await;
    assert_ne!(store_id, store.id);

    tally
        .record_payment(payment_draft(&store_id, 1000, Month::March))
        .unwrap();
    sync(&tally).await;
    tally
        .record_payment(payment_draft(&store_id, 1500, Month::March))
        .unwrap();
    sync(&tally).await;

    let payments = remote.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].payment_amount, Decimal::from(1500));

    let server = only_store(&remote).await;
    assert_eq!(server.total_revenue, Decimal::from(1500));
    assert_eq!(server.entries, 1);
}

#[tokio::test]
async fn replaying_an_upsert_changes_nothing() {
    let remote = Arc::new(MemoryRemote::new());
    let queue = Arc::new(QueueStore::open(MemoryBackend::new()).unwrap());
    let worker = SyncWorker::new(queue.clone(), remote.clone(), EventBus::new(), 400);

    let store = StoreRecord {
        id: RecordId::local("s"),
        name: "Kiosk B".into(),
        owner: String::new(),
        email: String::new(),
        location: String::new(),
        total_revenue: Decimal::ZERO,
        entries: 0,
        created_at: 1,
    };
    queue
        .enqueue(QueuedOp::new("op-1", PendingOperation::CreateStore { record: store }, 1))
        .unwrap();
    worker.drain().await.unwrap();
    let store_id = only_store(&remote).await.id;

    let record = payment_draft(&store_id, 700, Month::June)
        .into_record(RecordId::local("p"), 2)
        .unwrap();
    for op_id in ["op-2", "op-3", "op-4"] {
        queue
            .enqueue(QueuedOp::new(
                op_id,
                PendingOperation::CreateOrUpdatePayment {
                    record: record.clone(),
                },
                2,
            ))
            .unwrap();
        worker.drain().await.unwrap();
    }

    assert_eq!(remote.payments().await.len(), 1);
    let server = only_store(&remote).await;
    assert_eq!(server.total_revenue, Decimal::from(700));
    assert_eq!(server.entries, 1);
    assert!(queue.is_drained());
}

#[tokio::test]
async fn deleting_unsynced_payment_never_reaches_remote() {
    let Client { tally, remote } = client();

    let store = tally.create_store(store_draft("Kiosk C")).unwrap();
    let payment = tally
        .record_payment(payment_draft(&store.id, 250, Month::May))
        .unwrap();
    tally.delete_payment(&payment.id).unwrap();

    let status = tally.status();
    assert_eq!(status.pending_payments, 0);
    assert_eq!(status.pending_stores, 1);
    assert!(tally.view().unwrap().payment(&payment.id).is_none());
    assert_eq!(remote.calls(), 0);

    tally.authenticate();
    sync(&tally).await;
    assert!(remote.payments().await.is_empty());
    assert_eq!(remote.commits(), 1);
}

#[tokio::test]
async fn aggregates_match_payments_after_full_drain() {
    let Client { tally, remote } = client();

    let store = tally.create_store(store_draft("Kiosk D")).unwrap();
    let march = tally
        .record_payment(payment_draft(&store.id, 1200, Month::March))
        .unwrap();
    tally
        .record_payment(payment_draft(&store.id, 800, Month::April))
        .unwrap();
    let may = tally
        .record_payment(payment_draft(&store.id, 300, Month::May))
        .unwrap();

    tally.authenticate();
    sync(&tally).await;
    remote_reports(&tally, |s| s.payments.len() == 3).await;

    // Edit and delete against the now-remote records.
    let view = tally.view().unwrap();
    let shown = view.stores[0].clone();
    let march_id = shown
        .payments
        .iter()
        .find(|p| p.transaction_month == march.transaction_month)
        .unwrap()
        .id
        .clone();
    let may_id = shown
        .payments
        .iter()
        .find(|p| p.transaction_month == may.transaction_month)
        .unwrap()
        .id
        .clone();
    assert!(march_id.is_remote() && may_id.is_remote());

    tally
        .edit_payment(&march_id, payment_draft(&shown.store.id, 2000, Month::March))
        .unwrap();
    tally.delete_payment(&may_id).unwrap();
    sync(&tally).await;
    remote_reports(&tally, |s| s.payments.len() == 2).await;

    let server = only_store(&remote).await;
    let payments = remote.payments().await;
    let sum: Decimal = payments.iter().map(|p| p.payment_amount).sum();
    assert_eq!(server.total_revenue, sum);
    assert_eq!(server.total_revenue, Decimal::from(2800));
    assert_eq!(server.entries, payments.len() as u64);

    let view = tally.view().unwrap();
    assert_eq!(view.stores[0].total_revenue, server.total_revenue);
    let months: Vec<Month> = view.stores[0]
        .payments
        .iter()
        .map(|p| p.transaction_month)
        .collect();
    assert_eq!(months, vec![Month::March, Month::April]);
}

#[tokio::test]
async fn overrides_prune_once_remote_catches_up() {
    let Client { tally, remote } = client();
    tally.authenticate();

    tally.create_store(store_draft("Kiosk E")).unwrap();
    sync(&tally).await;
    let store_id = only_store(&remote).await.id;
    remote_reports(&tally, |s| s.stores.len() == 1).await;

    tally.rename_store(&store_id, "Kiosk E2").unwrap();
    assert_eq!(
        tally.view().unwrap().store(&store_id).unwrap().store.name,
        "Kiosk E2"
    );

    sync(&tally).await;
    remote_reports(&tally, |s| s.stores[0].name == "Kiosk E2").await;

    for _ in 0..200 {
        if tally.status().overrides == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tally.status().overrides, 0);
    assert_eq!(
        tally.view().unwrap().store(&store_id).unwrap().store.name,
        "Kiosk E2"
    );
}

#[tokio::test]
async fn rename_before_first_sync_follows_the_remap() {
    let Client { tally, remote } = client();

    let store = tally.create_store(store_draft("Draft name")).unwrap();
    tally.rename_store(&store.id, "Kiosk F").unwrap();
    tally.relocate_store(&store.id, "Kumasi").unwrap();
    assert_eq!(tally.view().unwrap().stores[0].store.name, "Kiosk F");

    tally.authenticate();
    sync(&tally).await;

    let server = only_store(&remote).await;
    assert_eq!(server.name, "Kiosk F");
    assert_eq!(server.location, "Kumasi");
}

#[tokio::test]
async fn failed_items_stay_queued_until_the_remote_returns() {
    let Client { tally, remote } = client();
    tally.authenticate();
    remote_reports(&tally, |s| s.stores.is_empty()).await;

    remote.set_offline(true);
    tally.create_store(store_draft("Kiosk G")).unwrap();
    let report = loop {
        if let Some(report) = tally.drain_now().await.unwrap() {
            break report;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(report.failed, 1);
    assert!(report.retryable);

    let status = tally.status();
    assert_eq!(status.pending_stores, 1);
    assert!(status.message.unwrap().starts_with("Offline"));
    assert!(tally.view().unwrap().store_named("Kiosk G").is_some());

    remote.set_offline(false);
    sync(&tally).await;
    assert_eq!(only_store(&remote).await.name, "Kiosk G");
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = std::env::temp_dir().join(format!("tally-restart-{}", uuid::Uuid::new_v4()));

    let store_id = {
        let tally = Tally::start(
            Config::local(&dir),
            FileBackend::new(&dir).unwrap(),
            Arc::new(MemoryRemote::new()),
        )
        .unwrap();
        let store = tally.create_store(store_draft("Kiosk H")).unwrap();
        tally
            .record_payment(payment_draft(&store.id, 900, Month::January))
            .unwrap();
        tally.shutdown();
        store.id
    };

    let remote = Arc::new(MemoryRemote::new());
    let tally = Tally::start(
        Config::local(&dir),
        FileBackend::new(&dir).unwrap(),
        remote.clone(),
    )
    .unwrap();
    let status = tally.status();
    assert_eq!((status.pending_stores, status.pending_payments), (1, 1));
    assert!(tally.view().unwrap().store(&store_id).is_some());

    tally.authenticate();
    sync(&tally).await;
    let server = only_store(&remote).await;
    assert_eq!(server.total_revenue, Decimal::from(900));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn two_clients_racing_one_slot_converge() {
    let remote = Arc::new(MemoryRemote::new());
    let first = client_with(remote.clone());
    first.tally.authenticate();
    first.tally.create_store(store_draft("Kiosk I")).unwrap();
    sync(&first.tally).await;
    let store_id = only_store(&remote).await.id;

    let second = client_with(remote.clone());
    second.tally.authenticate();
    remote_reports(&second.tally, |s| s.stores.len() == 1).await;
    remote_reports(&first.tally, |s| s.stores.len() == 1).await;

    first
        .tally
        .record_payment(payment_draft(&store_id, 400, Month::July))
        .unwrap();
    second
        .tally
        .record_payment(payment_draft(&store_id, 650, Month::July))
        .unwrap();
    sync(&first.tally).await;
    sync(&second.tally).await;

    let payments = remote.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].payment_amount, Decimal::from(650));
    let server = only_store(&remote).await;
    assert_eq!(server.total_revenue, Decimal::from(650));
    assert_eq!(server.entries, 1);
}

#[tokio::test]
async fn validation_rejects_before_queueing() {
    let Client { tally, .. } = client();

    assert!(tally.create_store(store_draft("  ")).is_err());
    let store = tally.create_store(store_draft("Kiosk J")).unwrap();
    let err = tally
        .record_payment(payment_draft(&store.id, 0, Month::March))
        .unwrap_err();
    assert!(err.is_validation());

    let missing = tally
        .record_payment(payment_draft(&RecordId::remote("nope"), 10, Month::March))
        .unwrap_err();
    assert!(!missing.is_validation());

    let status = tally.status();
    assert_eq!((status.pending_stores, status.pending_payments), (1, 0));
    assert_eq!(
        tally.view().unwrap().store_named("Kiosk J").unwrap().entries,
        0
    );
}

#[tokio::test]
async fn admin_reset_empties_both_collections() {
    let Client { tally, remote } = client();
    tally.authenticate();

    for name in ["Kiosk K", "Kiosk L"] {
        tally.create_store(store_draft(name)).unwrap();
    }
    sync(&tally).await;
    for store in remote.stores().await {
        tally
            .record_payment(payment_draft(&store.id, 100, Month::August))
            .unwrap();
    }
    sync(&tally).await;
    assert_eq!(remote.payments().await.len(), 2);

    let report = tally.admin_reset().await.unwrap();
    assert_eq!((report.stores, report.transactions), (2, 2));
    assert!(remote.stores().await.is_empty());
    assert!(remote.payments().await.is_empty());
}

#[tokio::test]
async fn deleting_a_collapsed_payment_removes_the_whole_month() {
    let Client { tally, remote } = client();

    let store = tally.create_store(store_draft("Kiosk M")).unwrap();
    let first = tally
        .record_payment(payment_draft(&store.id, 1000, Month::March))
        .unwrap();
    tally
        .record_payment(payment_draft(&store.id, 1500, Month::March))
        .unwrap();

    let view = tally.view().unwrap();
    let shown = view.store(&store.id).unwrap();
    assert_eq!(shown.payments.len(), 1);
    assert_eq!(shown.payments[0].id, first.id);
    assert_eq!(shown.total_revenue, Decimal::from(1500));

    tally.delete_payment(&first.id).unwrap();
    let view = tally.view().unwrap();
    let shown = view.store(&store.id).unwrap();
    assert!(shown.payments.is_empty());
    assert_eq!(shown.total_revenue, Decimal::ZERO);
    assert_eq!(tally.status().pending_payments, 0);

    tally.authenticate();
    sync(&tally).await;
    assert!(remote.payments().await.is_empty());
    let server = only_store(&remote).await;
    assert_eq!(server.total_revenue, Decimal::ZERO);
    assert_eq!(server.entries, 0);
}

#[tokio::test]
async fn clearing_a_receipt_date_reaches_the_remote() {
    let Client { tally, remote } = client();
    tally.authenticate();

    tally.create_store(store_draft("Kiosk N")).unwrap();
    sync(&tally).await;
    let store_id = only_store(&remote).await.id;

    let mut draft = payment_draft(&store_id, 600, Month::March);
    draft.receipt_collection_date = Some("2024-03-05".into());
    draft.clearance = Some(Clearance::Cleared);
    tally.record_payment(draft).unwrap();
    sync(&tally).await;
    remote_reports(&tally, |s| s.payments.len() == 1).await;

    let payment_id = remote.payments().await[0].id.clone();
    tally
        .edit_payment(&payment_id, payment_draft(&store_id, 600, Month::March))
        .unwrap();
    sync(&tally).await;

    let payments = remote.payments().await;
    assert_eq!(payments[0].receipt_collection_date, None);
    assert_eq!(payments[0].clearance, None);

    remote_reports(&tally, |s| {
        s.payments
            .iter()
            .all(|p| p.receipt_collection_date.is_none())
    })
    .await;
    for _ in 0..200 {
        if tally.status().overrides == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let view = tally.view().unwrap();
    let shown = view.payment(&payment_id).unwrap();
    assert_eq!(shown.receipt_collection_date, None);
    assert_eq!(shown.clearance, None);
}

#[tokio::test]
async fn operations_queued_under_a_committed_local_id_still_sync() {
    let remote = Arc::new(MemoryRemote::new());
    let queue = Arc::new(QueueStore::open(MemoryBackend::new()).unwrap());
    let worker = SyncWorker::new(queue.clone(), remote.clone(), EventBus::new(), 400);

    let local = RecordId::local("s");
    let store = store_draft("Kiosk O").into_record(local.clone(), 1).unwrap();
    queue
        .enqueue(QueuedOp::new("op-1", PendingOperation::CreateStore { record: store }, 1))
        .unwrap();
    worker.drain().await.unwrap();
    let server_id = only_store(&remote).await.id;
    assert_eq!(queue.resolve(&local), server_id);

    // Enqueued by a caller that still holds the local id.
    queue
        .enqueue(QueuedOp::new(
            "op-2",
            PendingOperation::RenameStore {
                id: local.clone(),
                name: "Kiosk O2".into(),
            },
            2,
        ))
        .unwrap();
    let record = payment_draft(&local, 250, Month::June)
        .into_record(RecordId::local("p"), 2)
        .unwrap();
    queue
        .enqueue(QueuedOp::new(
            "op-3",
            PendingOperation::CreateOrUpdatePayment { record },
            2,
        ))
        .unwrap();

    let report = worker.drain().await.unwrap().unwrap();
    assert_eq!(report.dropped, 0);
    assert!(queue.is_drained());

    let server = only_store(&remote).await;
    assert_eq!(server.name, "Kiosk O2");
    assert_eq!(server.total_revenue, Decimal::from(250));
    let payments = remote.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].store_id, server_id);
}

#[tokio::test]
async fn stale_local_store_id_still_accepts_edits() {
    let Client { tally, remote } = client();

    let store = tally.create_store(store_draft("Kiosk P")).unwrap();
    tally.authenticate();
    sync(&tally).await;
    let server_id = only_store(&remote).await.id;

    tally.rename_store(&store.id, "Kiosk P2").unwrap();
    tally
        .record_payment(payment_draft(&store.id, 90, Month::May))
        .unwrap();
    sync(&tally).await;

    let server = only_store(&remote).await;
    assert_eq!(server.id, server_id);
    assert_eq!(server.name, "Kiosk P2");
    assert_eq!(server.entries, 1);
}
