//! Edge case tests for tally-engine
//!
//! These tests drive the merger through the situations a flaky connection
//! produces: snapshots lagging behind commits, duplicate writes for one month,
//! deletes of records that never synced, and restarts mid-queue.

use proptest::prelude::*;
use rust_decimal::Decimal;
use tally_engine::{
    Merger, Month, Override, PaymentPatch, PaymentRecord, PendingOperation, QueueKind,
    QueueSnapshot, QueuedOp, RecordId, RemoteSnapshot, StorePatch, StoreRecord,
};

fn store(id: RecordId, name: &str) -> StoreRecord {
    StoreRecord {
        id,
        name: name.to_string(),
        owner: "Efua".to_string(),
        email: String::new(),
        location: "Accra".to_string(),
        total_revenue: Decimal::ZERO,
        entries: 0,
        created_at: 1000,
    }
}

fn payment(id: RecordId, store_id: RecordId, month: Month, amount: i64) -> PaymentRecord {
    PaymentRecord {
        id,
        store_id,
        sender_name: "Ama".to_string(),
        sim_cards_sold: 2,
        payment_amount: Decimal::from(amount),
        status: "completed".to_string(),
        created_at: 2000,
        transaction_month: month,
        remark: String::new(),
        receipt_collection_date: None,
        clearance: None,
    }
}

fn queued(op_id: &str, operation: PendingOperation) -> QueuedOp {
    QueuedOp::new(op_id, operation, 3000)
}

fn upsert(op_id: &str, record: PaymentRecord) -> QueuedOp {
    queued(op_id, PendingOperation::CreateOrUpdatePayment { record })
}

// ============================================================================
// Offline creation
// ============================================================================

#[test]
fn offline_store_and_payment_visible_before_sync() {
    let local_store = RecordId::local("kiosk");
    let mut queue = QueueSnapshot::new();
    queue.enqueue(queued(
        "op-1",
        PendingOperation::CreateStore {
            record: store(local_store.clone(), "Kiosk A"),
        },
    ));
    queue.enqueue(upsert(
        "op-2",
        payment(RecordId::local("p"), local_store.clone(), Month::March, 5000),
    ));

    let view = Merger::new(None, &queue).merge();

    let kiosk = view.store(&local_store).unwrap();
    assert!(kiosk.pending);
    assert_eq!(kiosk.total_revenue, Decimal::from(5000));
    assert_eq!(kiosk.entries, 1);
    assert_eq!(kiosk.payments[0].store_id, local_store);
}

#[test]
fn committed_create_stays_visible_until_snapshot_reports_it() {
    let server_id = RecordId::remote("srv-1");
    let committed = store(server_id.clone(), "Kiosk A");
    let mut queue = QueueSnapshot::new();
    queue.set_override(server_id.clone(), Override::CreatedStore(committed.clone()));

    // Snapshot taken before the commit landed.
    let lagging = RemoteSnapshot::default();
    let view = Merger::new(Some(&lagging), &queue).merge();
    assert!(view.store(&server_id).is_some());
    assert!(view.stale_overrides.is_empty());

    let caught_up = RemoteSnapshot {
        stores: vec![committed],
        payments: Vec::new(),
    };
    let view = Merger::new(Some(&caught_up), &queue).merge();
    assert_eq!(view.stores.len(), 1);
    assert_eq!(view.stale_overrides, vec![server_id]);
}

// ============================================================================
// Uniqueness per store and month
// ============================================================================

#[test]
fn two_pending_writes_for_one_month_collapse() {
    let s1 = RecordId::remote("s-1");
    let remote = RemoteSnapshot {
        stores: vec![store(s1.clone(), "Kiosk A")],
        payments: Vec::new(),
    };
    let mut queue = QueueSnapshot::new();
    queue.enqueue(upsert(
        "op-1",
        payment(RecordId::local("a"), s1.clone(), Month::March, 1000),
    ));
    queue.enqueue(upsert(
        "op-2",
        payment(RecordId::local("b"), s1.clone(), Month::March, 1500),
    ));

    let view = Merger::new(Some(&remote), &queue).merge();
    let kiosk = view.store(&s1).unwrap();

    assert_eq!(kiosk.payments.len(), 1);
    assert_eq!(kiosk.payments[0].id, RecordId::local("a"));
    assert_eq!(kiosk.payments[0].payment_amount, Decimal::from(1500));
    assert_eq!(kiosk.total_revenue, Decimal::from(1500));
}

#[test]
fn pending_write_for_remote_month_edits_remote_payment() {
    let s1 = RecordId::remote("s-1");
    let remote = RemoteSnapshot {
        stores: vec![store(s1.clone(), "Kiosk A")],
        payments: vec![payment(RecordId::remote("p-1"), s1.clone(), Month::May, 800)],
    };
    let mut queue = QueueSnapshot::new();
    queue.enqueue(upsert(
        "op-1",
        payment(RecordId::local("x"), s1.clone(), Month::May, 950),
    ));

    let view = Merger::new(Some(&remote), &queue).merge();
    let kiosk = view.store(&s1).unwrap();

    assert_eq!(kiosk.entries, 1);
    assert_eq!(kiosk.payments[0].id, RecordId::remote("p-1"));
    assert_eq!(kiosk.total_revenue, Decimal::from(950));
}

#[test]
fn payments_sorted_in_calendar_order() {
    let s1 = RecordId::remote("s-1");
    let remote = RemoteSnapshot {
        stores: vec![store(s1.clone(), "Kiosk A")],
        payments: vec![
            payment(RecordId::remote("p-dec"), s1.clone(), Month::December, 1),
            payment(RecordId::remote("p-jan"), s1.clone(), Month::January, 1),
            payment(RecordId::remote("p-aug"), s1.clone(), Month::August, 1),
        ],
    };
    let queue = QueueSnapshot::new();

    let view = Merger::new(Some(&remote), &queue).merge();
    let months: Vec<Month> = view
        .store(&s1)
        .unwrap()
        .payments
        .iter()
        .map(|p| p.transaction_month)
        .collect();
    assert_eq!(months, vec![Month::January, Month::August, Month::December]);
}

// ============================================================================
// Deletes
// ============================================================================

#[test]
fn pending_delete_hides_remote_payment() {
    let s1 = RecordId::remote("s-1");
    let p1 = RecordId::remote("p-1");
    let remote = RemoteSnapshot {
        stores: vec![store(s1.clone(), "Kiosk A")],
        payments: vec![payment(p1.clone(), s1.clone(), Month::June, 400)],
    };
    let mut queue = QueueSnapshot::new();
    queue.enqueue(queued(
        "op-1",
        PendingOperation::DeletePayment {
            id: p1,
            store_id: s1.clone(),
        },
    ));

    let view = Merger::new(Some(&remote), &queue).merge();
    let kiosk = view.store(&s1).unwrap();
    assert!(kiosk.payments.is_empty());
    assert_eq!(kiosk.total_revenue, Decimal::ZERO);
    assert!(kiosk.pending);
}

#[test]
fn deleting_unsynced_store_leaves_nothing() {
    let local_store = RecordId::local("kiosk");
    let mut queue = QueueSnapshot::new();
    queue.enqueue(queued(
        "op-1",
        PendingOperation::CreateStore {
            record: store(local_store.clone(), "Kiosk A"),
        },
    ));
    queue.enqueue(upsert(
        "op-2",
        payment(RecordId::local("p"), local_store.clone(), Month::March, 5000),
    ));
    queue.enqueue(queued(
        "op-3",
        PendingOperation::DeleteStore { id: local_store },
    ));

    assert!(queue.is_drained());
    let view = Merger::new(None, &queue).merge();
    assert!(view.stores.is_empty());
}

// ============================================================================
// Overlay pruning
// ============================================================================

#[test]
fn override_masks_stale_snapshot_then_prunes() {
    let s1 = RecordId::remote("s-1");
    let mut queue = QueueSnapshot::new();
    queue.set_override(s1.clone(), Override::Store(StorePatch::name("Kiosk B")));

    let stale = RemoteSnapshot {
        stores: vec![store(s1.clone(), "Kiosk A")],
        payments: Vec::new(),
    };
    let view = Merger::new(Some(&stale), &queue).merge();
    assert_eq!(view.store(&s1).unwrap().store.name, "Kiosk B");
    assert!(view.stale_overrides.is_empty());

    let fresh = RemoteSnapshot {
        stores: vec![store(s1.clone(), "Kiosk B")],
        payments: Vec::new(),
    };
    let view = Merger::new(Some(&fresh), &queue).merge();
    assert_eq!(view.stale_overrides, vec![s1]);
}

#[test]
fn override_for_superseded_payment_is_pruned() {
    let s1 = RecordId::remote("s-1");
    let gone = RecordId::remote("p-old");
    let mut queue = QueueSnapshot::new();
    queue.set_override(
        gone.clone(),
        Override::Payment(PaymentPatch {
            payment_amount: Some(Decimal::from(300)),
            ..PaymentPatch::default()
        }),
    );

    let remote = RemoteSnapshot {
        stores: vec![store(s1.clone(), "Kiosk A")],
        payments: vec![payment(RecordId::remote("p-keep"), s1, Month::March, 300)],
    };
    let view = Merger::new(Some(&remote), &queue).merge();
    assert_eq!(view.stale_overrides, vec![gone]);
}

#[test]
fn nothing_pruned_before_first_snapshot() {
    let mut queue = QueueSnapshot::new();
    queue.set_override(
        RecordId::remote("s-1"),
        Override::Store(StorePatch::name("Kiosk B")),
    );
    queue.set_override(
        RecordId::local("orphan"),
        Override::Store(StorePatch::name("Ghost")),
    );

    let view = Merger::new(None, &queue).merge();
    assert!(view.stale_overrides.is_empty());
}

#[test]
fn orphaned_local_override_is_pruned() {
    let mut queue = QueueSnapshot::new();
    let orphan = RecordId::local("orphan");
    queue.set_override(orphan.clone(), Override::Store(StorePatch::name("Ghost")));

    let view = Merger::new(Some(&RemoteSnapshot::default()), &queue).merge();
    assert_eq!(view.stale_overrides, vec![orphan]);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn queue_survives_restart_mid_drain() {
    let local_store = RecordId::local("kiosk");
    let server_id = RecordId::remote("srv-7");
    let mut queue = QueueSnapshot::new();
    queue.enqueue(queued(
        "op-1",
        PendingOperation::CreateStore {
            record: store(local_store.clone(), "Kiosk A"),
        },
    ));
    queue.enqueue(upsert(
        "op-2",
        payment(RecordId::local("p"), local_store.clone(), Month::March, 5000),
    ));
    queue
        .settle(QueueKind::Stores, "op-1", Some((&local_store, &server_id)))
        .unwrap();

    let restored = QueueSnapshot::from_json(&queue.to_json().unwrap()).unwrap();
    let op = &restored.find(QueueKind::Payments, "op-2").unwrap().operation;
    assert_eq!(op.store_id(), &server_id);
    assert!(!restored.references(&local_store));
}

// ============================================================================
// Properties
// ============================================================================

fn month_strategy() -> impl Strategy<Value = Month> {
    (0usize..12).prop_map(|index| Month::ALL[index])
}

/// Payments as (store index, month, amount) triples.
fn payment_plan() -> impl Strategy<Value = Vec<(usize, Month, i64)>> {
    prop::collection::vec((0usize..3, month_strategy(), 1i64..10_000), 0..20)
}

proptest! {
    #[test]
    fn prop_totals_match_displayed_payments(
        remote_payments in payment_plan(),
        pending in payment_plan(),
    ) {
        let store_ids: Vec<RecordId> = (0..3).map(|i| RecordId::remote(format!("s-{i}"))).collect();

        let mut remote = RemoteSnapshot {
            stores: store_ids.iter().map(|id| store(id.clone(), "Kiosk")).collect(),
            payments: Vec::new(),
        };
        for (index, (store_index, month, amount)) in remote_payments.into_iter().enumerate() {
            let candidate = payment(
                RecordId::remote(format!("p-{index}")),
                store_ids[store_index].clone(),
                month,
                amount,
            );
            // The remote store holds at most one payment per slot.
            if !remote.payments.iter().any(|p| p.slot() == candidate.slot()) {
                remote.payments.push(candidate);
            }
        }

        let mut queue = QueueSnapshot::new();
        for (index, (store_index, month, amount)) in pending.into_iter().enumerate() {
            queue.enqueue(upsert(
                &format!("op-{index}"),
                payment(
                    RecordId::local(format!("l-{index}")),
                    store_ids[store_index].clone(),
                    month,
                    amount,
                ),
            ));
        }

        let view = Merger::new(Some(&remote), &queue).merge();
        for store_view in &view.stores {
            let sum: Decimal = store_view.payments.iter().map(|p| p.payment_amount).sum();
            prop_assert_eq!(store_view.total_revenue, sum);
            prop_assert_eq!(store_view.entries, store_view.payments.len() as u64);

            let mut months: Vec<Month> =
                store_view.payments.iter().map(|p| p.transaction_month).collect();
            let before = months.len();
            months.dedup();
            prop_assert_eq!(months.len(), before, "one payment per month");
        }
    }

    #[test]
    fn prop_merge_is_repeatable(
        amounts in prop::collection::vec(1i64..10_000, 1..12),
    ) {
        let s1 = RecordId::remote("s-1");
        let remote = RemoteSnapshot {
            stores: vec![store(s1.clone(), "Kiosk A")],
            payments: Vec::new(),
        };
        let mut queue = QueueSnapshot::new();
        for (index, amount) in amounts.into_iter().enumerate() {
            queue.enqueue(upsert(
                &format!("op-{index}"),
                payment(
                    RecordId::local(format!("l-{index}")),
                    s1.clone(),
                    Month::ALL[index % 12],
                    amount,
                ),
            ));
        }

        let first = Merger::new(Some(&remote), &queue).merge();
        let second = Merger::new(Some(&remote), &queue).merge();
        prop_assert_eq!(first, second);
    }
}
