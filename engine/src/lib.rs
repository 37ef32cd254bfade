//! # Tally Engine
//!
//! The offline write-queue and reconciliation core for Tally.
//!
//! Field staff record stores and monthly payments on devices that are often
//! offline. Every mutation is queued locally and replayed against the remote
//! document store later. This crate holds the pieces of that process that do
//! not touch IO, so the same rules run in the sync service and, through
//! [`ffi`], inside mobile clients.
//!
//! ## Design Principles
//!
//! - **No IO**: storage, network and scheduling live in `tally-sync`
//! - **Deterministic**: merging the same inputs always yields the same view
//! - **Explicit identity**: [`RecordId`] is either `Local` or `Remote`
//!
//! ## Core Concepts
//!
//! ### Pending operations
//!
//! A [`PendingOperation`] carries everything needed to replay a mutation.
//! Store operations and payment operations live in separate queues of a
//! [`QueueSnapshot`], which also enforces the cancellation rules for deletes
//! of records that never reached the remote and remaps local ids once a create
//! commits.
//!
//! ### Overlay
//!
//! The [`Overlay`] maps record ids to the fields a local mutation most recently
//! set. It masks remote snapshots that have not caught up and is pruned once
//! they do.
//!
//! ### Merging
//!
//! The [`Merger`] combines the latest [`RemoteSnapshot`] with the queues and
//! the overlay into a [`MergedView`]. Payments are unique per store and month;
//! a pending upsert for an occupied month edits the existing payment.
//!
//! ## Quick Start
//!
//! ```rust
//! use tally_engine::{
//!     Merger, Month, PaymentDraft, PendingOperation, QueueSnapshot, QueuedOp, RecordId,
//!     RemoteSnapshot, StoreDraft,
//! };
//! use rust_decimal::Decimal;
//!
//! let mut queue = QueueSnapshot::new();
//!
//! let store_id = RecordId::local("kiosk-a");
//! let store = StoreDraft {
//!     name: "Kiosk A".into(),
//!     ..StoreDraft::default()
//! }
//! .into_record(store_id.clone(), 1_706_745_600_000)
//! .unwrap();
//! queue.enqueue(QueuedOp::new(
//!     "op-1",
//!     PendingOperation::CreateStore { record: store },
//!     1_706_745_600_000,
//! ));
//!
//! let payment = PaymentDraft {
//!     store_id: store_id.clone(),
//!     sender_name: "Ama".into(),
//!     sim_cards_sold: 4,
//!     payment_amount: Decimal::from(5000),
//!     status: None,
//!     transaction_month: Month::March,
//!     remark: String::new(),
//!     receipt_collection_date: None,
//!     clearance: None,
//! }
//! .into_record(RecordId::local("pay-1"), 1_706_745_600_000)
//! .unwrap();
//! queue.enqueue(QueuedOp::new(
//!     "op-2",
//!     PendingOperation::CreateOrUpdatePayment { record: payment },
//!     1_706_745_600_000,
//! ));
//!
//! let view = Merger::new(Some(&RemoteSnapshot::default()), &queue).merge();
//! let kiosk = view.store(&store_id).unwrap();
//! assert_eq!(kiosk.total_revenue, Decimal::from(5000));
//! assert_eq!(kiosk.entries, 1);
//! assert!(kiosk.pending);
//! ```
//!
//! ## Persistence
//!
//! [`QueueSnapshot`] serializes to the three durable records the sync layer
//! keeps (`pendingStores`, `pendingPayments`, `overrides`).

pub mod error;
pub mod ffi;
pub mod id;
pub mod merge;
pub mod month;
pub mod operation;
pub mod overlay;
pub mod queue;
pub mod record;
pub mod validate;

pub use error::{Error, Result};
pub use id::{RecordId, LOCAL_PREFIX};
pub use merge::{MergedView, Merger, RemoteSnapshot, StoreView};
pub use month::Month;
pub use operation::{OperationId, PendingOperation, QueueKind, QueuedOp};
pub use overlay::{Overlay, Override, RemoteRecord};
pub use queue::{QueueSnapshot, Touched};
pub use record::{Clearance, PaymentPatch, PaymentRecord, StorePatch, StoreRecord};
pub use validate::{PaymentDraft, StoreDraft, DEFAULT_STATUS};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
