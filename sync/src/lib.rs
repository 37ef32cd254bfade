//! # Tally sync runtime
//!
//! Offline-first write path for the Tally field app. Local mutations are
//! validated, queued durably and shown immediately; a background worker
//! replays them against the remote document store once a session is
//! established, and a snapshot listener keeps the reconciled view current.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally_engine::StoreDraft;
//! use tally_sync::{Config, FileBackend, MemoryRemote, Tally};
//!
//! # async fn run() -> tally_sync::Result<()> {
//! let config = Config::local("./tally-data");
//! let backend = FileBackend::new(&config.data_dir)?;
//! let tally = Tally::start(config, backend, Arc::new(MemoryRemote::new()))?;
//!
//! tally.create_store(StoreDraft {
//!     name: "Kiosk A".into(),
//!     ..StoreDraft::default()
//! })?;
//! tally.authenticate();
//! tally.drain_now().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod readiness;
pub mod remote;
pub mod storage;
pub mod worker;

pub use client::{ResetReport, Status, Tally};
pub use config::{Config, ConfigError, MAX_BATCH_WRITES};
pub use error::{Result, SyncError};
pub use events::{Event, EventBus};
pub use listener::{ListenerStatus, SnapshotListener};
pub use readiness::Readiness;
pub use remote::{Collection, MemoryRemote, PgRemote, RemoteError, RemoteStore, Write};
pub use storage::{FileBackend, MemoryBackend, OverlayChanges, QueueBackend, QueueStore};
pub use worker::{DrainReport, SyncWorker};

/// Wall-clock milliseconds, the unit of every record timestamp.
pub(crate) fn now_millis() -> tally_engine::Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub(crate) fn new_op_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
