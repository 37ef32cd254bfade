//! Persisted queue store.
//!
//! Owns the pending store queue, the pending payment queue and the overlay.
//! Every mutation runs under one lock, is applied to a copy, persisted, and
//! only then becomes visible, so memory never runs ahead of disk.

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tally_engine::{
    Overlay, Override, QueueKind, QueueSnapshot, QueuedOp, RecordId, Touched,
};

/// Name of the durable record holding the overlay.
pub const OVERRIDES_RECORD: &str = "overrides";

/// Durable storage for the three queue records.
pub trait QueueBackend: Send + Sync {
    /// Read all three records. Missing records load as empty.
    fn load(&self) -> Result<QueueSnapshot>;

    /// Write the records `touched` marks.
    fn persist(&self, snapshot: &QueueSnapshot, touched: Touched) -> Result<()>;
}

/// One JSON file per record inside a data directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, record: &str) -> PathBuf {
        self.dir.join(format!("{record}.json"))
    }

    fn read<T: serde::de::DeserializeOwned + Default>(&self, record: &str) -> Result<T> {
        match fs::read(self.path(record)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file and rename, so a crash leaves either
    /// the old or the new contents.
    fn write<T: serde::Serialize>(&self, record: &str, value: &T) -> Result<()> {
        let target = self.path(record);
        let staging = target.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec(value)?)?;
        fs::rename(&staging, &target)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl QueueBackend for FileBackend {
    fn load(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot::from_parts(
            self.read(QueueKind::Stores.record_name())?,
            self.read(QueueKind::Payments.record_name())?,
            self.read::<Overlay>(OVERRIDES_RECORD)?,
        ))
    }

    fn persist(&self, snapshot: &QueueSnapshot, touched: Touched) -> Result<()> {
        for kind in QueueKind::ALL {
            if touched.includes(kind) {
                self.write(kind.record_name(), &snapshot.queue(kind))?;
            }
        }
        if touched.overrides {
            self.write(OVERRIDES_RECORD, &snapshot.overrides)?;
        }
        Ok(())
    }
}

/// Keeps the last persisted snapshot in memory. Sharing one instance
/// between two stores simulates a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    saved: Mutex<QueueSnapshot>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot as last persisted.
    pub fn saved(&self) -> QueueSnapshot {
        lock(&self.saved).clone()
    }
}

impl QueueBackend for MemoryBackend {
    fn load(&self) -> Result<QueueSnapshot> {
        Ok(self.saved())
    }

    fn persist(&self, snapshot: &QueueSnapshot, touched: Touched) -> Result<()> {
        let mut saved = lock(&self.saved);
        for kind in QueueKind::ALL {
            if touched.includes(kind) {
                saved.replace_all(kind, snapshot.queue(kind).to_vec());
            }
        }
        if touched.overrides {
            saved.overrides = snapshot.overrides.clone();
        }
        Ok(())
    }
}

impl<B: QueueBackend + ?Sized> QueueBackend for std::sync::Arc<B> {
    fn load(&self) -> Result<QueueSnapshot> {
        (**self).load()
    }

    fn persist(&self, snapshot: &QueueSnapshot, touched: Touched) -> Result<()> {
        (**self).persist(snapshot, touched)
    }
}

/// Overlay entries written together with a settled operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayChanges {
    /// Cleared before `set` is applied.
    pub clear: Vec<RecordId>,
    pub set: Vec<(RecordId, Override)>,
}

impl OverlayChanges {
    pub fn set(id: RecordId, fields: Override) -> Self {
        Self {
            set: vec![(id, fields)],
            ..Self::default()
        }
    }

    pub fn clear(ids: Vec<RecordId>) -> Self {
        Self {
            clear: ids,
            ..Self::default()
        }
    }
}

/// The single owner of pending operations and overrides.
pub struct QueueStore {
    state: Mutex<QueueSnapshot>,
    backend: Box<dyn QueueBackend>,
}

impl QueueStore {
    /// Load persisted state from `backend`.
    pub fn open(backend: impl QueueBackend + 'static) -> Result<Self> {
        let snapshot = backend.load()?;
        tracing::info!(
            pending_stores = snapshot.len(QueueKind::Stores),
            pending_payments = snapshot.len(QueueKind::Payments),
            overrides = snapshot.overrides.len(),
            "Queue store opened"
        );
        Ok(Self {
            state: Mutex::new(snapshot),
            backend: Box::new(backend),
        })
    }

    pub fn enqueue(&self, op: QueuedOp) -> Result<Touched> {
        self.update(|queue| {
            let touched = queue.enqueue(op);
            Ok((touched, touched))
        })
    }

    /// Copy of the queue of `kind`, in order.
    pub fn peek_all(&self, kind: QueueKind) -> Vec<QueuedOp> {
        lock(&self.state).queue(kind).to_vec()
    }

    /// Replace a queue with the complete remaining set.
    pub fn replace_all(&self, kind: QueueKind, ops: Vec<QueuedOp>) -> Result<()> {
        self.update(|queue| {
            queue.replace_all(kind, ops);
            Ok(((), Touched::queue(kind)))
        })
    }

    pub fn find(&self, kind: QueueKind, op_id: &str) -> Option<QueuedOp> {
        lock(&self.state).find(kind, op_id).cloned()
    }

    /// The id a record is known by now; see [`QueueSnapshot::resolve`].
    pub fn resolve(&self, id: &RecordId) -> RecordId {
        lock(&self.state).resolve(id)
    }

    /// Whether a store create for `id` is still queued.
    pub fn has_store_create(&self, id: &RecordId) -> bool {
        lock(&self.state).has_store_create(id)
    }

    /// Remove a finished operation, apply its id remapping and record its
    /// overlay changes in one durable step.
    pub fn settle(
        &self,
        kind: QueueKind,
        op_id: &str,
        remap: Option<(&RecordId, &RecordId)>,
        changes: OverlayChanges,
    ) -> Result<Touched> {
        self.update(|queue| {
            let mut touched = queue.settle(kind, op_id, remap)?;
            for id in &changes.clear {
                touched.overrides |= queue.clear_override(id);
            }
            for (id, fields) in changes.set {
                queue.set_override(id, fields);
                touched.overrides = true;
            }
            Ok((touched, touched))
        })
    }

    /// Rewrite every reference to `from`.
    pub fn remap(&self, from: &RecordId, to: &RecordId) -> Result<Touched> {
        self.update(|queue| {
            let touched = queue.remap(from, to);
            Ok((touched, touched))
        })
    }

    pub fn set_override(&self, id: RecordId, fields: Override) -> Result<()> {
        self.update(|queue| {
            queue.set_override(id, fields);
            Ok((
                (),
                Touched {
                    overrides: true,
                    ..Touched::default()
                },
            ))
        })
    }

    pub fn clear_override(&self, id: &RecordId) -> Result<bool> {
        self.clear_overrides(std::slice::from_ref(id))
            .map(|cleared| cleared > 0)
    }

    /// Clear several overrides in one write. Returns how many existed.
    pub fn clear_overrides(&self, ids: &[RecordId]) -> Result<usize> {
        self.update(|queue| {
            let cleared = ids.iter().filter(|id| queue.clear_override(id)).count();
            let touched = Touched {
                overrides: cleared > 0,
                ..Touched::default()
            };
            Ok((cleared, touched))
        })
    }

    pub fn overrides(&self) -> Overlay {
        lock(&self.state).overrides.clone()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        lock(&self.state).clone()
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        lock(&self.state).len(kind)
    }

    pub fn is_drained(&self) -> bool {
        lock(&self.state).is_drained()
    }

    fn update<T>(
        &self,
        apply: impl FnOnce(&mut QueueSnapshot) -> Result<(T, Touched)>,
    ) -> Result<T> {
        let mut state = lock(&self.state);
        let mut next = state.clone();
        let (value, touched) = apply(&mut next)?;
        if touched.any() {
            self.backend.persist(&next, touched)?;
        }
        *state = next;
        Ok(value)
    }
}

// A panic while holding the lock cannot leave a half-applied update, since
// updates are built on a copy.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
