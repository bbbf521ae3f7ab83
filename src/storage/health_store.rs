//! Health store seam.
//!
//! The platform health data store is an external collaborator; the engine
//! only needs a write path for finished summaries and a read path for
//! history. `SqliteHealthStore` (see `storage::database`) is the shipped
//! durable implementation; `MemoryHealthStore` backs tests and previews.

use crate::session::SessionSummary;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a stored summary record.
pub type StoredId = Uuid;

/// Errors from a health store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store cannot be reached right now; the write may succeed later
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The summary cannot be encoded; retrying will not help
    #[error("malformed summary: {0}")]
    Malformed(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

/// Write/read access to the durable session record store.
///
/// `write_summary` must be idempotent on the summary id: submitting the same
/// summary twice yields one stored record and the same id both times.
pub trait HealthStore: Send + Sync + 'static {
    /// Write a summary, returning its stored id.
    fn write_summary(&self, summary: &SessionSummary) -> Result<StoredId, StoreError>;

    /// Read the most recent summaries, most-recent-first by start time.
    fn read_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError>;

    /// Whether a summary with this id is already stored.
    fn contains(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// In-memory health store.
///
/// Supports failure injection so retry behavior can be exercised: the next
/// `fail_next(n)` writes return `Unavailable`.
#[derive(Default)]
pub struct MemoryHealthStore {
    records: Mutex<Vec<SessionSummary>>,
    failures_remaining: AtomicU32,
}

impl MemoryHealthStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HealthStore for MemoryHealthStore {
    fn write_summary(&self, summary: &SessionSummary) -> Result<StoredId, StoreError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected failure".into()));
        }

        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("record lock poisoned".into()))?;
        if !records.iter().any(|r| r.id == summary.id) {
            records.push(summary.clone());
        }
        Ok(summary.id)
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("record lock poisoned".into()))?;
        let mut out: Vec<SessionSummary> = records.clone();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }

    fn contains(&self, id: Uuid) -> Result<bool, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("record lock poisoned".into()))?;
        Ok(records.iter().any(|r| r.id == id))
    }
}
