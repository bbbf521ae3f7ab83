//! Persistence gateway.
//!
//! Sits between the session engine and the health store. Writes are
//! at-most-once per summary id from the engine's point of view; the gateway
//! owns idempotent retry, the recent-sessions cache, and the pending/failed
//! buffers. A transient store outage never surfaces to the session
//! lifecycle: the summary is queued and retried in the background.

use crate::session::SessionSummary;
use crate::storage::health_store::{HealthStore, StoreError, StoredId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Retry/backoff policy for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Timeout per write attempt in seconds
    pub attempt_timeout_secs: u64,
    /// In-line attempts before the summary moves to the pending queue
    pub inline_attempts: u32,
    /// First backoff delay between in-line attempts, in milliseconds (doubles each retry)
    pub initial_backoff_ms: u64,
    /// Total attempts (in-line plus background) before a summary is parked as failed
    pub max_total_attempts: u32,
    /// Maximum number of summaries kept in the recent-sessions cache
    pub recent_cache_limit: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 10,
            inline_attempts: 3,
            initial_backoff_ms: 250,
            max_total_attempts: 5,
            recent_cache_limit: 50,
        }
    }
}

/// Errors from `persist`.
#[derive(Debug, Clone, Error)]
pub enum PersistError {
    /// The store was unreachable; the summary is queued for background retry
    #[error("store unavailable after {attempts} attempts: {message}")]
    Transient {
        /// Attempts made before queueing
        attempts: u32,
        /// Last store error message
        message: String,
    },

    /// The summary cannot be encoded; it is parked in the failed buffer
    #[error("malformed summary: {0}")]
    Fatal(String),
}

/// A summary awaiting background retry.
#[derive(Debug, Clone)]
struct PendingSummary {
    summary: SessionSummary,
    attempts: u32,
}

/// Converts completed sessions into durable records.
pub struct PersistenceGateway<S: HealthStore> {
    store: Arc<S>,
    policy: RetryPolicy,
    /// Most-recent-first cache; authoritative for immediate UI feedback
    cache: Mutex<VecDeque<SessionSummary>>,
    /// Summary id -> stored id, for idempotence
    stored: Mutex<BTreeMap<Uuid, StoredId>>,
    /// Summaries awaiting background retry
    pending: Mutex<VecDeque<PendingSummary>>,
    /// Summaries whose retries are exhausted or that failed fatally
    failed: Mutex<Vec<SessionSummary>>,
}

impl<S: HealthStore> PersistenceGateway<S> {
    /// Create a gateway over the given store.
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            cache: Mutex::new(VecDeque::new()),
            stored: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(VecDeque::new()),
            failed: Mutex::new(Vec::new()),
        }
    }

    /// Create a gateway with the default retry policy.
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, RetryPolicy::default())
    }

    /// Persist a summary.
    ///
    /// Idempotent on summary id: a duplicate submit returns the existing
    /// stored id without touching the store. The summary is visible through
    /// `recent_sessions` before the first write attempt completes, so the
    /// just-finished session shows up immediately.
    pub async fn persist(&self, summary: SessionSummary) -> Result<StoredId, PersistError> {
        if let Some(existing) = lock(&self.stored).get(&summary.id).copied() {
            tracing::debug!(id = %summary.id, "summary already persisted");
            return Ok(existing);
        }

        // The stored map is in-memory only; after a restart a resubmitted
        // summary dedupes against the store itself.
        if self.store_contains(summary.id).await {
            tracing::debug!(id = %summary.id, "summary found in store, skipping write");
            let id = summary.id;
            lock(&self.stored).insert(id, id);
            self.cache_insert(summary);
            return Ok(id);
        }

        self.cache_insert(summary.clone());

        let mut backoff = Duration::from_millis(self.policy.initial_backoff_ms);
        let mut last_message = String::new();

        for attempt in 1..=self.policy.inline_attempts {
            match self.try_write(summary.clone()).await {
                Ok(id) => {
                    lock(&self.stored).insert(summary.id, id);
                    tracing::info!(id = %summary.id, attempt, "summary persisted");
                    return Ok(id);
                }
                Err(StoreError::Malformed(message)) => {
                    tracing::error!(id = %summary.id, %message, "fatal persistence error");
                    lock(&self.failed).push(summary);
                    return Err(PersistError::Fatal(message));
                }
                Err(StoreError::Unavailable(message)) => {
                    tracing::warn!(id = %summary.id, attempt, %message, "store unavailable");
                    last_message = message;
                }
            }
            if attempt < self.policy.inline_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        let attempts = self.policy.inline_attempts;
        lock(&self.pending).push_back(PendingSummary {
            summary: summary.clone(),
            attempts,
        });
        tracing::warn!(id = %summary.id, "summary queued for background retry");
        Err(PersistError::Transient {
            attempts,
            message: last_message,
        })
    }

    /// Whether the store already holds this summary. An unreachable store
    /// reads as "not stored"; the write path handles the outage.
    async fn store_contains(&self, id: Uuid) -> bool {
        let store = Arc::clone(&self.store);
        let timeout = Duration::from_secs(self.policy.attempt_timeout_secs);
        let check = tokio::task::spawn_blocking(move || store.contains(id));
        matches!(tokio::time::timeout(timeout, check).await, Ok(Ok(Ok(true))))
    }

    /// One write attempt, bounded by the per-attempt timeout.
    async fn try_write(&self, summary: SessionSummary) -> Result<StoredId, StoreError> {
        let store = Arc::clone(&self.store);
        let timeout = Duration::from_secs(self.policy.attempt_timeout_secs);
        let write = tokio::task::spawn_blocking(move || store.write_summary(&summary));
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(join_err.to_string())),
            Err(_) => Err(StoreError::Unavailable("write attempt timed out".into())),
        }
    }

    /// Retry everything in the pending queue once. Returns how many
    /// summaries were persisted.
    pub async fn flush_pending(&self) -> usize {
        let drained: Vec<PendingSummary> = lock(&self.pending).drain(..).collect();
        if drained.is_empty() {
            return 0;
        }

        let mut persisted = 0;
        for mut entry in drained {
            match self.try_write(entry.summary.clone()).await {
                Ok(id) => {
                    lock(&self.stored).insert(entry.summary.id, id);
                    tracing::info!(id = %entry.summary.id, "queued summary persisted");
                    persisted += 1;
                }
                Err(StoreError::Malformed(message)) => {
                    tracing::error!(id = %entry.summary.id, %message, "fatal persistence error");
                    lock(&self.failed).push(entry.summary);
                }
                Err(StoreError::Unavailable(message)) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.policy.max_total_attempts {
                        tracing::warn!(
                            id = %entry.summary.id,
                            attempts = entry.attempts,
                            "retries exhausted, summary marked failed to save"
                        );
                        lock(&self.failed).push(entry.summary);
                    } else {
                        tracing::debug!(id = %entry.summary.id, %message, "retry failed, re-queued");
                        lock(&self.pending).push_back(entry);
                    }
                }
            }
        }
        persisted
    }

    /// Recent sessions, most-recent-first.
    ///
    /// Served from the in-memory cache; falls back to a read-through of the
    /// store when the cache holds fewer entries than requested. Cached
    /// entries win over store entries with the same id.
    pub fn recent_sessions(&self, limit: usize) -> Vec<SessionSummary> {
        {
            let cache = lock(&self.cache);
            if cache.len() >= limit {
                return cache.iter().take(limit).cloned().collect();
            }
        }

        let from_store = match self.store.read_recent(limit) {
            Ok(summaries) => summaries,
            Err(err) => {
                tracing::warn!(%err, "recent-sessions read-through failed, serving cache");
                return lock(&self.cache).iter().take(limit).cloned().collect();
            }
        };

        let mut cache = lock(&self.cache);
        for summary in from_store {
            if !cache.iter().any(|c| c.id == summary.id) {
                cache.push_back(summary);
            }
        }
        let mut merged: Vec<SessionSummary> = cache.iter().cloned().collect();
        merged.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        cache.truncate(self.policy.recent_cache_limit);
        merged.truncate(limit);
        merged
    }

    /// Summaries whose retries are exhausted, for "failed to save" UI and
    /// manual retry.
    pub fn failed_summaries(&self) -> Vec<SessionSummary> {
        lock(&self.failed).clone()
    }

    /// Move a failed summary back to the pending queue. Returns false when
    /// no failed summary has this id.
    pub fn requeue_failed(&self, id: Uuid) -> bool {
        let mut failed = lock(&self.failed);
        if let Some(index) = failed.iter().position(|s| s.id == id) {
            let summary = failed.remove(index);
            lock(&self.pending).push_back(PendingSummary {
                summary,
                attempts: 0,
            });
            true
        } else {
            false
        }
    }

    /// Number of summaries awaiting background retry.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn cache_insert(&self, summary: SessionSummary) {
        let mut cache = lock(&self.cache);
        cache.retain(|c| c.id != summary.id);
        cache.push_front(summary);
        cache.truncate(self.policy.recent_cache_limit);
    }
}

/// Background retry loop: periodically flushes the pending queue.
pub fn spawn_retry_loop<S: HealthStore>(
    gateway: Arc<PersistenceGateway<S>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if gateway.pending_count() > 0 {
                let persisted = gateway.flush_pending().await;
                if persisted > 0 {
                    tracing::info!(persisted, "background retry flushed summaries");
                }
            }
        }
    })
}

/// Poison-tolerant lock: a panicked holder must not wedge persistence.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::SessionKind;
    use crate::storage::health_store::MemoryHealthStore;
    use chrono::{TimeZone, Utc};

    fn summary_at(hour: u32) -> SessionSummary {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap();
        SessionSummary {
            id: Uuid::new_v4(),
            kind: SessionKind::Running,
            started_at: started,
            ended_at: started + chrono::Duration::minutes(30),
            active_duration: Duration::from_secs(1800),
            total_distance_meters: 5000.0,
            estimated_energy_kcal: 300.0,
            avg_heart_rate: Some(150),
            max_heart_rate: Some(170),
            avg_speed_mps: Some(2.78),
            route: Vec::new(),
            heart_rate_samples: Vec::new(),
            source_metadata: BTreeMap::new(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout_secs: 5,
            inline_attempts: 3,
            initial_backoff_ms: 1,
            max_total_attempts: 5,
            recent_cache_limit: 50,
        }
    }

    #[tokio::test]
    async fn test_persist_and_idempotent_resubmit() {
        let store = Arc::new(MemoryHealthStore::new());
        let gateway = PersistenceGateway::new(Arc::clone(&store), fast_policy());
        let summary = summary_at(10);

        let first = gateway.persist(summary.clone()).await.unwrap();
        let second = gateway.persist(summary.clone()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_inline() {
        let store = Arc::new(MemoryHealthStore::new());
        store.fail_next(2);
        let gateway = PersistenceGateway::new(Arc::clone(&store), fast_policy());

        // Third attempt succeeds
        gateway.persist(summary_at(10)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_inline_attempts_queue_for_background() {
        let store = Arc::new(MemoryHealthStore::new());
        store.fail_next(3);
        let gateway = PersistenceGateway::new(Arc::clone(&store), fast_policy());
        let summary = summary_at(10);

        let err = gateway.persist(summary.clone()).await.unwrap_err();
        assert!(matches!(err, PersistError::Transient { attempts: 3, .. }));
        assert_eq!(gateway.pending_count(), 1);

        // Store recovered; background flush drains the queue
        let persisted = gateway.flush_pending().await;
        assert_eq!(persisted, 1);
        assert_eq!(store.len(), 1);

        // Cache made it visible the whole time
        let recent = gateway.recent_sessions(10);
        assert_eq!(recent[0].id, summary.id);
    }

    #[tokio::test]
    async fn test_retry_ceiling_parks_summary_as_failed() {
        let store = Arc::new(MemoryHealthStore::new());
        store.fail_next(u32::MAX);
        let gateway = PersistenceGateway::new(Arc::clone(&store), fast_policy());
        let summary = summary_at(10);

        let _ = gateway.persist(summary.clone()).await;
        // 3 inline attempts used; two background rounds reach the ceiling of 5
        gateway.flush_pending().await;
        gateway.flush_pending().await;

        assert_eq!(gateway.pending_count(), 0);
        let failed = gateway.failed_summaries();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, summary.id);

        // Manual retry after the store recovers
        store.fail_next(0);
        assert!(gateway.requeue_failed(summary.id));
        assert_eq!(gateway.flush_pending().await, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_dedupes_against_store_across_restart() {
        let store = Arc::new(MemoryHealthStore::new());
        let summary = summary_at(10);
        store.write_summary(&summary).unwrap();

        // Fresh gateway with an empty stored map, as after an engine restart
        let gateway = PersistenceGateway::new(
            Arc::clone(&store),
            RetryPolicy {
                inline_attempts: 1,
                ..fast_policy()
            },
        );
        // A write would fail; the store-level dedupe never issues one
        store.fail_next(1);

        let id = gateway.persist(summary.clone()).await.unwrap();
        assert_eq!(id, summary.id);
        assert_eq!(store.len(), 1);
        assert_eq!(gateway.recent_sessions(10)[0].id, summary.id);
    }

    #[tokio::test]
    async fn test_recent_sessions_read_through() {
        let store = Arc::new(MemoryHealthStore::new());
        let older = summary_at(8);
        let newer = summary_at(12);
        store.write_summary(&older).unwrap();
        store.write_summary(&newer).unwrap();

        // Fresh gateway with an empty cache
        let gateway = PersistenceGateway::new(Arc::clone(&store), fast_policy());
        let recent = gateway.recent_sessions(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, newer.id);
        assert_eq!(recent[1].id, older.id);
    }
}
