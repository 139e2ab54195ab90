//! Adapter statistics.
//!
//! `AdapterStats` is a set of monotonically increasing atomic counters shared through an
//! `Arc`. The adapter, the anonymizer and the background driver all hold the same handle,
//! which is injected at construction. Readers take an `AdapterStatsSnapshot`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct AdapterStats {
    primary_writes: AtomicU64,
    remote_writes: AtomicU64,
    remote_failures: AtomicU64,
    pii_instances_anonymized: AtomicU64,
    sessions_archived: AtomicU64,
    bytes_archived: AtomicU64,
    remote_writes_deferred: AtomicU64,
    queue_full_rejections: AtomicU64,
    retries_exhausted: AtomicU64,
    sessions_evicted: AtomicU64,
    entries_spilled: AtomicU64,
    entries_lost: AtomicU64,
}

/// Point-in-time copy of the counters, plus the current queue depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStatsSnapshot {
    pub primary_writes: u64,
    pub remote_writes: u64,
    pub remote_failures: u64,
    pub pii_instances_anonymized: u64,
    pub sessions_archived: u64,
    pub bytes_archived: u64,
    /// Vault writes handed to the retry queue instead of completing inline
    pub remote_writes_deferred: u64,
    pub queue_full_rejections: u64,
    /// Queued operations dropped after `max_retries` or a non-retryable error
    pub retries_exhausted: u64,
    pub sessions_evicted: u64,
    /// Queue entries written to the spill file at shutdown
    pub entries_spilled: u64,
    /// Queue entries that could be neither archived nor spilled
    pub entries_lost: u64,
    pub queue_depth: usize,
}

impl AdapterStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record_primary_write(&self) {
        self.primary_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_write(&self, bytes: u64) {
        self.remote_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_archived.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pii_anonymized(&self, count: u64) {
        if count > 0 {
            self.pii_instances_anonymized
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_session_archived(&self) {
        self.sessions_archived.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self) {
        self.remote_writes_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_full(&self) {
        self.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spilled(&self, count: u64) {
        self.entries_spilled.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self, count: u64) {
        self.entries_lost.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot without queue information; the adapter fills in `queue_depth`.
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            primary_writes: self.primary_writes.load(Ordering::Relaxed),
            remote_writes: self.remote_writes.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            pii_instances_anonymized: self.pii_instances_anonymized.load(Ordering::Relaxed),
            sessions_archived: self.sessions_archived.load(Ordering::Relaxed),
            bytes_archived: self.bytes_archived.load(Ordering::Relaxed),
            remote_writes_deferred: self.remote_writes_deferred.load(Ordering::Relaxed),
            queue_full_rejections: self.queue_full_rejections.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            entries_spilled: self.entries_spilled.load(Ordering::Relaxed),
            entries_lost: self.entries_lost.load(Ordering::Relaxed),
            queue_depth: 0,
        }
    }
}
