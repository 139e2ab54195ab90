//! Dual-storage adapter.
//!
//! `DualStorageAdapter` implements the primary storage contract and fans writes out to the
//! remote vault according to `StorageMode`:
//! - the primary write always happens first and its errors reach the caller unchanged,
//! - anything leaving for the vault goes through the PII anonymizer,
//! - failed vault writes land in the bounded retry queue, which the background
//!   `ArchivalDriver` and `flush_archival_queue` drain.
//!
//! Vault calls are bounded per attempt by `timeout_seconds` and in aggregate by a semaphore
//! of `max_concurrent_ops` permits. Work that escapes the caller (DualAsync mirrors and
//! Immediate-trigger archives) is tracked so `shutdown` can wait for it.

mod driver;

use crate::anonymization::PiiAnonymizer;
use crate::config::{ArchivalTrigger, StorageConfig, StorageMode};
use crate::error::{
    AdapterError, AdapterResult, StorageError, StorageResult, VaultError, VaultResult,
};
use crate::policy::{ArchivalEvent, ArchivalPolicyEngine, ArchivalState, SessionState};
use crate::queue::{spill, ArchivalQueue, FailureOutcome};
use crate::stats::{AdapterStats, AdapterStatsSnapshot};
use crate::storage_backends::StorageBackend;
use crate::types::{
    ArchiveEntry, ArchiveId, ArchiveKind, Direction, GraphEdge, GraphNode, SessionId,
    StorageStats, UNSCOPED_SESSION,
};
use crate::vault::{HttpVaultClient, VaultClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use driver::ArchivalDriver;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const WRITE_SEQ_KEY: &str = "write_seq";

/// Result of an archive request that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Archived {
        archive_id: ArchiveId,
    },
    /// The vault write failed and the session now waits in the retry queue.
    Deferred {
        session_id: SessionId,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
}

impl ArchiveOutcome {
    pub fn archive_id(&self) -> Option<&str> {
        match self {
            ArchiveOutcome::Archived { archive_id } => Some(archive_id),
            ArchiveOutcome::Deferred { .. } => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, ArchiveOutcome::Deferred { .. })
    }
}

/// A queued operation dropped for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermanentFailure {
    pub session_id: SessionId,
    pub kind: ArchiveKind,
    pub attempts: u32,
    pub error: String,
}

/// What one pass over the retry queue did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Archive ids acknowledged during the pass, in attempt order
    pub archive_ids: Vec<ArchiveId>,
    /// Operations that failed again and were re-queued
    pub requeued: usize,
    pub permanent_failures: Vec<PermanentFailure>,
    /// Operations not attempted (held behind an older operation of their session, claimed
    /// elsewhere, or cut off by a deadline)
    pub skipped: usize,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.archive_ids.extend(other.archive_ids);
        self.requeued += other.requeued;
        self.permanent_failures.extend(other.permanent_failures);
        self.skipped += other.skipped;
    }
}

/// Outcome of archiving several sessions in one vault request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchArchiveReport {
    pub archived: Vec<(SessionId, ArchiveId)>,
    pub deferred: Vec<SessionId>,
    pub failed: Vec<(SessionId, String)>,
}

/// One scheduler iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub batch: BatchArchiveReport,
    pub retries: FlushReport,
    pub evicted: Vec<SessionId>,
    /// Set when eviction stopped on a primary error; the rest of the tick still ran
    pub eviction_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub flushed: FlushReport,
    /// Queue entries written to the spill file
    pub spilled: usize,
    /// Queue entries that could be neither archived nor spilled
    pub lost: usize,
    /// Background vault writes still running when the deadline passed
    pub abandoned_tasks: usize,
}

#[derive(Debug, Default)]
struct TaskTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl TaskTracker {
    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// `archive` serializes archive attempts and queue retries of a session. Primary writes
/// share `primary`; deleting the session's primary data takes it exclusively.
#[derive(Debug, Default)]
struct SessionLock {
    archive: AsyncMutex<()>,
    primary: RwLock<()>,
}

pub(crate) struct AdapterInner {
    config: StorageConfig,
    primary: Arc<dyn StorageBackend>,
    vault: Arc<dyn VaultClient>,
    anonymizer: PiiAnonymizer,
    policy: ArchivalPolicyEngine,
    queue: ArchivalQueue,
    stats: Arc<AdapterStats>,
    sessions: DashMap<SessionId, SessionState>,
    session_locks: DashMap<SessionId, Arc<SessionLock>>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    shutting_down: AtomicBool,
}

/// Drop-in replacement for a primary `StorageBackend` that also archives to a vault.
pub struct DualStorageAdapter {
    inner: Arc<AdapterInner>,
    driver: std::sync::Mutex<Option<ArchivalDriver>>,
}

impl std::fmt::Debug for DualStorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualStorageAdapter")
            .field("storage_mode", &self.inner.config.storage_mode)
            .field("enabled", &self.inner.config.enabled)
            .field("queue_depth", &self.inner.queue.len())
            .finish()
    }
}

impl DualStorageAdapter {
    /// Validate the configuration and assemble the adapter. No background task is started;
    /// see [`DualStorageAdapter::start`]. A spill file left by a previous shutdown is loaded
    /// back into the retry queue and removed.
    pub fn new(
        config: StorageConfig,
        primary: Arc<dyn StorageBackend>,
        vault: Arc<dyn VaultClient>,
        stats: Arc<AdapterStats>,
    ) -> AdapterResult<Self> {
        config.validate().map_err(AdapterError::InvalidConfig)?;
        let anonymizer = PiiAnonymizer::new(&config.anonymization, &config.encryption)
            .map_err(|e| AdapterError::InvalidConfig(vec![e]))?;
        let queue = ArchivalQueue::from_config(&config.performance);
        let permits = Arc::new(Semaphore::new(
            config.performance.max_concurrent_ops as usize,
        ));
        let inner = Arc::new(AdapterInner {
            policy: ArchivalPolicyEngine::new(config.archival_policy.clone()),
            config,
            primary,
            vault,
            anonymizer,
            queue,
            stats,
            sessions: DashMap::new(),
            session_locks: DashMap::new(),
            permits,
            tasks: TaskTracker::default(),
            shutting_down: AtomicBool::new(false),
        });
        inner.reload_spill()?;
        Ok(Self {
            inner,
            driver: std::sync::Mutex::new(None),
        })
    }

    /// `new` plus the background archival driver. Must be called inside a tokio runtime.
    pub fn start(
        config: StorageConfig,
        primary: Arc<dyn StorageBackend>,
        vault: Arc<dyn VaultClient>,
        stats: Arc<AdapterStats>,
    ) -> AdapterResult<Self> {
        let adapter = Self::new(config, primary, vault, stats)?;
        adapter.spawn_driver();
        Ok(adapter)
    }

    /// Build the HTTP vault client from the configuration and start the adapter.
    pub fn from_config(
        config: StorageConfig,
        primary: Arc<dyn StorageBackend>,
    ) -> AdapterResult<Self> {
        config.validate().map_err(AdapterError::InvalidConfig)?;
        let vault = HttpVaultClient::from_config(&config)
            .map_err(|e| AdapterError::InvalidConfig(vec![e.to_string()]))?;
        Self::start(config, primary, Arc::new(vault), AdapterStats::new())
    }

    /// Start the background driver if archival is active and it is not running yet.
    pub fn spawn_driver(&self) {
        if !self.inner.config.archival_active() {
            return;
        }
        let mut slot = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(ArchivalDriver::spawn(self.inner.clone()));
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn anonymizer(&self) -> &PiiAnonymizer {
        &self.inner.anonymizer
    }

    pub async fn store_node(&self, node: GraphNode) -> AdapterResult<()> {
        let session_id = node
            .session_id
            .clone()
            .unwrap_or_else(|| UNSCOPED_SESSION.to_string());
        let mirror = self.inner.mirror_payload(&node)?;
        let archive_now = self
            .inner
            .write_primary(&session_id, self.inner.primary.store_node(node))
            .await?;
        self.inner
            .after_primary_write(session_id, ArchiveKind::NodeMirror, mirror, archive_now)
            .await
    }

    pub async fn store_edge(&self, edge: GraphEdge) -> AdapterResult<()> {
        let session_id = edge
            .session_id
            .clone()
            .unwrap_or_else(|| UNSCOPED_SESSION.to_string());
        let mirror = self.inner.mirror_payload(&edge)?;
        let archive_now = self
            .inner
            .write_primary(&session_id, self.inner.primary.store_edge(edge))
            .await?;
        self.inner
            .after_primary_write(session_id, ArchiveKind::EdgeMirror, mirror, archive_now)
            .await
    }

    pub async fn get_node(&self, id: &str) -> AdapterResult<Option<GraphNode>> {
        let node = self.inner.primary.get_node(id).await?;
        if let Some(session_id) = node.as_ref().and_then(|n| n.session_id.as_deref()) {
            self.inner.touch_access(session_id);
        }
        Ok(node)
    }

    pub async fn get_edges(&self, node_id: &str, direction: Direction) -> AdapterResult<Vec<GraphEdge>> {
        Ok(self.inner.primary.get_edges(node_id, direction).await?)
    }

    pub async fn get_session_data(&self, session_id: &SessionId) -> AdapterResult<Value> {
        let data = self.inner.primary.get_session_data(session_id).await?;
        self.inner.touch_access(session_id);
        Ok(data)
    }

    /// Delete a session from the primary tier. Archived copies are untouched.
    pub async fn delete_session_data(&self, session_id: &SessionId) -> AdapterResult<()> {
        let inner = &self.inner;
        {
            let lock = inner.session_lock(session_id);
            let _exclusive = lock.primary.write().await;
            inner.primary.delete_session_data(session_id).await?;
            inner.sessions.remove(session_id);
        }
        inner.prune_session_lock(session_id);
        Ok(())
    }

    /// Archive a whole session now, whatever the trigger says.
    pub async fn archive_session(&self, session_id: &str) -> AdapterResult<ArchiveOutcome> {
        self.inner.ensure_active()?;
        self.inner.archive_session(session_id).await
    }

    /// Archive several sessions through one batch request per `batch_size` chunk.
    pub async fn archive_sessions(&self, session_ids: &[SessionId]) -> AdapterResult<BatchArchiveReport> {
        self.inner.ensure_active()?;
        Ok(self.inner.archive_batch(session_ids).await)
    }

    /// Mark a session closed and raise the session-end trigger. Returns the archival
    /// outcome when the policy archived the session.
    pub async fn close_session(&self, session_id: &str) -> AdapterResult<Option<ArchiveOutcome>> {
        if !self.inner.config.archival_active() {
            return Ok(None);
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AdapterError::ShuttingDown);
        }
        let due = {
            let now = Utc::now();
            // Nothing was written to an unknown session, so there is nothing to archive.
            let Some(mut state) = self.inner.sessions.get_mut(session_id) else {
                return Ok(None);
            };
            state.closed = true;
            self.inner.config.storage_mode == StorageMode::ArchiveOnPolicy
                && self
                    .inner
                    .policy
                    .should_archive_now(&state, ArchivalEvent::SessionEnd, now)
        };
        if !due {
            return Ok(None);
        }
        debug!("[DualStorage] session {} closed, archiving", session_id);
        self.inner.archive_session(session_id).await.map(Some)
    }

    pub async fn retrieve_archived_session(&self, archive_id: &str) -> AdapterResult<ArchiveEntry> {
        self.inner.ensure_active()?;
        let inner = &self.inner;
        Ok(inner.with_permit(inner.vault.retrieve(archive_id)).await?)
    }

    pub async fn delete_archived_session(&self, archive_id: &str) -> AdapterResult<()> {
        self.inner.ensure_active()?;
        let inner = &self.inner;
        Ok(inner.with_permit(inner.vault.delete(archive_id)).await?)
    }

    pub async fn apply_retention_policy(&self, archive_id: &str, policy_id: &str) -> AdapterResult<()> {
        self.inner.ensure_active()?;
        let inner = &self.inner;
        Ok(inner
            .with_permit(inner.vault.apply_retention_policy(archive_id, policy_id))
            .await?)
    }

    pub async fn health_check(&self) -> AdapterResult<bool> {
        self.inner.ensure_active()?;
        let inner = &self.inner;
        Ok(inner.with_permit(inner.vault.health_check()).await?)
    }

    /// Attempt every queued operation now, oldest first, ignoring backoff.
    pub async fn flush_archival_queue(&self) -> AdapterResult<FlushReport> {
        self.inner.ensure_active()?;
        let ids = self.inner.queue.pending_ids();
        Ok(self.inner.drain(ids, None).await)
    }

    /// One scheduler iteration: scheduled/age-based batch, due retries, evictions.
    pub async fn run_archival_tick(&self) -> AdapterResult<TickReport> {
        self.inner.ensure_active()?;
        Ok(self.inner.run_tick().await)
    }

    /// Remove archived sessions from the primary tier once their retention has passed.
    pub async fn evict_expired_sessions(&self) -> AdapterResult<Vec<SessionId>> {
        self.inner.ensure_active()?;
        let mut evicted = Vec::new();
        self.inner.evict_expired(&mut evicted).await?;
        Ok(evicted)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.inner.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn get_stats(&self) -> AdapterStatsSnapshot {
        let mut snapshot = self.inner.stats.snapshot();
        snapshot.queue_depth = self.inner.queue.len();
        snapshot
    }

    /// Wait until every background vault write has finished.
    pub async fn wait_for_background_tasks(&self) {
        self.inner.tasks.wait_idle().await;
    }

    /// Stop accepting archival work, stop the driver, wait for background writes, then flush
    /// the queue until `deadline` passes. Whatever is left is written to the spill file or
    /// counted as lost.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let until = Instant::now() + deadline;
        inner.shutting_down.store(true, Ordering::SeqCst);
        info!("[DualStorage] Shutting down (deadline {:?})", deadline);

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(driver) = driver {
            driver.stop(until).await;
        }

        let mut report = ShutdownReport::default();
        if tokio::time::timeout_at(until, inner.tasks.wait_idle())
            .await
            .is_err()
        {
            report.abandoned_tasks = inner.tasks.active();
            warn!(
                "[DualStorage] {} background vault writes still running at shutdown deadline",
                report.abandoned_tasks
            );
        }

        if inner.config.archival_active() {
            let ids = inner.queue.pending_ids();
            report.flushed = inner.drain(ids, Some(until)).await;
        }

        let remaining = inner.queue.drain_all();
        if remaining.is_empty() {
            return report;
        }
        let count = remaining.len();
        match &inner.config.performance.spill_path {
            Some(path) => match spill::write_spill(path, &remaining) {
                Ok(()) => {
                    inner.stats.record_spilled(count as u64);
                    report.spilled = count;
                    info!(
                        "[DualStorage] Spilled {} pending archival operations to {}",
                        count,
                        path.display()
                    );
                }
                Err(e) => {
                    inner.stats.record_lost(count as u64);
                    report.lost = count;
                    error!(
                        "[DualStorage] Failed to write spill file {}: {}; {} archival operations lost",
                        path.display(),
                        e,
                        count
                    );
                }
            },
            None => {
                inner.stats.record_lost(count as u64);
                report.lost = count;
                error!(
                    "[DualStorage] No spill path configured; {} pending archival operations lost",
                    count
                );
            }
        }
        report
    }
}

#[async_trait]
impl StorageBackend for DualStorageAdapter {
    async fn store_node(&self, node: GraphNode) -> StorageResult<()> {
        DualStorageAdapter::store_node(self, node)
            .await
            .map_err(AdapterError::into_storage_error)
    }

    async fn store_edge(&self, edge: GraphEdge) -> StorageResult<()> {
        DualStorageAdapter::store_edge(self, edge)
            .await
            .map_err(AdapterError::into_storage_error)
    }

    async fn get_node(&self, id: &str) -> StorageResult<Option<GraphNode>> {
        DualStorageAdapter::get_node(self, id)
            .await
            .map_err(AdapterError::into_storage_error)
    }

    async fn get_edges(&self, node_id: &str, direction: Direction) -> StorageResult<Vec<GraphEdge>> {
        DualStorageAdapter::get_edges(self, node_id, direction)
            .await
            .map_err(AdapterError::into_storage_error)
    }

    async fn get_session_data(&self, session_id: &SessionId) -> StorageResult<Value> {
        DualStorageAdapter::get_session_data(self, session_id)
            .await
            .map_err(AdapterError::into_storage_error)
    }

    async fn delete_session_data(&self, session_id: &SessionId) -> StorageResult<()> {
        DualStorageAdapter::delete_session_data(self, session_id)
            .await
            .map_err(AdapterError::into_storage_error)
    }

    async fn stats(&self) -> StorageStats {
        self.inner.primary.stats().await
    }
}

impl AdapterInner {
    fn ensure_active(&self) -> AdapterResult<()> {
        if !self.config.archival_active() {
            return Err(AdapterError::ArchivalDisabled);
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AdapterError::ShuttingDown);
        }
        Ok(())
    }

    fn mirrors_writes(&self) -> bool {
        self.config.archival_active()
            && matches!(
                self.config.storage_mode,
                StorageMode::DualSync | StorageMode::DualAsync
            )
    }

    /// Serialize before the primary write so a failure leaves nothing behind.
    fn mirror_payload<T: Serialize>(&self, item: &T) -> AdapterResult<Option<Value>> {
        if !self.mirrors_writes() {
            return Ok(None);
        }
        let value = serde_json::to_value(item).map_err(StorageError::from)?;
        Ok(Some(value))
    }

    fn session_lock(&self, session_id: &str) -> Arc<SessionLock> {
        self.session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the session's lock entry when nothing holds it.
    fn prune_session_lock(&self, session_id: &str) {
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn touch_access(&self, session_id: &str) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.record_access(Utc::now());
        }
    }

    /// Record a write and return whether the policy wants the session archived now.
    fn track_write(&self, session_id: &str) -> bool {
        let now = Utc::now();
        let mut state = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id, now));
        state.record_write(now);
        if self.config.storage_mode != StorageMode::ArchiveOnPolicy
            || !self
                .policy
                .should_archive_now(&state, ArchivalEvent::Write, now)
        {
            return false;
        }
        state.state = ArchivalState::Pending;
        true
    }

    /// Apply a primary write and count it against the session before eviction can look at
    /// the session again. Returns whether the policy wants the session archived now.
    async fn write_primary<F>(&self, session_id: &str, write: F) -> AdapterResult<bool>
    where
        F: Future<Output = StorageResult<()>>,
    {
        if !self.config.archival_active() {
            write.await?;
            return Ok(false);
        }
        let lock = self.session_lock(session_id);
        let _shared = lock.primary.read().await;
        write.await?;
        Ok(self.track_write(session_id))
    }

    /// Mark a session in flight. Returns its write sequence, its previous state, and
    /// whether this call created the session's entry.
    fn begin_archive(&self, session_id: &str) -> (u64, ArchivalState, bool) {
        let now = Utc::now();
        let mut created = false;
        let mut state = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                created = true;
                SessionState::new(session_id, now)
            });
        let previous = state.state;
        state.state = ArchivalState::InFlight;
        (state.write_seq, previous, created)
    }

    /// Undo `begin_archive` for an id that never had a write.
    fn forget_if_unwritten(&self, session_id: &str) {
        self.sessions.remove_if(session_id, |_, state| state.write_seq == 0);
    }

    fn set_state(&self, session_id: &str, new_state: ArchivalState) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.state = new_state;
        }
    }

    async fn after_primary_write(
        self: &Arc<Self>,
        session_id: SessionId,
        kind: ArchiveKind,
        mirror: Option<Value>,
        archive_now: bool,
    ) -> AdapterResult<()> {
        if !self.config.archival_active() {
            self.stats.record_primary_write();
            return Ok(());
        }

        match (self.config.storage_mode, mirror) {
            (StorageMode::DualSync, Some(payload)) => {
                let entry = self.build_entry(&session_id, kind, payload, None);
                if let Err(e) = self.attempt(&entry).await {
                    self.stats.record_remote_failure();
                    if !self.config.performance.graceful_degradation {
                        warn!(
                            "[DualStorage] Mirror write for session {} failed: {}",
                            session_id, e
                        );
                        return Err(AdapterError::Remote(e));
                    }
                    self.defer_failed_mirror(entry, &e);
                } else {
                    self.stats.record_remote_write(entry.payload_size());
                }
            }
            (StorageMode::DualAsync, Some(payload)) => {
                self.mirror_in_background(session_id.clone(), kind, payload);
            }
            _ => {}
        }

        self.stats.record_primary_write();
        if archive_now {
            self.archive_in_background(session_id);
        }
        Ok(())
    }

    fn build_entry(
        &self,
        session_id: &str,
        kind: ArchiveKind,
        payload: Value,
        write_seq: Option<u64>,
    ) -> ArchiveEntry {
        let (payload, pii_count) = self.anonymizer.anonymize_value_counted(&payload);
        self.stats.record_pii_anonymized(pii_count);

        let policy = self.policy.policy();
        let mut metadata: HashMap<String, Value> = HashMap::new();
        metadata.insert("source".to_string(), json!("vault-adapter"));
        metadata.insert("pii_instances".to_string(), json!(pii_count));
        if let Some(seq) = write_seq {
            metadata.insert(WRITE_SEQ_KEY.to_string(), json!(seq));
        }
        let encryption = &self.config.encryption;
        if encryption.enabled {
            metadata.insert("encryption_at_rest".to_string(), json!(true));
            if let Some(key_id) = &encryption.key_id {
                metadata.insert("key_id".to_string(), json!(key_id));
            }
        }
        ArchiveEntry {
            session_id: session_id.to_string(),
            kind,
            payload,
            retention_days: policy.retention_days,
            tags: policy.tags.clone(),
            metadata,
            captured_at: Utc::now(),
        }
    }

    async fn timed<T, F>(&self, call: F) -> VaultResult<T>
    where
        F: Future<Output = VaultResult<T>>,
    {
        let seconds = self.config.performance.timeout_seconds;
        match tokio::time::timeout(Duration::from_secs(seconds), call).await {
            Ok(result) => result,
            Err(_) => Err(VaultError::Timeout { seconds }),
        }
    }

    async fn with_permit<T, F>(&self, call: F) -> VaultResult<T>
    where
        F: Future<Output = VaultResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| VaultError::ConnectionError("adapter is closed".to_string()))?;
        self.timed(call).await
    }

    async fn attempt(&self, entry: &ArchiveEntry) -> VaultResult<ArchiveId> {
        self.with_permit(self.vault.archive(entry)).await
    }

    fn spawn_tracked<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.active.fetch_add(1, Ordering::SeqCst);
        let inner = self.clone();
        tokio::spawn(async move {
            task.await;
            if inner.tasks.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.tasks.idle.notify_waiters();
            }
        });
    }

    /// DualAsync: anonymize and send the mirror write on a background task. Without a free
    /// permit the task queues the anonymized entry as deferred instead. Never waits on the
    /// vault, and the anonymizer never runs on the caller's path.
    fn mirror_in_background(
        self: &Arc<Self>,
        session_id: SessionId,
        kind: ArchiveKind,
        payload: Value,
    ) {
        let permit = self.permits.clone().try_acquire_owned().ok();
        let inner = self.clone();
        self.spawn_tracked(async move {
            let entry = inner.build_entry(&session_id, kind, payload, None);
            let Some(permit) = permit else {
                match inner.queue.defer(entry, Utc::now()) {
                    Ok(_) => inner.stats.record_deferred(),
                    Err(e) => inner.report_rejected(&e),
                }
                return;
            };
            let result = inner.timed(inner.vault.archive(&entry)).await;
            drop(permit);
            match result {
                Ok(_) => inner.stats.record_remote_write(entry.payload_size()),
                Err(e) => {
                    inner.stats.record_remote_failure();
                    inner.defer_failed_mirror(entry, &e);
                }
            }
        });
    }

    /// Queue a failed mirror write (graceful-degradation path).
    fn defer_failed_mirror(&self, entry: ArchiveEntry, error: &VaultError) {
        let session_id = entry.session_id.clone();
        if !error.is_retryable() {
            self.stats.record_retries_exhausted();
            warn!(
                "[DualStorage] Mirror write for session {} rejected by vault, not retrying: {}",
                session_id, error
            );
            return;
        }
        if !self.config.performance.queue_failed_writes {
            warn!(
                "[DualStorage] Mirror write for session {} failed and queueing is disabled: {}",
                session_id, error
            );
            return;
        }
        match self.queue.record_failure(entry, &error.to_string(), Utc::now()) {
            Ok(FailureOutcome::Requeued { attempt_count, .. }) => {
                self.stats.record_deferred();
                debug!(
                    "[DualStorage] Mirror write for session {} queued (attempt {})",
                    session_id, attempt_count
                );
            }
            Ok(FailureOutcome::Exhausted { attempts, .. }) => {
                self.stats.record_retries_exhausted();
                error!(
                    "[DualStorage] Mirror write for session {} dropped after {} attempts",
                    session_id, attempts
                );
            }
            Err(e) => self.report_rejected(&e),
        }
    }

    fn report_rejected(&self, error: &AdapterError) {
        match error {
            AdapterError::QueueFull { capacity } => {
                self.stats.record_queue_full();
                warn!(
                    "[ArchivalQueue] Queue full ({} entries), rejecting archival operation",
                    capacity
                );
            }
            // The queue was already drained for shutdown; nothing will spill this entry.
            AdapterError::ShuttingDown => {
                self.stats.record_lost(1);
                error!(
                    "[ArchivalQueue] Archival operation for a drained queue after shutdown; entry lost"
                );
            }
            _ => {}
        }
    }

    /// Immediate trigger: archive off the caller's path. Writes that land while the
    /// archive is in flight are picked up by another round.
    fn archive_in_background(self: &Arc<Self>, session_id: SessionId) {
        let inner = self.clone();
        self.spawn_tracked(async move {
            loop {
                if inner.shutting_down.load(Ordering::SeqCst) {
                    inner.set_state(&session_id, ArchivalState::Active);
                    return;
                }
                match inner.archive_session(&session_id).await {
                    Ok(ArchiveOutcome::Archived { .. }) => {}
                    Ok(ArchiveOutcome::Deferred { .. }) | Err(_) => return,
                }
                let again = {
                    let now = Utc::now();
                    match inner.sessions.get_mut(&session_id) {
                        Some(mut state) => {
                            let due = inner
                                .policy
                                .should_archive_now(&state, ArchivalEvent::Write, now);
                            if due {
                                state.state = ArchivalState::Pending;
                            }
                            due
                        }
                        None => false,
                    }
                };
                if !again {
                    return;
                }
            }
        });
    }

    async fn archive_session(&self, session_id: &str) -> AdapterResult<ArchiveOutcome> {
        let result = {
            let lock = self.session_lock(session_id);
            let _guard = lock.archive.lock().await;
            self.archive_locked(session_id).await
        };
        if !self.sessions.contains_key(session_id) {
            self.prune_session_lock(session_id);
        }
        result
    }

    async fn archive_locked(&self, session_id: &str) -> AdapterResult<ArchiveOutcome> {
        let (seq, previous, created) = self.begin_archive(session_id);

        let data = match self.primary.get_session_data(&session_id.to_string()).await {
            Ok(data) => data,
            Err(e) => {
                let restored = match previous {
                    ArchivalState::Pending | ArchivalState::InFlight => ArchivalState::Active,
                    other => other,
                };
                self.set_state(session_id, restored);
                if created {
                    self.forget_if_unwritten(session_id);
                }
                return Err(e.into());
            }
        };
        let entry = self.build_entry(session_id, ArchiveKind::Session, data, Some(seq));

        match self.attempt(&entry).await {
            Ok(archive_id) => {
                self.on_remote_success(&entry, &archive_id);
                let stale = self.queue.remove_session_ops(session_id);
                if stale > 0 {
                    debug!(
                        "[DualStorage] Dropped {} superseded queued archives for session {}",
                        stale, session_id
                    );
                }
                Ok(ArchiveOutcome::Archived { archive_id })
            }
            Err(e) => {
                self.stats.record_remote_failure();
                self.on_session_failure(entry, e)
            }
        }
    }

    fn on_remote_success(&self, entry: &ArchiveEntry, archive_id: &str) {
        self.stats.record_remote_write(entry.payload_size());
        if entry.kind != ArchiveKind::Session {
            return;
        }
        self.stats.record_session_archived();
        let seq = entry
            .metadata
            .get(WRITE_SEQ_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if let Some(mut state) = self.sessions.get_mut(&entry.session_id) {
            state.record_archived(archive_id.to_string(), seq, Utc::now());
        }
        info!(
            "[DualStorage] Archived session {} as {}",
            entry.session_id, archive_id
        );
    }

    fn on_session_failure(&self, entry: ArchiveEntry, error: VaultError) -> AdapterResult<ArchiveOutcome> {
        let session_id = entry.session_id.clone();
        let perf = &self.config.performance;
        warn!(
            "[DualStorage] Archive of session {} failed: {}",
            session_id, error
        );
        if !error.is_retryable() || !perf.graceful_degradation || !perf.queue_failed_writes {
            self.set_state(&session_id, ArchivalState::Failed);
            return Err(AdapterError::Remote(error));
        }
        match self.queue.record_failure(entry, &error.to_string(), Utc::now()) {
            Ok(FailureOutcome::Requeued {
                attempt_count,
                next_attempt_at,
                ..
            }) => {
                self.set_state(&session_id, ArchivalState::Queued);
                self.stats.record_deferred();
                Ok(ArchiveOutcome::Deferred {
                    session_id,
                    attempt_count,
                    next_attempt_at,
                })
            }
            Ok(FailureOutcome::Exhausted { attempts, .. }) => {
                self.set_state(&session_id, ArchivalState::Failed);
                self.stats.record_retries_exhausted();
                error!(
                    "[DualStorage] Archive of session {} failed permanently after {} attempts",
                    session_id, attempts
                );
                Err(AdapterError::RetriesExhausted {
                    session_id,
                    attempts,
                })
            }
            Err(e) => {
                self.set_state(&session_id, ArchivalState::Active);
                self.report_rejected(&e);
                Err(e)
            }
        }
    }

    async fn archive_batch(&self, session_ids: &[SessionId]) -> BatchArchiveReport {
        let mut report = BatchArchiveReport::default();
        let ordered: Vec<SessionId> = session_ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let chunk_size = self.policy.policy().batch_size.max(1) as usize;
        for chunk in ordered.chunks(chunk_size) {
            self.archive_chunk(chunk, &mut report).await;
            for session_id in chunk {
                if !self.sessions.contains_key(session_id) {
                    self.prune_session_lock(session_id);
                }
            }
        }
        report
    }

    async fn archive_chunk(&self, chunk: &[SessionId], report: &mut BatchArchiveReport) {
        // Locks are taken in sorted order so concurrent batches cannot deadlock.
        let locks: Vec<Arc<SessionLock>> = chunk.iter().map(|id| self.session_lock(id)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.archive.lock().await);
        }

        let mut entries = Vec::with_capacity(chunk.len());
        for session_id in chunk {
            let (seq, _, created) = self.begin_archive(session_id);
            match self.primary.get_session_data(session_id).await {
                Ok(data) => entries.push(self.build_entry(
                    session_id,
                    ArchiveKind::Session,
                    data,
                    Some(seq),
                )),
                Err(e) => {
                    self.set_state(session_id, ArchivalState::Active);
                    if created {
                        self.forget_if_unwritten(session_id);
                    }
                    report.failed.push((session_id.clone(), e.to_string()));
                }
            }
        }
        if entries.is_empty() {
            return;
        }

        match self.with_permit(self.vault.batch_archive(&entries)).await {
            Ok(ids) => {
                for (entry, archive_id) in entries.iter().zip(ids) {
                    self.on_remote_success(entry, &archive_id);
                    self.queue.remove_session_ops(&entry.session_id);
                    report.archived.push((entry.session_id.clone(), archive_id));
                }
            }
            Err(e) => {
                warn!(
                    "[DualStorage] Batch archive of {} sessions failed: {}",
                    entries.len(),
                    e
                );
                for entry in entries {
                    self.stats.record_remote_failure();
                    let session_id = entry.session_id.clone();
                    match self.on_session_failure(entry, e.clone()) {
                        Ok(_) => report.deferred.push(session_id),
                        Err(err) => report.failed.push((session_id, err.to_string())),
                    }
                }
            }
        }
    }

    /// Attempt the given queue operations in order. With a deadline, stops once it passes
    /// and releases any claimed operation untouched.
    async fn drain(&self, ids: Vec<String>, deadline: Option<Instant>) -> FlushReport {
        let mut report = FlushReport::default();
        let total = ids.len();
        for (index, op_id) in ids.into_iter().enumerate() {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                report.skipped += total - index;
                break;
            }
            let Some(peek) = self.queue.get(&op_id) else {
                continue;
            };
            let lock = self.session_lock(peek.session_id());
            let _guard = match deadline {
                Some(d) => match tokio::time::timeout_at(d, lock.archive.lock()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        report.skipped += total - index;
                        break;
                    }
                },
                None => lock.archive.lock().await,
            };
            let Some(op) = self.queue.begin_attempt(&op_id) else {
                report.skipped += 1;
                continue;
            };

            let attempt = self.attempt(&op.entry);
            let result = match deadline {
                Some(d) => match tokio::time::timeout_at(d, attempt).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.queue.abandon_attempt(&op_id);
                        report.skipped += total - index;
                        break;
                    }
                },
                None => attempt.await,
            };

            match result {
                Ok(archive_id) => {
                    self.queue.complete(&op_id);
                    self.on_remote_success(&op.entry, &archive_id);
                    report.archive_ids.push(archive_id);
                }
                Err(e) => {
                    self.stats.record_remote_failure();
                    let message = e.to_string();
                    let outcome = if e.is_retryable() {
                        self.queue.fail(&op_id, &message, Utc::now())
                    } else {
                        self.queue.fail_permanently(&op_id, &message)
                    };
                    self.on_retry_outcome(&op.entry, outcome, message, &mut report);
                }
            }
        }
        report
    }

    fn on_retry_outcome(
        &self,
        entry: &ArchiveEntry,
        outcome: Option<FailureOutcome>,
        error_message: String,
        report: &mut FlushReport,
    ) {
        let is_session = entry.kind == ArchiveKind::Session;
        match outcome {
            Some(FailureOutcome::Requeued {
                attempt_count,
                next_attempt_at,
                ..
            }) => {
                report.requeued += 1;
                if is_session {
                    self.set_state(&entry.session_id, ArchivalState::Queued);
                }
                debug!(
                    "[ArchivalQueue] Retry {} for session {} failed, next attempt at {}",
                    attempt_count, entry.session_id, next_attempt_at
                );
            }
            Some(FailureOutcome::Exhausted { attempts, .. }) => {
                self.stats.record_retries_exhausted();
                if is_session {
                    self.set_state(&entry.session_id, ArchivalState::Failed);
                }
                error!(
                    "[ArchivalQueue] Dropping {:?} operation for session {} after {} attempts: {}",
                    entry.kind, entry.session_id, attempts, error_message
                );
                report.permanent_failures.push(PermanentFailure {
                    session_id: entry.session_id.clone(),
                    kind: entry.kind,
                    attempts,
                    error: error_message,
                });
            }
            None => {}
        }
    }

    /// Queue operations whose backoff has elapsed, oldest first.
    async fn drain_due(&self) -> FlushReport {
        let limit = self.policy.policy().batch_size.max(1) as usize;
        let ids = self.queue.due_ids(Utc::now(), limit);
        if ids.is_empty() {
            return FlushReport::default();
        }
        self.drain(ids, None).await
    }

    async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.config.storage_mode == StorageMode::ArchiveOnPolicy
            && matches!(
                self.policy.policy().trigger,
                ArchivalTrigger::Scheduled | ArchivalTrigger::AgeThreshold(_)
            )
        {
            let now = Utc::now();
            let snapshot: Vec<SessionState> =
                self.sessions.iter().map(|s| s.value().clone()).collect();
            let batch = self
                .policy
                .select_batch(&snapshot, ArchivalEvent::ScheduledTick, now);
            if !batch.is_empty() {
                debug!("[DualStorage] Scheduled tick selected {} sessions", batch.len());
                report.batch = self.archive_batch(&batch).await;
            }
        }
        if self.config.performance.retry_enabled {
            report.retries.merge(self.drain_due().await);
        }
        if let Err(e) = self.evict_expired(&mut report.evicted).await {
            warn!(
                "[DualStorage] Eviction stopped after {} sessions: {}",
                report.evicted.len(),
                e
            );
            report.eviction_error = Some(e.to_string());
        }
        report
    }

    /// Evict every archived session whose primary retention has passed, appending each
    /// evicted id to `evicted` as it goes. Stops at the first primary error.
    async fn evict_expired(&self, evicted: &mut Vec<SessionId>) -> AdapterResult<()> {
        let now = Utc::now();
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| self.policy.should_evict_from_primary(s.value(), now))
            .map(|s| s.key().clone())
            .collect();

        for session_id in candidates {
            let result = self.evict_one(&session_id).await;
            self.prune_session_lock(&session_id);
            if result? {
                evicted.push(session_id);
            }
        }
        Ok(())
    }

    async fn evict_one(&self, session_id: &SessionId) -> AdapterResult<bool> {
        let lock = self.session_lock(session_id);
        let _archive = lock.archive.lock().await;
        let _exclusive = lock.primary.write().await;
        // Re-check under the lock: a write may have landed since the scan.
        let still_due = self
            .sessions
            .get(session_id)
            .map_or(false, |s| self.policy.should_evict_from_primary(&s, Utc::now()));
        if !still_due {
            return Ok(false);
        }
        self.primary.delete_session_data(session_id).await?;
        self.set_state(session_id, ArchivalState::Evicted);
        self.stats.record_eviction();
        info!(
            "[DualStorage] Evicted archived session {} from primary tier",
            session_id
        );
        Ok(true)
    }

    fn reload_spill(&self) -> AdapterResult<()> {
        if !self.config.archival_active() {
            return Ok(());
        }
        let Some(path) = &self.config.performance.spill_path else {
            return Ok(());
        };
        let Some(operations) = spill::read_spill(path)? else {
            return Ok(());
        };
        let count = operations.len();
        let overflow = self.queue.restore(operations);
        if !overflow.is_empty() {
            self.stats.record_lost(overflow.len() as u64);
            error!(
                "[ArchivalQueue] Spill file holds more entries than the queue admits; {} lost",
                overflow.len()
            );
        }
        spill::remove_spill(path)?;
        info!(
            "[ArchivalQueue] Restored {} archival operations from {}",
            count - overflow.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnonymizationStrategy, PiiType, SecretValue};
    use crate::storage_backends::InMemoryGraphStore;
    use crate::vault::InMemoryVault;

    fn config(mode: StorageMode) -> StorageConfig {
        let mut config = StorageConfig {
            enabled: true,
            remote_endpoint: "http://vault.test".to_string(),
            api_key: SecretValue::new("test-key"),
            storage_mode: mode,
            ..StorageConfig::default()
        };
        config.anonymization.strategy = AnonymizationStrategy::Redact;
        config.anonymization.pii_types = [PiiType::Email].into_iter().collect();
        config
    }

    fn adapter(config: StorageConfig) -> (DualStorageAdapter, Arc<InMemoryVault>) {
        let vault = Arc::new(InMemoryVault::new());
        let adapter = DualStorageAdapter::new(
            config,
            Arc::new(InMemoryGraphStore::new()),
            vault.clone(),
            AdapterStats::new(),
        )
        .unwrap();
        (adapter, vault)
    }

    #[test]
    fn test_invalid_config_is_rejected_before_io() {
        let mut cfg = config(StorageMode::DualSync);
        cfg.api_key = SecretValue::default();
        let err = DualStorageAdapter::new(
            cfg,
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(InMemoryVault::new()),
            AdapterStats::new(),
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_disabled_adapter_never_touches_vault() {
        let mut cfg = config(StorageMode::DualSync);
        cfg.enabled = false;
        let (adapter, vault) = adapter(cfg);
        adapter
            .store_node(GraphNode::new("n1", "message", json!("bob@example.com")).in_session("s1"))
            .await
            .unwrap();
        assert_eq!(vault.call_count(), 0);
        assert_eq!(
            adapter.archive_session("s1").await.unwrap_err(),
            AdapterError::ArchivalDisabled
        );
        let stats = adapter.get_stats();
        assert_eq!(stats.primary_writes, 1);
        assert_eq!(stats.pii_instances_anonymized, 0);
    }

    #[tokio::test]
    async fn test_dual_sync_mirrors_anonymized_writes() {
        let (adapter, vault) = adapter(config(StorageMode::DualSync));
        adapter
            .store_node(GraphNode::new("n1", "message", json!({"text": "mail bob@example.com"})).in_session("s1"))
            .await
            .unwrap();
        let entries = vault.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.kind, ArchiveKind::NodeMirror);
        assert_eq!(entries[0].1.payload["content"]["text"], "mail [EMAIL_REDACTED]");
        let stats = adapter.get_stats();
        assert_eq!(stats.primary_writes, 1);
        assert_eq!(stats.remote_writes, 1);
        assert_eq!(stats.pii_instances_anonymized, 1);
    }

    #[tokio::test]
    async fn test_primary_errors_propagate_unchanged() {
        let (adapter, vault) = adapter(config(StorageMode::DualSync));
        let err = adapter
            .store_edge(GraphEdge::new("e1", "missing", "also-missing", "reply"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdapterError::Primary(StorageError::NotFound("node missing".to_string()))
        );
        assert_eq!(vault.call_count(), 0);
        assert_eq!(adapter.get_stats().primary_writes, 0);
    }

    #[tokio::test]
    async fn test_archive_session_records_state() {
        let (adapter, vault) = adapter(config(StorageMode::ArchiveOnPolicy));
        adapter
            .store_node(GraphNode::new("n1", "message", json!("hi")).in_session("s1"))
            .await
            .unwrap();
        let outcome = adapter.archive_session("s1").await.unwrap();
        let archive_id = outcome.archive_id().unwrap().to_string();
        let state = adapter.session_state("s1").unwrap();
        assert_eq!(state.state, ArchivalState::Archived);
        assert_eq!(state.archive_id.as_deref(), Some(archive_id.as_str()));

        let entry = adapter.retrieve_archived_session(&archive_id).await.unwrap();
        assert_eq!(entry.session_id, "s1");
        assert_eq!(entry.metadata[WRITE_SEQ_KEY], json!(1));
        assert_eq!(vault.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_unknown_session_is_a_primary_error() {
        let (adapter, _vault) = adapter(config(StorageMode::ArchiveOnPolicy));
        let err = adapter.archive_session("ghost").await.unwrap_err();
        assert!(matches!(err, AdapterError::Primary(StorageError::NotFound(_))));
        assert!(adapter.session_state("ghost").is_none());
        assert!(adapter.inner.session_locks.is_empty());

        assert_eq!(adapter.close_session("ghost").await.unwrap(), None);
        assert!(adapter.session_state("ghost").is_none());

        let report = adapter
            .archive_sessions(&["ghost".to_string(), "phantom".to_string()])
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(adapter.inner.sessions.is_empty());
        assert!(adapter.inner.session_locks.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_eviction_release_session_locks() {
        let mut cfg = config(StorageMode::ArchiveOnPolicy);
        cfg.archival_policy.auto_delete_from_primary = true;
        cfg.archival_policy.primary_retention_days = Some(0);
        let (adapter, _vault) = adapter(cfg);
        for (node, session) in [("n1", "s1"), ("n2", "s2")] {
            adapter
                .store_node(GraphNode::new(node, "message", json!("hi")).in_session(session))
                .await
                .unwrap();
        }
        assert_eq!(adapter.inner.session_locks.len(), 2);

        adapter.delete_session_data(&"s2".to_string()).await.unwrap();
        assert!(adapter.session_state("s2").is_none());
        assert!(!adapter.inner.session_locks.contains_key("s2"));

        adapter.archive_session("s1").await.unwrap();
        let evicted = adapter.evict_expired_sessions().await.unwrap();
        assert_eq!(evicted, vec!["s1".to_string()]);
        assert_eq!(
            adapter.session_state("s1").unwrap().state,
            ArchivalState::Evicted
        );
        assert!(adapter.inner.session_locks.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_mirror_is_anonymized_before_queueing() {
        let mut cfg = config(StorageMode::DualAsync);
        cfg.performance.max_concurrent_ops = 1;
        let (adapter, _vault) = adapter(cfg);
        let _busy = adapter.inner.permits.clone().acquire_owned().await.unwrap();

        adapter
            .store_node(GraphNode::new("n1", "message", json!("mail bob@example.com")).in_session("s1"))
            .await
            .unwrap();
        assert_eq!(adapter.get_stats().pii_instances_anonymized, 0);

        adapter.wait_for_background_tasks().await;
        let queued = adapter.inner.queue.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].entry.payload["content"], "mail [EMAIL_REDACTED]");
        let stats = adapter.get_stats();
        assert_eq!(stats.pii_instances_anonymized, 1);
        assert_eq!(stats.remote_writes_deferred, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_archival_work() {
        let (adapter, _vault) = adapter(config(StorageMode::ArchiveOnPolicy));
        let report = adapter.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(
            adapter.archive_session("s1").await.unwrap_err(),
            AdapterError::ShuttingDown
        );
    }
}
