//! Bounded retry/outbox queue for vault writes.
//!
//! Operations stay in the queue while they are being attempted (`in_flight`), so the queue
//! is the single place that knows about pending work for a session. All mutations happen
//! under one mutex:
//! - an operation is claimed by at most one caller at a time,
//! - a session's operations are attempted in the order they were queued,
//! - admission is bounded by `max_queue_size`; re-queuing an accepted operation never is,
//! - once `drain_all` has run the queue is closed and admits nothing.

pub mod spill;

use crate::config::PerformanceConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::types::{ArchiveEntry, ArchiveKind, SessionId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// A vault write waiting for its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub entry: ArchiveEntry,
    /// Failed attempts so far. Zero for writes deferred before their first attempt.
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(skip)]
    in_flight: bool,
}

impl QueuedOperation {
    pub fn new(entry: ArchiveEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entry,
            attempt_count: 0,
            next_attempt_at: now,
            enqueued_at: now,
            last_error: None,
            in_flight: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.entry.session_id
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Exponential backoff: `base * 2^(n-1)` after the n-th failure, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn from_config(perf: &PerformanceConfig) -> Self {
        Self {
            base_ms: perf.retry_backoff_ms,
            max_ms: perf.max_backoff_ms,
        }
    }

    pub fn delay_ms(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let shift = (failures - 1).min(63);
        self.base_ms
            .checked_mul(1u64 << shift)
            .unwrap_or(u64::MAX)
            .min(self.max_ms)
    }

    pub fn next_attempt_at(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = i64::try_from(self.delay_ms(failures)).unwrap_or(i64::MAX);
        now.checked_add_signed(Duration::milliseconds(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Operation kept for another attempt.
    Requeued {
        op_id: String,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// `max_retries` reached (or the error is permanent); the operation was removed.
    Exhausted { op_id: String, attempts: u32 },
}

#[derive(Debug)]
pub struct ArchivalQueue {
    ops: Mutex<VecDeque<QueuedOperation>>,
    // Only written and read with `ops` locked.
    closed: AtomicBool,
    capacity: usize,
    backoff: Backoff,
    max_retries: u32,
}

impl ArchivalQueue {
    pub fn new(capacity: usize, backoff: Backoff, max_retries: u32) -> Self {
        Self {
            ops: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            capacity,
            backoff,
            max_retries,
        }
    }

    pub fn from_config(perf: &PerformanceConfig) -> Self {
        Self::new(
            perf.max_queue_size as usize,
            Backoff::from_config(perf),
            perf.max_retries,
        )
    }

    // A panicking holder cannot leave the deque half-updated; every mutation is a single
    // push/remove/field write.
    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedOperation>> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    fn admit(&self, ops: &VecDeque<QueuedOperation>) -> AdapterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::ShuttingDown);
        }
        if ops.len() >= self.capacity {
            return Err(AdapterError::QueueFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a new operation, rejecting it when the queue is at capacity or closed.
    pub fn enqueue(&self, op: QueuedOperation) -> AdapterResult<()> {
        let mut ops = self.lock();
        self.admit(&ops)?;
        ops.push_back(op);
        Ok(())
    }

    /// Queue a write that has not been attempted yet; it is due immediately.
    pub fn defer(&self, entry: ArchiveEntry, now: DateTime<Utc>) -> AdapterResult<String> {
        let op = QueuedOperation::new(entry, now);
        let id = op.id.clone();
        self.enqueue(op)?;
        Ok(id)
    }

    /// Record a failed foreground attempt. Whole-session entries coalesce onto the
    /// session's existing operation (refreshing its payload); mirrored writes always get
    /// their own operation. `QueueFull` is only possible when a new operation is needed;
    /// a closed queue rejects every failure with `ShuttingDown`.
    pub fn record_failure(
        &self,
        entry: ArchiveEntry,
        error: &str,
        now: DateTime<Utc>,
    ) -> AdapterResult<FailureOutcome> {
        let mut ops = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::ShuttingDown);
        }
        let existing = if entry.kind == ArchiveKind::Session {
            ops.iter().position(|op| {
                !op.in_flight
                    && op.entry.kind == ArchiveKind::Session
                    && op.entry.session_id == entry.session_id
            })
        } else {
            None
        };
        match existing {
            Some(index) => {
                ops[index].entry = entry;
                Ok(self.fail_at(&mut ops, index, error, now))
            }
            None => {
                self.admit(&ops)?;
                ops.push_back(QueuedOperation::new(entry, now));
                let index = ops.len() - 1;
                Ok(self.fail_at(&mut ops, index, error, now))
            }
        }
    }

    fn fail_at(
        &self,
        ops: &mut VecDeque<QueuedOperation>,
        index: usize,
        error: &str,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let op = &mut ops[index];
        op.in_flight = false;
        op.attempt_count += 1;
        op.last_error = Some(error.to_string());
        if op.attempt_count >= self.max_retries {
            let attempts = op.attempt_count;
            let op_id = op.id.clone();
            ops.remove(index);
            return FailureOutcome::Exhausted { op_id, attempts };
        }
        op.next_attempt_at = self.backoff.next_attempt_at(op.attempt_count, now);
        FailureOutcome::Requeued {
            op_id: op.id.clone(),
            attempt_count: op.attempt_count,
            next_attempt_at: op.next_attempt_at,
        }
    }

    /// Ids of every operation not currently in flight, in queue order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|op| !op.in_flight)
            .map(|op| op.id.clone())
            .collect()
    }

    /// Ids of operations due at `now`, in queue order. An operation that is not yet due
    /// (or is in flight) holds back every later operation of the same session.
    pub fn due_ids(&self, now: DateTime<Utc>, limit: usize) -> Vec<String> {
        let ops = self.lock();
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut due = Vec::new();
        for op in ops.iter() {
            if due.len() >= limit {
                break;
            }
            let session = op.entry.session_id.as_str();
            if blocked.contains(session) {
                continue;
            }
            if op.in_flight || op.next_attempt_at > now {
                blocked.insert(session);
                continue;
            }
            due.push(op.id.clone());
        }
        due
    }

    /// Claim an operation for an attempt. `None` if it is gone, already claimed, or an
    /// older operation of the same session is still queued.
    pub fn begin_attempt(&self, op_id: &str) -> Option<QueuedOperation> {
        let mut ops = self.lock();
        let index = ops.iter().position(|op| op.id == op_id)?;
        let session = &ops[index].entry.session_id;
        if ops[index].in_flight
            || ops
                .iter()
                .take(index)
                .any(|earlier| &earlier.entry.session_id == session)
        {
            return None;
        }
        let op = &mut ops[index];
        op.in_flight = true;
        Some(op.clone())
    }

    /// Release a claimed operation without counting an attempt.
    pub fn abandon_attempt(&self, op_id: &str) {
        if let Some(op) = self.lock().iter_mut().find(|op| op.id == op_id) {
            op.in_flight = false;
        }
    }

    pub fn complete(&self, op_id: &str) -> Option<QueuedOperation> {
        let mut ops = self.lock();
        let index = ops.iter().position(|op| op.id == op_id)?;
        ops.remove(index)
    }

    /// Count a failed attempt against a claimed operation.
    pub fn fail(&self, op_id: &str, error: &str, now: DateTime<Utc>) -> Option<FailureOutcome> {
        let mut ops = self.lock();
        let index = ops.iter().position(|op| op.id == op_id)?;
        Some(self.fail_at(&mut ops, index, error, now))
    }

    /// Drop an operation whose error will not change on retry.
    pub fn fail_permanently(&self, op_id: &str, error: &str) -> Option<FailureOutcome> {
        let mut ops = self.lock();
        let index = ops.iter().position(|op| op.id == op_id)?;
        let mut op = ops.remove(index)?;
        op.attempt_count += 1;
        op.last_error = Some(error.to_string());
        Some(FailureOutcome::Exhausted {
            op_id: op.id,
            attempts: op.attempt_count,
        })
    }

    /// Remove whole-session operations for a session that was just archived.
    pub fn remove_session_ops(&self, session_id: &str) -> usize {
        let mut ops = self.lock();
        let before = ops.len();
        ops.retain(|op| {
            op.in_flight
                || op.entry.kind != ArchiveKind::Session
                || op.entry.session_id != session_id
        });
        before - ops.len()
    }

    pub fn has_session_op(&self, session_id: &str) -> bool {
        self.lock().iter().any(|op| {
            op.entry.kind == ArchiveKind::Session && op.entry.session_id == session_id
        })
    }

    pub fn get(&self, op_id: &str) -> Option<QueuedOperation> {
        self.lock().iter().find(|op| op.id == op_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.lock().iter().cloned().collect()
    }

    /// Close the queue, then remove and return every operation, including claimed ones.
    pub fn drain_all(&self) -> Vec<QueuedOperation> {
        let mut ops = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        let drained = ops
            .drain(..)
            .map(|mut op| {
                op.in_flight = false;
                op
            })
            .collect();
        drained
    }

    /// Re-admit operations loaded from a spill file, oldest first. Entries beyond capacity
    /// are returned to the caller.
    pub fn restore(&self, restored: Vec<QueuedOperation>) -> Vec<QueuedOperation> {
        let mut ops = self.lock();
        let mut overflow = Vec::new();
        for mut op in restored {
            if ops.len() >= self.capacity {
                overflow.push(op);
                continue;
            }
            op.in_flight = false;
            ops.push_back(op);
        }
        overflow
    }
}
