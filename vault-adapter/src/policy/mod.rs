//! Archival policy engine.
//!
//! Pure decision logic: no I/O, no clocks of its own. Callers pass the session state and
//! the current time, which keeps every rule testable with fixed timestamps.

use crate::config::{ArchivalPolicy, ArchivalTrigger};
use crate::types::{ArchiveId, SessionId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a session sits in the archival state machine.
///
/// `Active → Pending → InFlight → Archived | Queued → InFlight → … | Failed`, and
/// `Archived → Evicted`. A new write moves `Archived`, `Failed` and `Evicted` sessions
/// back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivalState {
    Active,
    Pending,
    InFlight,
    Queued,
    Archived,
    Failed,
    Evicted,
}

/// What prompted a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivalEvent {
    Write,
    SessionEnd,
    ScheduledTick,
}

/// Tracked lifecycle of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub state: ArchivalState,
    pub created_at: DateTime<Utc>,
    pub last_write_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub closed: bool,
    /// Incremented on every primary write for the session
    pub write_seq: u64,
    /// `write_seq` covered by the last acknowledged archive
    pub archived_seq: Option<u64>,
    pub archived_at: Option<DateTime<Utc>>,
    pub archive_id: Option<ArchiveId>,
    pub archive_count: u32,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            state: ArchivalState::Active,
            created_at: now,
            last_write_at: now,
            last_access_at: now,
            closed: false,
            write_seq: 0,
            archived_seq: None,
            archived_at: None,
            archive_id: None,
            archive_count: 0,
        }
    }

    pub fn record_write(&mut self, now: DateTime<Utc>) {
        self.write_seq += 1;
        self.last_write_at = now;
        self.last_access_at = now;
        if matches!(
            self.state,
            ArchivalState::Archived | ArchivalState::Failed | ArchivalState::Evicted
        ) {
            self.state = ArchivalState::Active;
        }
    }

    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.last_access_at = now;
    }

    /// Mark an acknowledged archive that covered writes up to `seq`.
    pub fn record_archived(&mut self, archive_id: ArchiveId, seq: u64, now: DateTime<Utc>) {
        self.archived_seq = Some(self.archived_seq.map_or(seq, |prev| prev.max(seq)));
        self.archived_at = Some(now);
        self.archive_id = Some(archive_id);
        self.archive_count += 1;
        self.state = if self.has_unarchived_writes() {
            ArchivalState::Active
        } else {
            ArchivalState::Archived
        };
    }

    pub fn has_unarchived_writes(&self) -> bool {
        match self.archived_seq {
            Some(seq) => self.write_seq > seq,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivalPolicyEngine {
    policy: ArchivalPolicy,
}

impl ArchivalPolicyEngine {
    pub fn new(policy: ArchivalPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ArchivalPolicy {
        &self.policy
    }

    /// Whether `event` makes this session due for archival right now.
    pub fn should_archive_now(
        &self,
        session: &SessionState,
        event: ArchivalEvent,
        now: DateTime<Utc>,
    ) -> bool {
        // Already handled, being handled, or terminally failed until written again.
        if matches!(
            session.state,
            ArchivalState::Pending
                | ArchivalState::InFlight
                | ArchivalState::Queued
                | ArchivalState::Failed
                | ArchivalState::Evicted
        ) {
            return false;
        }
        if !session.has_unarchived_writes() {
            return false;
        }
        match self.policy.trigger {
            ArchivalTrigger::Immediate => {
                matches!(event, ArchivalEvent::Write | ArchivalEvent::SessionEnd)
            }
            ArchivalTrigger::OnSessionEnd => event == ArchivalEvent::SessionEnd,
            ArchivalTrigger::Scheduled => event == ArchivalEvent::ScheduledTick,
            ArchivalTrigger::AgeThreshold(days) => {
                event == ArchivalEvent::ScheduledTick
                    && now - session.last_write_at >= Duration::days(i64::from(days))
            }
            ArchivalTrigger::Manual => false,
        }
    }

    /// Sessions due on this event, oldest write first, at most `batch_size` of them.
    pub fn select_batch<'a, I>(&self, sessions: I, event: ArchivalEvent, now: DateTime<Utc>) -> Vec<SessionId>
    where
        I: IntoIterator<Item = &'a SessionState>,
    {
        let mut due: Vec<&SessionState> = sessions
            .into_iter()
            .filter(|s| self.should_archive_now(s, event, now))
            .collect();
        due.sort_by(|a, b| {
            a.last_write_at
                .cmp(&b.last_write_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        due.into_iter()
            .take(self.policy.batch_size as usize)
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// True only for sessions with an acknowledged archive that covers every write, when
    /// auto-delete is on and `primary_retention_days` have passed since last access.
    pub fn should_evict_from_primary(&self, session: &SessionState, now: DateTime<Utc>) -> bool {
        if !self.policy.auto_delete_from_primary {
            return false;
        }
        let Some(days) = self.policy.primary_retention_days else {
            return false;
        };
        if session.state != ArchivalState::Archived
            || session.archived_at.is_none()
            || session.has_unarchived_writes()
        {
            return false;
        }
        now - session.last_access_at >= Duration::days(i64::from(days))
    }
}
