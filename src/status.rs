// Run status tracking
//
// One RunStatus per tracked entity (provider for discovery, resource for
// collection). Every transition is applied while holding the entry's shard
// lock, so concurrent scheduled and on-demand runs never interleave
// read-modify-write steps on the same record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use crate::model::{EntityKind, RunState, RunStatus};

/// Proof that a run was started, handed back when it finishes
///
/// Each `begin` increments the entity's sequence number. A run may only
/// record its outcome while its ticket is still the newest one; a slower
/// run that was overtaken by a later start finishes silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTicket {
    pub entity_id: String,
    pub seq: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct TrackedStatus {
    status: RunStatus,
    latest_seq: u64,
}

/// Concurrent map of entity ID -> RunStatus for one kind of run
#[derive(Debug)]
pub struct RunStatusTracker {
    kind: EntityKind,
    entries: DashMap<String, TrackedStatus>,
}

impl RunStatusTracker {
    pub fn new(kind: EntityKind) -> Self {
        RunStatusTracker {
            kind,
            entries: DashMap::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    fn tracked(&self, entity_id: &str) -> dashmap::mapref::one::RefMut<'_, String, TrackedStatus> {
        self.entries
            .entry(entity_id.to_string())
            .or_insert_with(|| TrackedStatus {
                status: RunStatus::new(self.kind, entity_id),
                latest_seq: 0,
            })
    }

    fn start(tracked: &mut TrackedStatus, entity_type: &str, provider_id: &str) -> RunTicket {
        let status = &mut tracked.status;

        // Never start before the previous run's recorded end
        let now = Utc::now();
        let started_at = [status.last_end_time, status.last_start_time]
            .into_iter()
            .flatten()
            .fold(now, |latest, t| latest.max(t));

        status.entity_type = Some(entity_type.to_string());
        status.provider_id = Some(provider_id.to_string());
        status.state = RunState::Running;
        status.last_start_time = Some(started_at);
        status.last_end_time = None;

        tracked.latest_seq += 1;

        RunTicket {
            entity_id: status.entity_id.clone(),
            seq: tracked.latest_seq,
            started_at,
        }
    }

    /// Marks the entity RUNNING unconditionally (on-demand path)
    pub fn begin(&self, entity_id: &str, entity_type: &str, provider_id: &str) -> RunTicket {
        let mut tracked = self.tracked(entity_id);
        Self::start(&mut tracked, entity_type, provider_id)
    }

    /// Marks the entity RUNNING unless a run is already in flight
    ///
    /// Used by scheduled ticks: `None` means the cycle should be skipped.
    pub fn try_begin(&self, entity_id: &str, entity_type: &str, provider_id: &str) -> Option<RunTicket> {
        let mut tracked = self.tracked(entity_id);
        if tracked.status.is_running() {
            debug!("{:?} run for '{}' still in flight", self.kind, entity_id);
            return None;
        }
        Some(Self::start(&mut tracked, entity_type, provider_id))
    }

    fn finish<F>(&self, ticket: &RunTicket, apply: F) -> bool
    where
        F: FnOnce(&mut RunStatus, DateTime<Utc>),
    {
        let Some(mut tracked) = self.entries.get_mut(&ticket.entity_id) else {
            return false;
        };

        if tracked.latest_seq != ticket.seq {
            debug!(
                "Discarding outcome of superseded {:?} run for '{}'",
                self.kind, ticket.entity_id
            );
            return false;
        }

        let started = tracked.status.last_start_time.unwrap_or(ticket.started_at);
        let ended_at = Utc::now().max(started);
        apply(&mut tracked.status, ended_at);
        true
    }

    /// Records a successful run; returns false if the ticket was superseded
    pub fn complete(&self, ticket: &RunTicket, result_count: usize) -> bool {
        self.finish(ticket, |status, ended_at| {
            status.state = RunState::Completed;
            status.last_end_time = Some(ended_at);
            status.last_success_time = Some(ended_at);
            status.last_result_count = result_count;
            status.consecutive_failure_count = 0;
        })
    }

    /// Records a failed run; returns false if the ticket was superseded
    pub fn fail(&self, ticket: &RunTicket, message: impl Into<String>) -> bool {
        let message = message.into();
        self.finish(ticket, |status, ended_at| {
            status.state = RunState::Failed;
            status.last_end_time = Some(ended_at);
            status.last_error_message = Some(message);
            status.consecutive_failure_count = status.consecutive_failure_count.saturating_add(1);
        })
    }

    /// Wraps a ticket so that a run dropped before finishing is recorded as failed
    pub fn guard(&self, ticket: RunTicket) -> RunGuard<'_> {
        RunGuard {
            tracker: self,
            ticket: Some(ticket),
        }
    }

    /// Attaches schedule metadata when a timer is armed for the entity
    pub fn mark_scheduled(
        &self,
        entity_id: &str,
        entity_type: &str,
        provider_id: &str,
        interval: Duration,
        next_run: DateTime<Utc>,
    ) {
        let mut tracked = self.tracked(entity_id);
        let status = &mut tracked.status;

        status.entity_type = Some(entity_type.to_string());
        status.provider_id = Some(provider_id.to_string());
        status.scheduled = true;
        status.schedule_interval = Some(interval);
        status.next_scheduled_run = Some(next_run);
        status.job_id = Some(entity_id.to_string());
        if !status.is_running() {
            status.state = RunState::Scheduled;
        }
    }

    /// Clears schedule metadata after the entity's timer is stopped
    ///
    /// Entities that were never tracked stay untracked.
    pub fn mark_unscheduled(&self, entity_id: &str) {
        if let Some(mut tracked) = self.entries.get_mut(entity_id) {
            let status = &mut tracked.status;
            status.scheduled = false;
            status.next_scheduled_run = None;
            status.job_id = None;
            if status.state == RunState::Scheduled {
                status.state = RunState::Disabled;
            }
        }
    }

    /// Advances `next_scheduled_run` by one interval after a tick fired
    pub fn record_tick(&self, entity_id: &str) {
        if let Some(mut tracked) = self.entries.get_mut(entity_id) {
            let status = &mut tracked.status;
            if let (true, Some(interval)) = (status.scheduled, status.schedule_interval) {
                status.next_scheduled_run = chrono::Duration::from_std(interval)
                    .ok()
                    .map(|interval| Utc::now() + interval);
            }
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<RunStatus> {
        self.entries.get(entity_id).map(|t| t.status.clone())
    }

    /// Copies of every record, sorted by entity ID
    pub fn snapshot(&self) -> Vec<RunStatus> {
        let mut statuses: Vec<RunStatus> = self.entries.iter().map(|t| t.status.clone()).collect();
        statuses.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A started run that must end in `complete` or `fail`
///
/// Dropping it unfinished (a panic unwinding through the run, or the run's
/// future being cancelled) records the run as FAILED, so the entity never
/// stays RUNNING and scheduled ticks stop being skipped.
pub struct RunGuard<'a> {
    tracker: &'a RunStatusTracker,
    ticket: Option<RunTicket>,
}

impl RunGuard<'_> {
    pub fn complete(mut self, result_count: usize) -> bool {
        match self.ticket.take() {
            Some(ticket) => self.tracker.complete(&ticket, result_count),
            None => false,
        }
    }

    pub fn fail(mut self, message: impl Into<String>) -> bool {
        match self.ticket.take() {
            Some(ticket) => self.tracker.fail(&ticket, message),
            None => false,
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            debug!(
                "{:?} run for '{}' ended without an outcome",
                self.tracker.kind, ticket.entity_id
            );
            self.tracker.fail(&ticket, ABORTED_MESSAGE);
        }
    }
}

/// Error message recorded for a run that was dropped unfinished
pub const ABORTED_MESSAGE: &str = "run aborted";
