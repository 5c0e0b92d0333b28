use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub payload: Value,
    pub state: JobState,

    /// Incremented on every lease acquisition, never decremented.
    pub attempts: i32,
    pub max_attempts: i32,

    pub not_before: DateTime<Utc>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,

    pub last_error: Option<String>,
    pub replay_of: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether `lease_due` at `now` may hand this job out.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.not_before <= now,
            JobState::Leased => self.lease_expiry.is_some_and(|exp| exp < now),
            _ => false,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// The lease currently on this job, if it is leased.
    pub fn lease(&self) -> Option<Lease> {
        if self.state != JobState::Leased {
            return None;
        }
        self.leased_by.as_ref().map(|worker_id| Lease {
            worker_id: worker_id.clone(),
            attempt: self.attempts,
        })
    }

    /// Whether `lease` is still the live lease on this job.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        self.state == JobState::Leased
            && self.attempts == lease.attempt
            && self.leased_by.as_deref() == Some(lease.worker_id.as_str())
    }
}

/// One specific lease of a job.
///
/// `attempt` is the job's `attempts` value right after it was leased. Every
/// lease bumps it, so a holder whose lease expired and was taken over (even
/// by the same worker id) no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lease {
    pub worker_id: String,
    pub attempt: i32,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: Value,
    pub delay: std::time::Duration,
    /// Falls back to the scheduler's default when `None`.
    pub max_attempts: Option<i32>,
}

impl NewJob {
    pub fn new(payload: Value, delay: std::time::Duration) -> Self {
        Self {
            payload,
            delay,
            max_attempts: None,
        }
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = Some(n);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Done,
    /// Stored state name only; the scheduler never moves a job here.
    Failed,
    DeadLettered,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Leased,
        JobState::Done,
        JobState::Failed,
        JobState::DeadLettered,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Failed | JobState::DeadLettered | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a `nack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Rescheduled { not_before: DateTime<Utc> },
    DeadLettered,
    /// The job was not leased (missing, already acked, or re-leased elsewhere after expiry).
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: i64,
    pub leased: i64,
    pub done: i64,
    pub failed: i64,
    pub dead_lettered: i64,
    pub cancelled: i64,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Leased => self.leased,
            JobState::Done => self.done,
            JobState::Failed => self.failed,
            JobState::DeadLettered => self.dead_lettered,
            JobState::Cancelled => self.cancelled,
        }
    }

    pub fn add(&mut self, state: JobState, n: i64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Leased => &mut self.leased,
            JobState::Done => &mut self.done,
            JobState::Failed => &mut self.failed,
            JobState::DeadLettered => &mut self.dead_lettered,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn total(&self) -> i64 {
        self.pending + self.leased + self.done + self.failed + self.dead_lettered + self.cancelled
    }
}
