use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobId;

/// Job status lifecycle
///
/// `PENDING → PROCESSING → {COMPLETED | PENDING | DEAD}`, and `DEAD → PENDING`
/// only through explicit reinstatement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for `next_attempt_at`
    Pending,

    /// Held by exactly one processing pass
    Processing,

    /// Submitted successfully
    Completed,

    /// Attempt budget exhausted, parked in the dead-letter queue
    Dead,
}

impl JobStatus {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead)
    }

    /// Live jobs hold their idempotency key
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Dead)
    }

    /// Get the status name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Job record - the unit of work tracked by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Unique job identifier
    pub id: JobId,

    /// Kind of operation, e.g. `REGISTER_EVENT` or `MINT_TOKEN`
    #[serde(rename = "type")]
    pub job_type: String,

    /// Opaque data handed to the processor verbatim
    pub payload: Value,

    pub idempotency_key: String,

    pub status: JobStatus,

    /// Attempts made so far (starts at 0)
    pub attempts: u32,

    pub max_attempts: u32,

    /// Not eligible for processing before this instant
    pub next_attempt_at: DateTime<Utc>,

    /// Result token recorded on success
    pub transaction_hash: Option<String>,

    /// Message from the most recent failed attempt
    pub last_error: Option<String>,

    /// While `PROCESSING`, the claim may be reclaimed after this instant
    #[serde(default)]
    pub lease_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new pending job, immediately eligible
    pub fn new(
        job_type: String,
        payload: Value,
        idempotency_key: String,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            payload,
            idempotency_key,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_attempt_at: now,
            transaction_hash: None,
            last_error: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            dead_at: None,
        }
    }

    /// Check if the job is eligible for processing at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_attempt_at <= now
    }

    /// Attempts left before the job is dead-lettered
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Claim the job for one processing attempt. The attempt is counted here,
    /// so a job that succeeds on its third try reports `attempts == 3`.
    pub fn start_processing(&mut self, now: DateTime<Utc>, lease_until: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.lease_until = Some(lease_until);
        self.updated_at = now;
    }

    /// Undo a claim whose attempt never ran to completion
    pub fn release_claim(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        self.lease_until = None;
        self.updated_at = now;
    }

    /// A `PROCESSING` record whose lease ran out (or that never had one)
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.lease_until.map_or(true, |until| until <= now)
    }

    /// Complete the job successfully
    pub fn complete(&mut self, transaction_hash: Option<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.lease_until = None;
        self.transaction_hash = transaction_hash;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Record why the current attempt failed. The caller decides between retry and death.
    pub fn record_failure(&mut self, error: String, now: DateTime<Utc>) {
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Schedule a retry
    pub fn schedule_retry(&mut self, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.lease_until = None;
        self.next_attempt_at = retry_at;
        self.updated_at = now;
    }

    /// Park the job in the dead-letter queue
    pub fn mark_dead(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Dead;
        self.lease_until = None;
        self.dead_at = Some(now);
        self.updated_at = now;
    }

    /// Bring a dead job back with a fresh attempt budget.
    /// `last_error` is kept for audit.
    pub fn reinstate(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.next_attempt_at = now;
        self.dead_at = None;
        self.updated_at = now;
    }
}
