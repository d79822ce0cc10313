use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobRecord};

/// Lifecycle transitions published by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventKind {
    /// A new job was created (duplicates do not emit)
    Enqueued,

    /// The processor reported success
    Completed,

    /// An attempt failed and another one is scheduled
    Retry,

    /// The attempt budget is exhausted
    Dead,
}

impl JobEventKind {
    /// Every kind, in lifecycle order
    pub fn all() -> &'static [JobEventKind] {
        &[Self::Enqueued, Self::Completed, Self::Retry, Self::Dead]
    }

    /// Get event type name as string
    pub fn name(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Completed => "completed",
            Self::Retry => "retry",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for JobEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enqueued" => Ok(Self::Enqueued),
            "completed" => Ok(Self::Completed),
            "retry" => Ok(Self::Retry),
            "dead" => Ok(Self::Dead),
            other => Err(format!("Unknown job event: {}", other)),
        }
    }
}

/// Immutable snapshot of a job taken at emission time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: JobRecord,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, job: JobRecord, at: DateTime<Utc>) -> Self {
        Self { kind, job, at }
    }

    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }
}
