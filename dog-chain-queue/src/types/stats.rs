use serde::{Deserialize, Serialize};

use super::{JobRecord, JobStatus};

/// Point-in-time counts per status.
///
/// Always built from a single store snapshot, so the four counts sum to `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub dead: usize,
    pub total: usize,
}

impl QueueStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            match record.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Dead => stats.dead += 1,
            }
            stats.total += 1;
        }
        stats
    }

    pub fn is_consistent(&self) -> bool {
        self.pending + self.processing + self.completed + self.dead == self.total
    }
}
