pub mod memory;

pub use memory::MemoryJobStore;

use crate::{JobId, JobRecord, JobStatus};

/// Keyed storage for job records.
///
/// The store does not interpret status semantics; the engine is its only
/// writer and serializes read-modify-write sequences itself. Listings return
/// owned snapshots in insertion order, so callers can keep mutating the store
/// while walking them.
///
/// Replace [`MemoryJobStore`] with a durable implementation to keep jobs
/// across restarts.
pub trait JobStore: Send + Sync {
    /// Insert or replace a record. A replaced record keeps its position.
    fn put(&self, job: JobRecord);

    fn get(&self, id: &JobId) -> Option<JobRecord>;

    /// Records with the given status, in insertion order
    fn list_by_status(&self, status: JobStatus) -> Vec<JobRecord>;

    /// Every record, in insertion order
    fn list_all(&self) -> Vec<JobRecord>;

    fn remove(&self, id: &JobId) -> Option<JobRecord>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
