use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{store::JobStore, JobId, JobRecord, JobStatus};

#[derive(Default)]
struct Inner {
    /// Job records indexed by id
    jobs: HashMap<JobId, JobRecord>,

    /// Insertion order
    order: Vec<JobId>,
}

/// In-memory store, lost on process exit
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, filter: impl Fn(&JobRecord) -> bool) -> Vec<JobRecord> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|record| filter(record))
            .cloned()
            .collect()
    }
}

impl JobStore for MemoryJobStore {
    fn put(&self, job: JobRecord) {
        let mut inner = self.inner.write();
        let id = job.id.clone();
        if inner.jobs.insert(id.clone(), job).is_none() {
            inner.order.push(id);
        }
    }

    fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.inner.read().jobs.get(id).cloned()
    }

    fn list_by_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.collect(|record| record.status == status)
    }

    fn list_all(&self) -> Vec<JobRecord> {
        self.collect(|_| true)
    }

    fn remove(&self, id: &JobId) -> Option<JobRecord> {
        let mut inner = self.inner.write();
        let removed = inner.jobs.remove(id)?;
        inner.order.retain(|existing| existing != id);
        Some(removed)
    }

    fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }
}
