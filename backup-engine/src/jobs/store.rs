//! Job storage backing the registry.

use super::Job;
use dashmap::DashMap;
use std::sync::Arc;

/// Storage for job records. The in-memory store loses history on restart;
/// swap in a durable implementation if cross-restart visibility is needed.
pub trait JobStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Job>;

    /// Insert or replace the whole record.
    fn set(&self, job: Job);

    fn list(&self) -> Vec<Job>;
}

/// Concurrent in-memory job store
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<DashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    fn set(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    fn list(&self) -> Vec<Job> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }
}
