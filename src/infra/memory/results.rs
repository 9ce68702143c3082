use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    application::repos::{ArtifactStore, RepoError, check_result},
    domain::entities::{JobId, RenderResult},
};

/// Artifact store keyed by job id, held in process memory. With a retention
/// bound, results for the oldest jobs are dropped first.
#[derive(Debug, Default, Clone)]
pub struct MemoryArtifactStore {
    results: Arc<DashMap<JobId, RenderResult>>,
    /// Job ids in first-insert order.
    order: Arc<Mutex<VecDeque<JobId>>>,
    retention: Option<usize>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(max_jobs: usize) -> Self {
        Self {
            retention: Some(max_jobs.max(1)),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    fn track(&self, job_id: JobId) {
        let Some(limit) = self.retention else {
            return;
        };
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.push_back(job_id);
        while order.len() > limit {
            if let Some(oldest) = order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upsert_result(&self, result: RenderResult) -> Result<(), RepoError> {
        check_result(&result)?;

        let job_id = result.job_id;
        match self.results.entry(job_id) {
            Entry::Occupied(existing) if existing.get().is_succeeded() => {}
            Entry::Occupied(mut existing) => {
                existing.insert(result);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(result);
                self.track(job_id);
            }
        }
        Ok(())
    }

    async fn find_result(&self, job_id: JobId) -> Result<Option<RenderResult>, RepoError> {
        Ok(self.results.get(&job_id).map(|entry| entry.value().clone()))
    }
}
