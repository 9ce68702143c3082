//! Repository traits describing the queue broker and persistence adapters.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::{
    entities::{DeadLetterEntry, JobId, JobRecord, LeasedJob, RenderResult, WorkerLease},
    types::TaskType,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("lease for job {job_id} is no longer held")]
    LeaseLost { job_id: JobId },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// Settlement instruction for a failed attempt.
#[derive(Debug, Clone)]
pub struct Nack {
    pub requeue: bool,
    pub error: String,
    /// Delay before the requeued job becomes visible again.
    pub retry_after: Duration,
}

impl Nack {
    pub fn retry(error: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            requeue: true,
            error: error.into(),
            retry_after,
        }
    }

    pub fn dead_letter(error: impl Into<String>) -> Self {
        Self {
            requeue: false,
            error: error.into(),
            retry_after: Duration::ZERO,
        }
    }
}

/// Dead-letter detail for a requeue refused because no attempts remain.
pub fn attempts_exhausted_detail(attempt_count: u32, max_attempts: u32, error: &str) -> String {
    format!("attempts_exhausted: {attempt_count} of {max_attempts} attempts used; last error: {error}")
}

/// Dead-letter detail for a lease that expired on the final attempt.
pub fn lease_expired_detail(attempt_count: u32, max_attempts: u32) -> String {
    format!(
        "attempts_exhausted: {attempt_count} of {max_attempts} attempts used; last lease expired"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempt_count: u32 },
    DeadLettered { attempt_count: u32 },
}

/// Broker contract: at-least-once delivery with visibility deadlines.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, RepoError>;

    /// Lease the next visible job, polling for at most `wait`.
    async fn dequeue(&self, worker_id: &str, wait: Duration)
    -> Result<Option<LeasedJob>, RepoError>;

    async fn ack(&self, lease: &WorkerLease) -> Result<(), RepoError>;

    async fn nack(&self, lease: &WorkerLease, nack: Nack) -> Result<NackOutcome, RepoError>;

    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, RepoError>;

    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterEntry>, RepoError>;
}

/// Reject results whose artifact fields disagree with their status.
pub fn check_result(result: &RenderResult) -> Result<(), RepoError> {
    let consistent = if result.is_succeeded() {
        result.artifact.is_some() && result.checksum.is_some() && result.error_detail.is_none()
    } else {
        result.artifact.is_none() && result.error_detail.is_some()
    };

    if consistent {
        Ok(())
    } else {
        Err(RepoError::Integrity {
            message: format!(
                "render result for job {} has fields inconsistent with status `{}`",
                result.job_id,
                result.status.as_str()
            ),
        })
    }
}

/// Upsert-by-`job_id` storage for pipeline outcomes and their artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the result of an attempt. A succeeded result already stored for
    /// the same job is never replaced.
    async fn upsert_result(&self, result: RenderResult) -> Result<(), RepoError>;

    async fn find_result(&self, job_id: JobId) -> Result<Option<RenderResult>, RepoError>;

    /// Artifact bytes of a succeeded job, or [`RepoError::NotFound`].
    async fn get_artifact(&self, job_id: JobId) -> Result<Bytes, RepoError> {
        match self.find_result(job_id).await? {
            Some(RenderResult {
                artifact: Some(bytes),
                ..
            }) => Ok(bytes),
            _ => Err(RepoError::NotFound),
        }
    }
}

/// Persisted per-schedule state that must survive a scheduler restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub last_fired_at: Option<OffsetDateTime>,
    pub enabled: Option<bool>,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load_state(&self, schedule_id: &str) -> Result<ScheduleState, RepoError>;

    async fn record_fired(
        &self,
        schedule_id: &str,
        fired_at: OffsetDateTime,
    ) -> Result<(), RepoError>;

    async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<(), RepoError>;
}
