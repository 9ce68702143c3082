//! Domain entities owned by the queue, the worker pool and the scheduler.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{
    error::DomainError,
    types::{JobState, RenderStatus, TaskType},
};

/// Globally unique job identifier, assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|err| DomainError::validation(format!("invalid job id `{value}`: {err}")))
    }
}

/// Unit of work as seen by producers and workers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    pub attempt_count: u32,
    pub max_attempts: u32,
}

impl JobDescriptor {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Transient ownership of a dequeued job by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLease {
    pub job_id: JobId,
    /// Fresh per delivery; ack/nack with an older lease id is rejected.
    pub lease_id: Uuid,
    pub worker_id: String,
    /// Attempt number this delivery represents (1-based).
    pub attempt: u32,
    pub visibility_deadline: OffsetDateTime,
}

impl WorkerLease {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.visibility_deadline
    }
}

/// A descriptor paired with the lease granting the right to settle it.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub descriptor: JobDescriptor,
    pub lease: WorkerLease,
}

/// Queue-side snapshot of a job, used for inspection and waiting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub descriptor: JobDescriptor,
    pub state: JobState,
    #[serde(with = "time::serde::rfc3339")]
    pub visible_at: OffsetDateTime,
    pub leased_by: Option<String>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub settled_at: Option<OffsetDateTime>,
}

/// Terminal record for a job that exhausted its attempts or failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub error_detail: String,
    pub attempt_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub dead_lettered_at: OffsetDateTime,
}

/// Outcome of one pipeline attempt. Keyed by `job_id` in the artifact store.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    pub job_id: JobId,
    pub attempt: u32,
    pub status: RenderStatus,
    pub artifact: Option<Bytes>,
    pub checksum: Option<String>,
    pub error_detail: Option<String>,
    pub completed_at: OffsetDateTime,
}

impl RenderResult {
    pub fn succeeded(job_id: JobId, attempt: u32, artifact: Bytes) -> Self {
        let checksum = hex::encode(Sha256::digest(&artifact));
        Self {
            job_id,
            attempt,
            status: RenderStatus::Succeeded,
            artifact: Some(artifact),
            checksum: Some(checksum),
            error_detail: None,
            completed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn failed(job_id: JobId, attempt: u32, error_detail: impl Into<String>) -> Self {
        Self {
            job_id,
            attempt,
            status: RenderStatus::Failed,
            artifact: None,
            checksum: None,
            error_detail: Some(error_detail.into()),
            completed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == RenderStatus::Succeeded
    }
}
