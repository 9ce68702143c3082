//! Shared domain enumerations aligned with persisted column values.

use serde::{Deserialize, Serialize};

/// Kinds of work the queue can carry. Each variant owns a payload schema that
/// is validated when the job is dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RenderReport,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::RenderReport => "render_report",
        }
    }
}

impl TryFrom<&str> for TaskType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "render_report" => Ok(TaskType::RenderReport),
            _ => Err(()),
        }
    }
}

/// Queue-owned lifecycle of a job descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    Leased,
    Acked,
    DeadLettered,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Leased => "leased",
            JobState::Acked => "acked",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Acked | JobState::DeadLettered)
    }
}

impl TryFrom<&str> for JobState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ready" => Ok(JobState::Ready),
            "leased" => Ok(JobState::Leased),
            "acked" => Ok(JobState::Acked),
            "dead_lettered" => Ok(JobState::DeadLettered),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Succeeded,
    Failed,
}

impl RenderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderStatus::Succeeded => "succeeded",
            RenderStatus::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for RenderStatus {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "succeeded" => Ok(RenderStatus::Succeeded),
            "failed" => Ok(RenderStatus::Failed),
            _ => Err(()),
        }
    }
}
