use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain validation failed: {message}")]
    Validation { message: String },
    #[error("unknown task type `{0}`")]
    UnknownTaskType(String),
    #[error("schedule `{schedule_id}` is invalid: {reason}")]
    InvalidSchedule { schedule_id: String, reason: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_schedule(schedule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            schedule_id: schedule_id.into(),
            reason: reason.into(),
        }
    }
}
