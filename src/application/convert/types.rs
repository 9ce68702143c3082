use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("conversion exceeded {}s", timeout.as_secs_f64())]
    RenderTimeout { timeout: Duration },
    #[error("render engine unavailable: {reason}")]
    RenderEngineUnavailable { reason: String },
    #[error("invalid document: {reason}")]
    InvalidDocument { reason: String },
}

impl ConvertError {
    pub fn engine_unavailable(reason: impl Into<String>) -> Self {
        Self::RenderEngineUnavailable {
            reason: reason.into(),
        }
    }

    pub fn invalid_document(reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            reason: reason.into(),
        }
    }

    /// Timeouts and engine failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ConvertError::InvalidDocument { .. })
    }
}

/// Turns a rendered HTML document into PDF bytes.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, html: &str) -> Result<Bytes, ConvertError>;
}
