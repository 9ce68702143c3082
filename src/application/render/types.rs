use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Report layouts compiled into the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    PropertySummary,
    PropertyBrief,
}

impl TemplateId {
    pub const DEFAULT: TemplateId = TemplateId::PropertySummary;

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateId::PropertySummary => "property_summary",
            TemplateId::PropertyBrief => "property_brief",
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateId {
    type Err = RenderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "property_summary" => Ok(TemplateId::PropertySummary),
            "property_brief" => Ok(TemplateId::PropertyBrief),
            other => Err(RenderError::TemplateNotFound {
                template_id: other.to_string(),
            }),
        }
    }
}

/// Rendering request passed into the template renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub template_id: String,
    /// Property record as structured data; which fields are required depends
    /// on the template.
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Injected separately; the only input allowed to vary between otherwise
    /// identical renders.
    pub generated_at: OffsetDateTime,
}

impl RenderRequest {
    pub fn new(
        template_id: impl Into<String>,
        data: serde_json::Map<String, serde_json::Value>,
        generated_at: OffsetDateTime,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            data,
            generated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub template: TemplateId,
    pub html: String,
}

/// Structured errors surfaced by the template renderer. Both content errors are
/// permanent: retrying the same input cannot succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template `{template_id}` not found")]
    TemplateNotFound { template_id: String },
    #[error("template `{template}` requires field `{field}`")]
    MissingField {
        template: TemplateId,
        field: &'static str,
    },
    #[error("template `{template}` failed to render: {message}")]
    Template {
        template: TemplateId,
        message: String,
    },
}

/// Implementations must be pure: identical requests (ignoring
/// `generated_at`) produce identical documents or errors.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, RenderError>;
}
