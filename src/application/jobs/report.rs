use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
    application::{
        convert::ConvertError,
        render::{RenderError, RenderRequest},
        repos::{JobQueue, RepoError},
    },
    domain::{
        entities::{JobId, LeasedJob, RenderResult, WorkerLease},
        types::TaskType,
    },
};

use super::{context::JobWorkerContext, queue::enqueue_job};

/// Payload of a `render_report` job: the property record itself, optionally
/// naming the template to render it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderReportPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(flatten)]
    pub property: Map<String, Value>,
}

impl RenderReportPayload {
    pub fn new(property: Map<String, Value>) -> Self {
        Self {
            template_id: None,
            property,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn parse(payload: &Value) -> Result<Self, PipelineError> {
        if !payload.is_object() {
            return Err(PipelineError::invalid_payload("payload must be a JSON object"));
        }
        serde_json::from_value(payload.clone())
            .map_err(|err| PipelineError::invalid_payload(err.to_string()))
    }
}

/// Failure of one pipeline attempt, classified for retry routing.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] RepoError),
    #[error("storage rejected result: {0}")]
    StorageRejected(#[source] RepoError),
    #[error("attempts exhausted after {attempts} of {max_attempts}")]
    AttemptsExhausted { attempts: u32, max_attempts: u32 },
}

impl PipelineError {
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Integrity and input errors are defects in the result itself and
    /// cannot succeed on retry.
    pub fn from_storage(err: RepoError) -> Self {
        match err {
            RepoError::Integrity { .. } | RepoError::InvalidInput { .. } => {
                Self::StorageRejected(err)
            }
            other => Self::StorageUnavailable(other),
        }
    }

    /// Transient failures are retried with backoff; everything else goes
    /// straight to the dead-letter set.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Convert(err) => err.is_transient(),
            PipelineError::StorageUnavailable(_) => true,
            PipelineError::StorageRejected(_)
            | PipelineError::InvalidPayload { .. }
            | PipelineError::Render(_)
            | PipelineError::AttemptsExhausted { .. } => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidPayload { .. } => "invalid_payload",
            PipelineError::Render(RenderError::TemplateNotFound { .. }) => "template_not_found",
            PipelineError::Render(RenderError::MissingField { .. }) => "missing_field",
            PipelineError::Render(RenderError::Template { .. }) => "template",
            PipelineError::Convert(ConvertError::RenderTimeout { .. }) => "render_timeout",
            PipelineError::Convert(ConvertError::RenderEngineUnavailable { .. }) => {
                "render_engine_unavailable"
            }
            PipelineError::Convert(ConvertError::InvalidDocument { .. }) => "invalid_document",
            PipelineError::StorageUnavailable(_) => "storage_unavailable",
            PipelineError::StorageRejected(_) => "storage_rejected",
            PipelineError::AttemptsExhausted { .. } => "attempts_exhausted",
        }
    }
}

pub async fn enqueue_render_report<Q: JobQueue + ?Sized>(
    queue: &Q,
    payload: &RenderReportPayload,
    max_attempts: u32,
) -> Result<JobId, RepoError> {
    enqueue_job(queue, TaskType::RenderReport, payload, max_attempts).await
}

/// Run one attempt of the render pipeline: render, convert, persist.
///
/// Settlement (ack/nack) is left to the caller.
pub async fn process_render_report_job(
    ctx: &JobWorkerContext,
    job: &LeasedJob,
) -> Result<(), PipelineError> {
    let job_id = job.descriptor.job_id;
    let attempt = job.lease.attempt;
    let payload = RenderReportPayload::parse(&job.descriptor.payload)?;

    let existing = ctx
        .artifacts
        .find_result(job_id)
        .await
        .map_err(PipelineError::from_storage)?;
    if existing.as_ref().is_some_and(RenderResult::is_succeeded) {
        info!(
            target = "application::jobs::report",
            job_id = %job_id,
            attempt,
            "report already rendered; skipping"
        );
        return Ok(());
    }

    let template_id = payload
        .template_id
        .unwrap_or_else(|| ctx.default_template.as_str().to_string());
    let request = RenderRequest::new(template_id, payload.property, OffsetDateTime::now_utc());

    // Render and convert must finish before the lease can pass to another worker.
    let budget = attempt_budget(&job.lease, ctx.settle_margin, OffsetDateTime::now_utc());
    let (template, pdf) = tokio::time::timeout(budget, async {
        let document = ctx.renderer.render(&request)?;
        let pdf = ctx.converter.convert(&document.html).await?;
        Ok::<_, PipelineError>((document.template, pdf))
    })
    .await
    .map_err(|_| {
        warn!(
            target = "application::jobs::report",
            job_id = %job_id,
            attempt,
            budget_ms = budget.as_millis() as u64,
            "attempt ran out of lease time"
        );
        PipelineError::Convert(ConvertError::RenderTimeout { timeout: budget })
    })??;

    let result = RenderResult::succeeded(job_id, attempt, pdf);
    let checksum = result.checksum.clone().unwrap_or_default();

    ctx.artifacts
        .upsert_result(result)
        .await
        .map_err(PipelineError::from_storage)?;

    info!(
        target = "application::jobs::report",
        job_id = %job_id,
        attempt,
        template = template.as_str(),
        checksum = %checksum,
        "report rendered and stored"
    );

    Ok(())
}

/// Lease time left at `now` once `margin` is reserved for settling.
fn attempt_budget(lease: &WorkerLease, margin: Duration, now: OffsetDateTime) -> Duration {
    Duration::try_from(lease.visibility_deadline - now)
        .unwrap_or(Duration::ZERO)
        .saturating_sub(margin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_flattens_property_fields() {
        let payload = RenderReportPayload::parse(&json!({
            "template_id": "property_brief",
            "sku": "P-100",
            "price": 250000
        }))
        .expect("valid payload");

        assert_eq!(payload.template_id.as_deref(), Some("property_brief"));
        assert_eq!(payload.property.get("sku"), Some(&json!("P-100")));
        assert!(!payload.property.contains_key("template_id"));
    }

    #[test]
    fn payload_serializes_without_template_when_absent() {
        let mut property = Map::new();
        property.insert("sku".into(), json!("P-100"));
        let value = serde_json::to_value(RenderReportPayload::new(property)).expect("json");

        assert_eq!(value, json!({ "sku": "P-100" }));
    }

    #[test]
    fn non_object_payload_is_invalid() {
        let err = RenderReportPayload::parse(&json!(["P-100"])).expect_err("invalid");
        assert!(matches!(err, PipelineError::InvalidPayload { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn template_id_must_be_a_string() {
        let err = RenderReportPayload::parse(&json!({ "template_id": 7, "sku": "P-1" }))
            .expect_err("invalid");
        assert_eq!(err.kind(), "invalid_payload");
    }

    #[test]
    fn classifies_errors() {
        let timeout = PipelineError::from(ConvertError::RenderTimeout {
            timeout: std::time::Duration::from_secs(30),
        });
        let missing = PipelineError::from(RenderError::TemplateNotFound {
            template_id: "nope".into(),
        });
        let storage = PipelineError::StorageUnavailable(RepoError::Timeout);

        assert!(timeout.is_transient());
        assert!(storage.is_transient());
        assert!(!missing.is_transient());
        assert!(!PipelineError::from(ConvertError::invalid_document("empty")).is_transient());
    }

    #[test]
    fn integrity_errors_from_storage_are_permanent() {
        let rejected = PipelineError::from_storage(RepoError::Integrity {
            message: "artifact missing".into(),
        });
        let invalid = PipelineError::from_storage(RepoError::invalid_input("bad job id"));
        let down = PipelineError::from_storage(RepoError::from_persistence("connection reset"));

        assert_eq!(rejected.kind(), "storage_rejected");
        assert!(!rejected.is_transient());
        assert!(!invalid.is_transient());
        assert_eq!(down.kind(), "storage_unavailable");
        assert!(down.is_transient());
    }

    fn lease_until(deadline: OffsetDateTime) -> WorkerLease {
        WorkerLease {
            job_id: JobId::new(),
            lease_id: uuid::Uuid::new_v4(),
            worker_id: "worker-0".into(),
            attempt: 1,
            visibility_deadline: deadline,
        }
    }

    #[test]
    fn attempt_budget_reserves_settle_margin() {
        let now = OffsetDateTime::now_utc();
        let lease = lease_until(now + time::Duration::seconds(300));

        assert_eq!(
            attempt_budget(&lease, Duration::from_secs(30), now),
            Duration::from_secs(270)
        );
    }

    #[test]
    fn attempt_budget_is_zero_for_expired_lease() {
        let now = OffsetDateTime::now_utc();
        let lease = lease_until(now - time::Duration::seconds(5));

        assert_eq!(
            attempt_budget(&lease, Duration::from_secs(1), now),
            Duration::ZERO
        );
        let nearly_expired = lease_until(now + time::Duration::seconds(1));
        assert_eq!(
            attempt_budget(&nearly_expired, Duration::from_secs(2), now),
            Duration::ZERO
        );
    }
}
