use std::{sync::Arc, time::Duration};

use crate::application::{
    convert::DocumentConverter,
    render::{TemplateId, TemplateRenderer},
    repos::{ArtifactStore, JobQueue},
};

use super::retry::RetryPolicy;

/// Shared context passed to job workers so they can reach the pipeline stages.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub converter: Arc<dyn DocumentConverter>,
    pub retry: RetryPolicy,
    /// Used when a payload does not name a template.
    pub default_template: TemplateId,
    /// Part of each lease held back for persisting and settling; render and
    /// convert must finish before `visibility_deadline - settle_margin`.
    pub settle_margin: Duration,
}
