use std::time::Instant;

use askama::Template;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, warn};

use super::{
    templates::{PropertyBriefTemplate, PropertySummaryTemplate},
    types::{RenderError, RenderRequest, RenderedDocument, TemplateId, TemplateRenderer},
    view::{PropertyBriefView, PropertySummaryView},
};

const SUMMARY_TITLE: &str = "Property Summary";
const BRIEF_TITLE: &str = "Property Brief";

/// Renders report templates compiled in with askama.
#[derive(Debug, Clone)]
pub struct AskamaTemplateRenderer {
    brand_name: String,
}

impl AskamaTemplateRenderer {
    pub fn new(brand_name: impl Into<String>) -> Self {
        Self {
            brand_name: brand_name.into(),
        }
    }

    pub fn brand_name(&self) -> &str {
        &self.brand_name
    }

    fn render_template(
        &self,
        template: TemplateId,
        request: &RenderRequest,
        generated_at: &str,
    ) -> Result<String, RenderError> {
        let rendered = match template {
            TemplateId::PropertySummary => {
                let property = PropertySummaryView::from_data(&request.data)?;
                PropertySummaryTemplate {
                    brand_name: &self.brand_name,
                    title: SUMMARY_TITLE,
                    generated_at,
                    property: &property,
                }
                .render()
            }
            TemplateId::PropertyBrief => {
                let property = PropertyBriefView::from_data(&request.data)?;
                PropertyBriefTemplate {
                    brand_name: &self.brand_name,
                    title: BRIEF_TITLE,
                    generated_at,
                    property: &property,
                }
                .render()
            }
        };

        rendered.map_err(|err| RenderError::Template {
            template,
            message: err.to_string(),
        })
    }
}

impl TemplateRenderer for AskamaTemplateRenderer {
    fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, RenderError> {
        let started_at = Instant::now();
        let template: TemplateId = request.template_id.parse()?;
        let generated_at = format_generated_at(request.generated_at);

        match self.render_template(template, request, &generated_at) {
            Ok(html) => {
                debug!(
                    target = "application::render::renderer",
                    op = "renderer::render",
                    result = "ok",
                    template = template.as_str(),
                    html_bytes = html.len(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "report template rendered"
                );
                Ok(RenderedDocument { template, html })
            }
            Err(err) => {
                warn!(
                    target = "application::render::renderer",
                    op = "renderer::render",
                    result = "error",
                    template = template.as_str(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "report template failed to render"
                );
                Err(err)
            }
        }
    }
}

fn format_generated_at(value: OffsetDateTime) -> String {
    value
        .to_offset(time::UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}
