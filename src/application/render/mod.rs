//! Template rendering for property reports.

mod renderer;
mod templates;
mod types;
mod view;

pub use renderer::AskamaTemplateRenderer;
pub use types::{RenderError, RenderRequest, RenderedDocument, TemplateId, TemplateRenderer};
pub use view::format_amount;
