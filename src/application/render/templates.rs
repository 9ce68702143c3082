use askama::Template;

use super::view::{PropertyBriefView, PropertySummaryView};

#[derive(Template)]
#[template(path = "reports/property_summary.html")]
pub(crate) struct PropertySummaryTemplate<'a> {
    pub brand_name: &'a str,
    pub title: &'a str,
    pub generated_at: &'a str,
    pub property: &'a PropertySummaryView,
}

#[derive(Template)]
#[template(path = "reports/property_brief.html")]
pub(crate) struct PropertyBriefTemplate<'a> {
    pub brand_name: &'a str,
    pub title: &'a str,
    pub generated_at: &'a str,
    pub property: &'a PropertyBriefView,
}
