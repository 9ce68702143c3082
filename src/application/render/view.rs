//! View models extracted from raw property data.
//!
//! Every optional section is an `Option`: the section exists only when at least
//! one of its backing fields carries a value, so templates never print an
//! empty heading.

use serde_json::{Map, Value};

use super::types::{RenderError, TemplateId};

type Data = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PropertySummaryView {
    pub sku: String,
    pub overview: Option<OverviewView>,
    pub financials: Option<FinancialsView>,
    pub additional: Option<AdditionalInfoView>,
    pub gallery: Option<Vec<ImageView>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OverviewView {
    pub title: Option<String>,
    pub property_type: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FinancialsView {
    pub price: Option<String>,
    pub annual_rent: Option<String>,
    pub rental_yield: Option<String>,
    pub service_charge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AdditionalInfoView {
    pub facts: Vec<FactView>,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FactView {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageView {
    pub url: String,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PropertyBriefView {
    pub sku: String,
    pub price: String,
    pub title: Option<String>,
    pub city: Option<String>,
}

impl PropertySummaryView {
    pub(crate) fn from_data(data: &Data) -> Result<Self, RenderError> {
        let template = TemplateId::PropertySummary;
        let sku = required_text(data, template, "sku")?;

        let overview = OverviewView {
            title: optional_text(data, "title"),
            property_type: optional_text(data, "type"),
            city: optional_text(data, "city"),
            address: optional_text(data, "address"),
            description: optional_text(data, "description"),
        };
        let overview = (overview.title.is_some()
            || overview.property_type.is_some()
            || overview.city.is_some()
            || overview.address.is_some()
            || overview.description.is_some())
        .then_some(overview);

        let currency = optional_text(data, "currency");
        let financials = FinancialsView {
            price: optional_amount(data, "price", currency.as_deref()),
            annual_rent: optional_amount(data, "annual_rent", currency.as_deref()),
            rental_yield: optional_percentage(data, "rental_yield"),
            service_charge: optional_amount(data, "service_charge", currency.as_deref()),
        };
        let financials = (financials.price.is_some()
            || financials.annual_rent.is_some()
            || financials.rental_yield.is_some()
            || financials.service_charge.is_some())
        .then_some(financials);

        let additional = AdditionalInfoView {
            facts: facts(data, "additional_info"),
            features: string_list(data, "features"),
        };
        let additional =
            (!additional.facts.is_empty() || !additional.features.is_empty()).then_some(additional);

        let images = images(data, "images");
        let gallery = (!images.is_empty()).then_some(images);

        Ok(Self {
            sku,
            overview,
            financials,
            additional,
            gallery,
        })
    }
}

impl PropertyBriefView {
    pub(crate) fn from_data(data: &Data) -> Result<Self, RenderError> {
        let template = TemplateId::PropertyBrief;
        let sku = required_text(data, template, "sku")?;
        let currency = optional_text(data, "currency");
        let price = optional_amount(data, "price", currency.as_deref()).ok_or(
            RenderError::MissingField {
                template,
                field: "price",
            },
        )?;

        Ok(Self {
            sku,
            price,
            title: optional_text(data, "title"),
            city: optional_text(data, "city"),
        })
    }
}

fn required_text(
    data: &Data,
    template: TemplateId,
    field: &'static str,
) -> Result<String, RenderError> {
    optional_text(data, field).ok_or(RenderError::MissingField { template, field })
}

fn optional_text(data: &Data, field: &str) -> Option<String> {
    data.get(field).and_then(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(if *flag { "Yes" } else { "No" }.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn optional_amount(data: &Data, field: &str, currency: Option<&str>) -> Option<String> {
    let amount = match data.get(field)? {
        Value::Number(number) => format_amount(number.as_f64()?),
        other => scalar_text(other)?,
    };

    Some(match currency {
        Some(code) => format!("{amount} {code}"),
        None => amount,
    })
}

fn optional_percentage(data: &Data, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::Number(number) => Some(format!("{:.2}%", number.as_f64()?)),
        other => scalar_text(other),
    }
}

/// Two decimals with comma-grouped thousands, e.g. `1,250,000.00`.
pub fn format_amount(value: f64) -> String {
    let formatted = format!("{:.2}", value.abs());
    let (whole, fraction) = formatted.split_once('.').unwrap_or((&formatted, "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if value < 0.0 { "-" } else { "" };
    format!("{sign}{grouped}.{fraction}")
}

fn facts(data: &Data, field: &str) -> Vec<FactView> {
    let Some(Value::Object(map)) = data.get(field) else {
        return Vec::new();
    };

    map.iter()
        .filter_map(|(key, value)| {
            scalar_text(value).map(|value| FactView {
                label: humanize_key(key),
                value,
            })
        })
        .collect()
}

fn string_list(data: &Data, field: &str) -> Vec<String> {
    let Some(Value::Array(items)) = data.get(field) else {
        return Vec::new();
    };

    items.iter().filter_map(scalar_text).collect()
}

fn images(data: &Data, field: &str) -> Vec<ImageView> {
    let Some(Value::Array(items)) = data.get(field) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(_) => scalar_text(item).map(|url| ImageView { url, caption: None }),
            Value::Object(image) => {
                let url = image.get("url").and_then(scalar_text)?;
                let caption = image.get("caption").and_then(scalar_text);
                Some(ImageView { url, caption })
            }
            _ => None,
        })
        .collect()
}

fn humanize_key(key: &str) -> String {
    let spaced = key.replace(['_', '-'], " ");
    let mut chars = spaced.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
