use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::{Captures, Regex};

use crate::error::ValidationError;

pub const PLACEHOLDERS: [&str; 5] = ["symbol", "number", "month", "year", "warehouse"];

const MAX_NUMBER_WIDTH: usize = 20;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder pattern is valid"))
}

/// Values substituted into a template for one issued number.
#[derive(Debug, Clone)]
pub struct NumberContext<'a> {
    pub symbol: &'a str,
    pub number: u64,
    pub date: NaiveDate,
    pub warehouse: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Symbol,
    Number { width: Option<usize> },
    Month,
    Year,
    Warehouse,
}

fn parse_placeholder(body: &str) -> Result<Placeholder, ValidationError> {
    let (name, width) = match body.split_once(':') {
        Some((name, width)) => (name, Some(width)),
        None => (body, None),
    };

    let placeholder = match name {
        "symbol" => Placeholder::Symbol,
        "number" => Placeholder::Number { width: None },
        "month" => Placeholder::Month,
        "year" => Placeholder::Year,
        "warehouse" => Placeholder::Warehouse,
        other => return Err(ValidationError::UnknownPlaceholder(other.to_string())),
    };

    match (placeholder, width) {
        (_, None) => Ok(placeholder),
        (Placeholder::Number { .. }, Some(width)) => match width.parse::<usize>() {
            Ok(w) if (1..=MAX_NUMBER_WIDTH).contains(&w) => Ok(Placeholder::Number { width: Some(w) }),
            _ => Err(ValidationError::InvalidWidth {
                name: name.to_string(),
                width: width.to_string(),
            }),
        },
        (_, Some(width)) => Err(ValidationError::InvalidWidth {
            name: name.to_string(),
            width: width.to_string(),
        }),
    }
}

/// Checks that every `{...}` group in the template is a known placeholder.
pub fn validate_template(template: &str) -> Result<(), ValidationError> {
    if template.trim().is_empty() {
        return Err(ValidationError::EmptyTemplate);
    }
    for capture in placeholder_regex().captures_iter(template) {
        parse_placeholder(&capture[1])?;
    }
    Ok(())
}

/// Renders document numbers from validated templates.
#[derive(Debug, Clone, Default)]
pub struct NumberFormatter {}

impl NumberFormatter {
    pub fn new() -> Self {
        NumberFormatter {}
    }

    /// Substitutes placeholders and keeps every other character verbatim.
    /// Unrecognized groups are left as-is; templates are validated on write.
    pub fn render(&self, template: &str, context: &NumberContext<'_>) -> String {
        placeholder_regex()
            .replace_all(template, |capture: &Captures| {
                match parse_placeholder(&capture[1]) {
                    Ok(Placeholder::Symbol) => context.symbol.to_string(),
                    Ok(Placeholder::Number { width: None }) => context.number.to_string(),
                    Ok(Placeholder::Number { width: Some(width) }) => {
                        format!("{:0width$}", context.number, width = width)
                    }
                    Ok(Placeholder::Month) => context.date.format("%m").to_string(),
                    Ok(Placeholder::Year) => context.date.format("%Y").to_string(),
                    Ok(Placeholder::Warehouse) => context.warehouse.to_string(),
                    Err(_) => capture[0].to_string(),
                }
            })
            .into_owned()
    }
}
