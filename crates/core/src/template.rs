//! Cycle strings: strftime templates rendered against a cycle.

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::cycle::Cycle;
use crate::error::TemplateError;

/// A string template expanded per cycle.
///
/// Besides the standard strftime specifiers, `%n` expands to the number of
/// days in the month, `%o` to the lowercase month abbreviation and `%O` to
/// the lowercase full month name. The template is rendered at
/// `cycle + offset` seconds, in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleString {
    template: String,
    #[serde(default)]
    offset: i64,
}

impl CycleString {
    /// Create a template, rejecting unknown strftime specifiers.
    pub fn new(template: impl Into<String>) -> Result<Self, TemplateError> {
        let template = template.into();
        let probe = template
            .replace("%n", "")
            .replace("%o", "")
            .replace("%O", "");
        if StrftimeItems::new(&probe).any(|item| matches!(item, Item::Error)) {
            return Err(TemplateError::Invalid(template));
        }
        Ok(Self { template, offset: 0 })
    }

    /// A template with no specifiers at all.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            template: text.into().replace('%', "%%"),
            offset: 0,
        }
    }

    /// Render at `cycle + seconds` instead of `cycle`.
    pub fn with_offset(mut self, seconds: i64) -> Self {
        self.offset = seconds;
        self
    }

    /// The raw template text.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Offset in seconds.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Expand the template for `cycle`.
    pub fn render(&self, cycle: Cycle) -> String {
        let reftime = cycle
            .time()
            .checked_add_signed(Duration::seconds(self.offset))
            .unwrap_or(cycle.time());

        // Expand the extension specifiers, leaving `%%` and the rest to chrono
        let mut expanded = String::with_capacity(self.template.len());
        let mut chars = self.template.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                expanded.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => {
                    expanded.push_str(&days_in_month(reftime.year(), reftime.month()).to_string())
                }
                Some('o') => expanded.push_str(&reftime.format("%b").to_string().to_lowercase()),
                Some('O') => expanded.push_str(&reftime.format("%B").to_string().to_lowercase()),
                Some(other) => {
                    expanded.push('%');
                    expanded.push(other);
                }
                None => expanded.push('%'),
            }
        }

        let mut out = String::new();
        if write!(out, "{}", reftime.format(&expanded)).is_err() {
            return expanded;
        }
        out
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(31)
}
