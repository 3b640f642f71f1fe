//! Error types for the core model.

/// Errors raised while building or expanding a cycle schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// A field does not follow the `n`, `a-b`, `a-b/c` grammar
    #[error("invalid {field} field '{value}'")]
    InvalidField {
        /// Field name (year, month, ...)
        field: &'static str,
        /// Offending text
        value: String,
    },

    /// A value lies outside the calendar range of its field
    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u32,
        /// Smallest allowed value
        min: u32,
        /// Largest allowed value
        max: u32,
    },

    /// The schedule text does not have five whitespace separated fields
    #[error("schedule '{0}' must have five fields: year month day hour minute")]
    FieldCount(String),

    /// Enumerating every cycle needs a bounded year field
    #[error("cannot expand cycles of schedule '{0}' when year is '*'")]
    UnboundedYear(String),
}

/// Errors raised by cycle-string templates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// The strftime template contains an unknown specifier
    #[error("invalid cycle string template '{0}'")]
    Invalid(String),
}
