//! Cron-like cycle schedules over (year, month, day, hour, minute).
//!
//! Each field is either `*` or a comma separated list of singletons (`6`),
//! ranges (`1-5`) and strided ranges (`0-18/6`). All membership tests use the
//! UTC components of a [`Cycle`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::LazyLock;

use crate::cycle::Cycle;
use crate::error::ScheduleError;

static TERM_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(?:-(\d+)(?:/(\d+))?)?$").expect("schedule term regex is valid")
});

const YEARS: RangeInclusive<u32> = 1970..=9999;
const MONTHS: RangeInclusive<u32> = 1..=12;
const DAYS: RangeInclusive<u32> = 1..=31;
const HOURS: RangeInclusive<u32> = 0..=23;
const MINUTES: RangeInclusive<u32> = 0..=59;

/// The values one schedule field accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSet {
    /// `*`: every value matches
    Any,
    /// Sorted, de-duplicated explicit values
    Explicit(Vec<u32>),
}

impl FieldSet {
    /// Parse one field. `bounds` is the calendar range of the field.
    pub fn parse(
        field: &'static str,
        text: &str,
        bounds: RangeInclusive<u32>,
    ) -> Result<Self, ScheduleError> {
        let text = text.trim();
        if text == "*" {
            return Ok(Self::Any);
        }

        let invalid = || ScheduleError::InvalidField {
            field,
            value: text.to_string(),
        };

        let mut values = Vec::new();
        for term in text.split(',') {
            let caps = TERM_REGEX.captures(term.trim()).ok_or_else(invalid)?;
            let number = |i: usize| -> Result<Option<u32>, ScheduleError> {
                caps.get(i)
                    .map(|m| m.as_str().parse::<u32>().map_err(|_| invalid()))
                    .transpose()
            };
            let start = number(1)?.ok_or_else(invalid)?;
            let end = number(2)?.unwrap_or(start);
            let stride = number(3)?.unwrap_or(1);
            if end < start || stride == 0 {
                return Err(invalid());
            }
            for value in [start, end] {
                if !bounds.contains(&value) {
                    return Err(ScheduleError::OutOfRange {
                        field,
                        value,
                        min: *bounds.start(),
                        max: *bounds.end(),
                    });
                }
            }
            values.extend((start..=end).step_by(stride as usize));
        }

        values.sort_unstable();
        values.dedup();
        Ok(Self::Explicit(values))
    }

    /// Membership test; `Any` always matches.
    pub fn contains(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Explicit(values) => values.binary_search(&value).is_ok(),
        }
    }

    /// Whether this field is the wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    fn values(&self, full: RangeInclusive<u32>) -> Vec<u32> {
        match self {
            Self::Any => full.collect(),
            Self::Explicit(values) => values.clone(),
        }
    }

    fn first_or(&self, default: u32) -> u32 {
        match self {
            Self::Explicit(values) => values.first().copied().unwrap_or(default),
            Self::Any => default,
        }
    }

    fn last_or(&self, default: u32) -> u32 {
        match self {
            Self::Explicit(values) => values.last().copied().unwrap_or(default),
            Self::Any => default,
        }
    }
}

/// An immutable cron-like recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleSpec", into = "ScheduleSpec")]
pub struct CycleSchedule {
    id: String,
    spec: String,
    year: FieldSet,
    month: FieldSet,
    day: FieldSet,
    hour: FieldSet,
    minute: FieldSet,
    first: Option<Cycle>,
    last: Option<Cycle>,
}

/// Persisted form of a schedule: its id and the original field text.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduleSpec {
    id: String,
    fields: String,
}

impl TryFrom<ScheduleSpec> for CycleSchedule {
    type Error = ScheduleError;

    fn try_from(spec: ScheduleSpec) -> Result<Self, Self::Error> {
        CycleSchedule::parse(spec.id, &spec.fields)
    }
}

impl From<CycleSchedule> for ScheduleSpec {
    fn from(schedule: CycleSchedule) -> Self {
        ScheduleSpec {
            id: schedule.id,
            fields: schedule.spec,
        }
    }
}

impl CycleSchedule {
    /// Parse `"year month day hour minute"`.
    pub fn parse(id: impl Into<String>, fields: &str) -> Result<Self, ScheduleError> {
        let parts: Vec<&str> = fields.split_whitespace().collect();
        let [year, month, day, hour, minute] = parts[..] else {
            return Err(ScheduleError::FieldCount(fields.to_string()));
        };
        Self::new(id, year, month, day, hour, minute)
    }

    /// Build a schedule from its five fields.
    pub fn new(
        id: impl Into<String>,
        year: &str,
        month: &str,
        day: &str,
        hour: &str,
        minute: &str,
    ) -> Result<Self, ScheduleError> {
        let mut schedule = Self {
            id: id.into(),
            spec: format!("{} {} {} {} {}", year, month, day, hour, minute),
            year: FieldSet::parse("year", year, 0..=9999)?,
            month: FieldSet::parse("month", month, MONTHS)?,
            day: FieldSet::parse("day", day, DAYS)?,
            hour: FieldSet::parse("hour", hour, HOURS)?,
            minute: FieldSet::parse("minute", minute, MINUTES)?,
            first: None,
            last: None,
        };
        schedule.first = schedule.search_first();
        schedule.last = schedule.search_last();
        Ok(schedule)
    }

    /// Schedule id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the year field is `*`.
    pub fn has_unbounded_year(&self) -> bool {
        self.year.is_any()
    }

    /// Earliest valid cycle. `None` only when no field combination is a real date.
    pub fn first(&self) -> Option<Cycle> {
        self.first
    }

    /// Latest valid cycle. `None` only when the schedule is unsatisfiable.
    pub fn last(&self) -> Option<Cycle> {
        self.last
    }

    fn search_first(&self) -> Option<Cycle> {
        for year in self.year.values(YEARS) {
            for month in self.month.values(MONTHS) {
                for day in self.day.values(DAYS) {
                    let cycle = Cycle::from_fields(
                        year as i32,
                        month,
                        day,
                        self.hour.first_or(0),
                        self.minute.first_or(0),
                    );
                    if cycle.is_some() {
                        return cycle;
                    }
                }
            }
        }
        None
    }

    fn search_last(&self) -> Option<Cycle> {
        for year in self.year.values(YEARS).into_iter().rev() {
            for month in self.month.values(MONTHS).into_iter().rev() {
                for day in self.day.values(DAYS).into_iter().rev() {
                    let cycle = Cycle::from_fields(
                        year as i32,
                        month,
                        day,
                        self.hour.last_or(23),
                        self.minute.last_or(59),
                    );
                    if cycle.is_some() {
                        return cycle;
                    }
                }
            }
        }
        None
    }

    /// Whether `cycle` matches every field.
    pub fn has_cycle(&self, cycle: Cycle) -> bool {
        self.date_matches(cycle)
            && self.hour.contains(cycle.hour())
            && self.minute.contains(cycle.minute())
    }

    fn date_matches(&self, cycle: Cycle) -> bool {
        u32::try_from(cycle.year()).is_ok_and(|year| self.year.contains(year))
            && self.month.contains(cycle.month())
            && self.day.contains(cycle.day())
    }

    /// Smallest valid cycle strictly after `after`, bounded by [`last`](Self::last).
    ///
    /// Walks forward a minute at a time; days and hours that cannot match are
    /// skipped whole since membership is decided per field.
    pub fn next(&self, after: Cycle) -> Option<Cycle> {
        let (first, last) = (self.first?, self.last?);
        if after < first {
            return Some(first);
        }

        let mut candidate = after.add_minutes(1)?;
        while candidate <= last {
            if !self.date_matches(candidate) {
                let midnight =
                    Cycle::from_fields(candidate.year(), candidate.month(), candidate.day(), 0, 0)?;
                candidate = midnight.add_minutes(24 * 60)?;
            } else if !self.hour.contains(candidate.hour()) {
                candidate = candidate.add_minutes(60 - i64::from(candidate.minute()))?;
            } else if self.minute.contains(candidate.minute()) {
                return Some(candidate);
            } else {
                candidate = candidate.add_minutes(1)?;
            }
        }
        None
    }

    /// Largest valid cycle strictly before `before`, bounded by [`first`](Self::first).
    pub fn prev(&self, before: Cycle) -> Option<Cycle> {
        let (first, last) = (self.first?, self.last?);
        if before > last {
            return Some(last);
        }

        let mut candidate = before.add_minutes(-1)?;
        while candidate >= first {
            if !self.date_matches(candidate) {
                let midnight =
                    Cycle::from_fields(candidate.year(), candidate.month(), candidate.day(), 0, 0)?;
                candidate = midnight.add_minutes(-1)?;
            } else if !self.hour.contains(candidate.hour()) {
                candidate = candidate.add_minutes(-(i64::from(candidate.minute()) + 1))?;
            } else if self.minute.contains(candidate.minute()) {
                return Some(candidate);
            } else {
                candidate = candidate.add_minutes(-1)?;
            }
        }
        None
    }

    /// Latest valid cycle not after `at`; an exact match counts.
    pub fn latest_not_after(&self, at: Cycle) -> Option<Cycle> {
        if self.has_cycle(at) {
            Some(at)
        } else {
            self.prev(at)
        }
    }

    /// Every valid cycle, ascending. The year field must be bounded.
    pub fn enumerate(&self) -> Result<Vec<Cycle>, ScheduleError> {
        if self.year.is_any() {
            return Err(ScheduleError::UnboundedYear(self.id.clone()));
        }

        let hours = self.hour.values(HOURS);
        let minutes = self.minute.values(MINUTES);
        let mut cycles = Vec::new();
        for year in self.year.values(YEARS) {
            for month in self.month.values(MONTHS) {
                for day in self.day.values(DAYS) {
                    for &hour in &hours {
                        for &minute in &minutes {
                            if let Some(cycle) =
                                Cycle::from_fields(year as i32, month, day, hour, minute)
                            {
                                cycles.push(cycle);
                            }
                        }
                    }
                }
            }
        }
        Ok(cycles)
    }
}

impl fmt::Display for CycleSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.spec)
    }
}

/// Move `offset` valid cycles away from `cycle` across a set of schedules.
///
/// Positive offsets step forward through the union of the schedules, negative
/// offsets step backward. Zero returns `cycle` unchanged.
pub fn step_cycles(schedules: &[CycleSchedule], cycle: Cycle, offset: i32) -> Option<Cycle> {
    let mut current = cycle;
    for _ in 0..offset.unsigned_abs() {
        current = if offset > 0 {
            schedules.iter().filter_map(|s| s.next(current)).min()?
        } else {
            schedules.iter().filter_map(|s| s.prev(current)).max()?
        };
    }
    Some(current)
}
