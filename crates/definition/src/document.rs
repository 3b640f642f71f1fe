//! Raw YAML document shapes.

use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::{DefinitionError, DefinitionResult};

/// `[-][[[dd:]hh:]mm:]ss`
static CLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-)?(?:(?:(?:(\d+):)?(\d+):)?(\d+):)?(\d+)$").expect("clock regex is valid")
});

/// Top level of a workflow document, after metatask expansion.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct WorkflowDoc {
    #[serde(default)]
    pub realtime: bool,
    #[serde(default)]
    pub max_flow_rate: Option<f64>,
    #[serde(default)]
    pub reservation_lead_time: Option<Seconds>,
    #[serde(default)]
    pub admission_step: Option<Seconds>,
    #[serde(default)]
    pub log: Option<CycleStringDoc>,
    #[serde(default)]
    pub schedules: Mapping,
    #[serde(default)]
    pub tasks: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TaskDoc {
    pub id: String,
    pub command: String,
    pub scheduler: String,
    #[serde(default)]
    pub cycles: Option<Vec<String>>,
    #[serde(default)]
    pub tries: u32,
    #[serde(default)]
    pub throttle: u32,
    #[serde(default)]
    pub start_timeout: Option<Seconds>,
    #[serde(default)]
    pub end_timeout: Option<Seconds>,
    #[serde(default)]
    pub properties: BTreeMap<String, CycleStringDoc>,
    #[serde(default)]
    pub environment: BTreeMap<String, CycleStringDoc>,
    #[serde(default)]
    pub dependency: Option<Value>,
    #[serde(default)]
    pub hang_dependency: Option<Value>,
    #[serde(default)]
    pub deadline_dependency: Option<Value>,
}

/// A duration given as a plain number of seconds or as `[-][[[dd:]hh:]mm:]ss`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum Seconds {
    Count(i64),
    Clock(String),
}

impl Seconds {
    pub fn to_seconds(&self) -> DefinitionResult<i64> {
        match self {
            Seconds::Count(n) => Ok(*n),
            Seconds::Clock(text) => parse_clock(text),
        }
    }
}

pub(crate) fn parse_clock(text: &str) -> DefinitionResult<i64> {
    let invalid = || DefinitionError::Invalid(format!("bad duration '{text}'"));
    let caps = CLOCK_REGEX.captures(text.trim()).ok_or_else(invalid)?;

    let field = |i: usize| -> DefinitionResult<i64> {
        caps.get(i)
            .map_or(Ok(0), |m| m.as_str().parse::<i64>().map_err(|_| invalid()))
    };
    let seconds = field(2)? * 86_400 + field(3)? * 3_600 + field(4)? * 60 + field(5)?;
    Ok(if caps.get(1).is_some() { -seconds } else { seconds })
}

/// A cycle string: plain template or `{str, offset}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum CycleStringDoc {
    Plain(String),
    Offset {
        #[serde(rename = "str")]
        template: String,
        #[serde(default)]
        offset: Option<Seconds>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TaskRefDoc {
    pub task: String,
    #[serde(default)]
    pub cycle: i32,
    #[serde(default)]
    pub state: TaskStateDoc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TaskStateDoc {
    #[default]
    DoneOkay,
    Done,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileDoc {
    pub path: CycleStringDoc,
    #[serde(default)]
    pub age: Option<Seconds>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TimeDoc {
    pub at: String,
    #[serde(default)]
    pub offset: Option<Seconds>,
}
