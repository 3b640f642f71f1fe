//! Task definition - the static description of a unit of recurring work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cycle::Cycle;
use crate::dependency::DependencyNode;
use crate::schedule::CycleSchedule;
use crate::template::CycleString;

/// What a task runs, where, and under which conditions.
///
/// Definitions are replaced wholesale on every reload; runtime state lives
/// elsewhere and survives the replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique task id
    pub id: String,

    /// Command submitted to the batch system
    pub command: String,

    /// Name of the batch system that runs the command
    pub scheduler: String,

    /// Schedules whose cycles this task runs for
    pub schedules: Vec<CycleSchedule>,

    /// Maximum submissions per cycle (0 = unlimited)
    pub tries: u32,

    /// Maximum in-flight jobs across all cycles (0 = unlimited)
    pub throttle: u32,

    /// Batch attributes, rendered per cycle
    pub properties: BTreeMap<String, CycleString>,

    /// Environment passed to the job, rendered per cycle
    pub environment: BTreeMap<String, CycleString>,

    /// Must resolve before the task is submitted
    pub dependency: Option<DependencyNode>,

    /// A running job is considered hung once this resolves
    pub hang_dependency: Option<DependencyNode>,

    /// The task expires for a cycle once this resolves
    pub deadline_dependency: Option<DependencyNode>,

    /// Seconds after the cycle time by which the job must have started
    pub start_timeout: Option<u64>,

    /// Seconds after the cycle time by which the job must have finished
    pub end_timeout: Option<u64>,
}

impl TaskDefinition {
    /// Create a definition with no schedules, limits or dependencies.
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        scheduler: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            scheduler: scheduler.into(),
            schedules: Vec::new(),
            tries: 0,
            throttle: 0,
            properties: BTreeMap::new(),
            environment: BTreeMap::new(),
            dependency: None,
            hang_dependency: None,
            deadline_dependency: None,
            start_timeout: None,
            end_timeout: None,
        }
    }

    /// Add a schedule.
    pub fn schedule(mut self, schedule: CycleSchedule) -> Self {
        self.schedules.push(schedule);
        self
    }

    /// Set the retry budget.
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    /// Set the throttle.
    pub fn throttle(mut self, throttle: u32) -> Self {
        self.throttle = throttle;
        self
    }

    /// Add a batch attribute.
    pub fn property(mut self, name: impl Into<String>, value: CycleString) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Add an environment binding.
    pub fn env(mut self, name: impl Into<String>, value: CycleString) -> Self {
        self.environment.insert(name.into(), value);
        self
    }

    /// Set the start dependency.
    pub fn depends_on(mut self, node: DependencyNode) -> Self {
        self.dependency = Some(node);
        self
    }

    /// Set the hang dependency.
    pub fn hangs_when(mut self, node: DependencyNode) -> Self {
        self.hang_dependency = Some(node);
        self
    }

    /// Set the deadline dependency.
    pub fn expires_when(mut self, node: DependencyNode) -> Self {
        self.deadline_dependency = Some(node);
        self
    }

    /// Whether any of the task's schedules contains `cycle`.
    pub fn applies_to(&self, cycle: Cycle) -> bool {
        self.schedules.iter().any(|s| s.has_cycle(cycle))
    }

    /// Properties expanded for `cycle`.
    pub fn render_properties(&self, cycle: Cycle) -> BTreeMap<String, String> {
        render(&self.properties, cycle)
    }

    /// Environment expanded for `cycle`.
    pub fn render_environment(&self, cycle: Cycle) -> BTreeMap<String, String> {
        render(&self.environment, cycle)
    }
}

fn render(values: &BTreeMap<String, CycleString>, cycle: Cycle) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(name, value)| (name.clone(), value.render(cycle)))
        .collect()
}
