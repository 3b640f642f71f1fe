//! Dependency trees gating task start, hang detection and deadlines.
//!
//! Evaluation is read-only: resolving a tree never submits work or mutates
//! task state, so it is safe to evaluate speculatively and repeatedly.

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::cycle::Cycle;
use crate::template::CycleString;
use crate::Time;

/// Read access to task completion state, keyed by task id.
///
/// Dependency predicates refer to tasks by id and look them up through this
/// trait instead of holding references to them.
pub trait TaskLookup {
    /// Whether `task` finished successfully for `cycle`.
    fn done_okay(&self, task: &str, cycle: Cycle) -> bool;

    /// Whether `task` finished for `cycle`, successfully or by giving up.
    fn done(&self, task: &str, cycle: Cycle) -> bool;

    /// The cycle `offset` valid cycles away from `cycle` in `task`'s schedules.
    fn offset_cycle(&self, task: &str, cycle: Cycle, offset: i32) -> Option<Cycle>;
}

/// Everything a predicate may consult.
pub struct EvalContext<'a> {
    /// Task state lookup
    pub tasks: &'a dyn TaskLookup,
    /// Wall-clock time of the evaluation
    pub now: Time,
}

/// Which completion state a task predicate requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCondition {
    /// Finished with exit status 0
    #[default]
    DoneOkay,
    /// Finished, successfully or by exhausting its retries
    Done,
}

/// Requires another task's completion for a cycle relative to this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPredicate {
    /// Referenced task id
    pub task: String,
    /// Offset in the referenced task's cycles (-1 = its previous cycle)
    #[serde(default)]
    pub cycle_offset: i32,
    /// Required completion state
    #[serde(default)]
    pub condition: TaskCondition,
}

/// Requires a file to exist and be at least `min_age` seconds old.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePredicate {
    /// Path template
    pub path: CycleString,
    /// Minimum age in seconds
    #[serde(default)]
    pub min_age: u64,
}

/// Requires the wall clock to be past a `YYYYMMDDHHMMSS` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePredicate {
    /// Template rendering to `YYYYMMDDHHMMSS`
    pub at: CycleString,
}

/// A node of a dependency tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyNode {
    /// Negation of a single operand
    Not(Box<DependencyNode>),
    /// Conjunction tolerating up to `max_missing` unresolved operands
    And {
        /// Operands
        operands: Vec<DependencyNode>,
        /// How many operands may be unresolved
        #[serde(default)]
        max_missing: usize,
    },
    /// Disjunction
    Or(Vec<DependencyNode>),
    /// Task completion
    Task(TaskPredicate),
    /// File existence and age
    File(FilePredicate),
    /// Wall-clock time
    Time(TimePredicate),
}

impl DependencyNode {
    /// Plain conjunction: every operand must resolve.
    pub fn all(operands: Vec<DependencyNode>) -> Self {
        Self::And {
            operands,
            max_missing: 0,
        }
    }

    /// Task predicate on `done_okay` for the same cycle.
    pub fn task(task: impl Into<String>) -> Self {
        Self::Task(TaskPredicate {
            task: task.into(),
            cycle_offset: 0,
            condition: TaskCondition::DoneOkay,
        })
    }

    /// Whether the tree is satisfied for `cycle`.
    pub fn resolved(&self, cycle: Cycle, ctx: &EvalContext<'_>) -> bool {
        match self {
            Self::Not(operand) => !operand.resolved(cycle, ctx),
            Self::And {
                operands,
                max_missing,
            } => {
                let mut missing = 0;
                for operand in operands {
                    if !operand.resolved(cycle, ctx) {
                        missing += 1;
                        if missing > *max_missing {
                            return false;
                        }
                    }
                }
                true
            }
            Self::Or(operands) => operands.iter().any(|operand| operand.resolved(cycle, ctx)),
            Self::Task(predicate) => predicate.resolved(cycle, ctx),
            Self::File(predicate) => predicate.resolved(cycle, ctx.now),
            Self::Time(predicate) => predicate.resolved(cycle, ctx.now),
        }
    }

    /// Ids of every task referenced anywhere in the tree.
    pub fn task_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_task_refs(&mut refs);
        refs
    }

    fn collect_task_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
        match self {
            Self::Not(operand) => operand.collect_task_refs(refs),
            Self::And { operands, .. } | Self::Or(operands) => {
                for operand in operands {
                    operand.collect_task_refs(refs);
                }
            }
            Self::Task(predicate) => refs.push(&predicate.task),
            Self::File(_) | Self::Time(_) => {}
        }
    }
}

impl TaskPredicate {
    fn resolved(&self, cycle: Cycle, ctx: &EvalContext<'_>) -> bool {
        let Some(target) = ctx.tasks.offset_cycle(&self.task, cycle, self.cycle_offset) else {
            debug!(task = %self.task, offset = self.cycle_offset, "No cycle at offset, dependency not satisfied");
            return false;
        };
        let resolved = match self.condition {
            TaskCondition::DoneOkay => ctx.tasks.done_okay(&self.task, target),
            TaskCondition::Done => ctx.tasks.done(&self.task, target),
        };
        debug!(task = %self.task, cycle = %target, resolved, "Task dependency checked");
        resolved
    }
}

impl FilePredicate {
    fn resolved(&self, cycle: Cycle, now: Time) -> bool {
        let path = self.path.render(cycle);
        let modified = match std::fs::metadata(Path::new(&path)).and_then(|m| m.modified()) {
            Ok(modified) => Time::from(modified),
            Err(_) => {
                debug!(path = %path, "File dependency not satisfied (file does not exist)");
                return false;
            }
        };
        let age = now.signed_duration_since(modified).num_seconds();
        let resolved = age >= 0 && age as u64 >= self.min_age;
        debug!(path = %path, age, resolved, "File dependency checked");
        resolved
    }
}

impl TimePredicate {
    fn resolved(&self, cycle: Cycle, now: Time) -> bool {
        let text = self.at.render(cycle);
        match NaiveDateTime::parse_from_str(&text, "%Y%m%d%H%M%S") {
            Ok(at) => {
                let resolved = now > Utc.from_utc_datetime(&at);
                debug!(time = %text, resolved, "Time dependency checked");
                resolved
            }
            Err(e) => {
                warn!(time = %text, error = %e, "Time dependency does not render to YYYYMMDDHHMMSS");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeTasks {
        okay: HashSet<(String, Cycle)>,
        crashed: HashSet<(String, Cycle)>,
    }

    impl TaskLookup for FakeTasks {
        fn done_okay(&self, task: &str, cycle: Cycle) -> bool {
            self.okay.contains(&(task.to_string(), cycle))
        }

        fn done(&self, task: &str, cycle: Cycle) -> bool {
            self.done_okay(task, cycle) || self.crashed.contains(&(task.to_string(), cycle))
        }

        fn offset_cycle(&self, _task: &str, cycle: Cycle, offset: i32) -> Option<Cycle> {
            cycle.add_minutes(i64::from(offset) * 60)
        }
    }

    fn cycle() -> Cycle {
        Cycle::from_fields(2024, 1, 1, 12, 0).unwrap()
    }

    fn constant(value: bool) -> DependencyNode {
        // Time predicates in the far past/future act as constants
        let at = if value { "19700101000000" } else { "99990101000000" };
        DependencyNode::Time(TimePredicate {
            at: CycleString::literal(at),
        })
    }

    fn eval(node: &DependencyNode, tasks: &FakeTasks) -> bool {
        let ctx = EvalContext {
            tasks,
            now: Utc::now(),
        };
        node.resolved(cycle(), &ctx)
    }

    #[test]
    fn test_and_with_max_missing() {
        let tasks = FakeTasks::default();
        let node = |ops: [bool; 3]| DependencyNode::And {
            operands: ops.iter().map(|&v| constant(v)).collect(),
            max_missing: 1,
        };
        assert!(!eval(&node([true, false, false]), &tasks));
        assert!(eval(&node([true, false, true]), &tasks));
        assert!(eval(&node([true, true, true]), &tasks));
    }

    #[test]
    fn test_plain_and_or_not() {
        let tasks = FakeTasks::default();
        assert!(!eval(&DependencyNode::all(vec![constant(true), constant(false)]), &tasks));
        assert!(eval(&DependencyNode::Or(vec![constant(false), constant(true)]), &tasks));
        assert!(!eval(&DependencyNode::Or(vec![]), &tasks));
        assert!(eval(&DependencyNode::Not(Box::new(constant(false))), &tasks));
    }

    #[test]
    fn test_task_predicate_with_offset() {
        let mut tasks = FakeTasks::default();
        let previous = cycle().add_minutes(-60).unwrap();
        tasks.okay.insert(("prep".to_string(), previous));

        let same = DependencyNode::task("prep");
        let back_one = DependencyNode::Task(TaskPredicate {
            task: "prep".to_string(),
            cycle_offset: -1,
            condition: TaskCondition::DoneOkay,
        });
        assert!(!eval(&same, &tasks));
        assert!(eval(&back_one, &tasks));
    }

    #[test]
    fn test_task_predicate_done_accepts_crash() {
        let mut tasks = FakeTasks::default();
        tasks.crashed.insert(("prep".to_string(), cycle()));
        let done = DependencyNode::Task(TaskPredicate {
            task: "prep".to_string(),
            cycle_offset: 0,
            condition: TaskCondition::Done,
        });
        assert!(eval(&done, &tasks));
        assert!(!eval(&DependencyNode::task("prep"), &tasks));
    }

    #[test]
    fn test_file_predicate_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024010112.grb");
        std::fs::write(&path, b"data").unwrap();

        let template = format!("{}/%Y%m%d%H.grb", dir.path().display());
        let fresh = DependencyNode::File(FilePredicate {
            path: CycleString::new(template.clone()).unwrap(),
            min_age: 0,
        });
        let aged = DependencyNode::File(FilePredicate {
            path: CycleString::new(template).unwrap(),
            min_age: 3600,
        });
        let missing = DependencyNode::File(FilePredicate {
            path: CycleString::literal(dir.path().join("nope").display().to_string()),
            min_age: 0,
        });

        let tasks = FakeTasks::default();
        assert!(eval(&fresh, &tasks));
        assert!(!eval(&aged, &tasks));
        assert!(!eval(&missing, &tasks));
    }

    #[test]
    fn test_time_predicate_renders_per_cycle() {
        let node = DependencyNode::Time(TimePredicate {
            at: CycleString::new("%Y%m%d%H%M%S").unwrap().with_offset(3600),
        });
        let tasks = FakeTasks::default();
        let before = EvalContext {
            tasks: &tasks,
            now: cycle().time(),
        };
        let after = EvalContext {
            tasks: &tasks,
            now: cycle().add_minutes(61).unwrap().time(),
        };
        assert!(!node.resolved(cycle(), &before));
        assert!(node.resolved(cycle(), &after));
    }

    #[test]
    fn test_task_refs_walks_tree() {
        let node = DependencyNode::all(vec![
            DependencyNode::task("a"),
            DependencyNode::Not(Box::new(DependencyNode::Or(vec![DependencyNode::task("b")]))),
        ]);
        assert_eq!(node.task_refs(), vec!["a", "b"]);
    }
}
