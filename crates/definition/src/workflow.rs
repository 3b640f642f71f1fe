//! Loading a workflow definition into the core model.

use cyclewm_batch::BUILTIN_SCHEDULERS;
use cyclewm_core::{
    Cycle, CycleSchedule, CycleString, DependencyNode, FilePredicate, TaskCondition,
    TaskDefinition, TaskPredicate, TimePredicate,
};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::document::{
    CycleStringDoc, FileDoc, Seconds, TaskDoc, TaskRefDoc, TaskStateDoc, TimeDoc, WorkflowDoc,
};
use crate::error::{DefinitionError, DefinitionResult};
use crate::metatask::expand_tasks;

/// Default spacing of real-time admission probes, in seconds.
pub const DEFAULT_ADMISSION_STEP: i64 = 3600;

/// A parsed and validated workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Admit cycles relative to wall-clock time
    pub realtime: bool,

    /// Retrospective admission budget in cycles per hour
    pub max_flow_rate: Option<f64>,

    /// Real-time admission window in seconds
    pub reservation_lead_time: i64,

    /// Seconds between real-time admission probes
    pub admission_step: i64,

    /// Per-cycle log path template
    pub log: Option<CycleString>,

    /// Named schedules
    pub schedules: Vec<CycleSchedule>,

    /// Tasks in definition order
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    /// Read and parse a definition file.
    pub fn load(path: impl AsRef<Path>) -> DefinitionResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let definition = Self::from_yaml(&text)?;
        debug!(
            path = %path.display(),
            schedules = definition.schedules.len(),
            tasks = definition.tasks.len(),
            "loaded workflow definition"
        );
        Ok(definition)
    }

    /// Parse a definition document.
    pub fn from_yaml(text: &str) -> DefinitionResult<Self> {
        let mut doc: WorkflowDoc = serde_yaml::from_str(text)?;
        let entries = expand_tasks(std::mem::take(&mut doc.tasks))?;

        let schedules = parse_schedules(&doc)?;
        let mut tasks = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for entry in entries {
            let task: TaskDoc = serde_yaml::from_value(entry)?;
            if !seen.insert(task.id.clone()) {
                return Err(DefinitionError::DuplicateId {
                    kind: "task",
                    id: task.id,
                });
            }
            tasks.push(build_task(task, &schedules)?);
        }
        check_task_references(&tasks)?;

        let admission_step = seconds(doc.admission_step.as_ref())?.unwrap_or(DEFAULT_ADMISSION_STEP);
        if admission_step <= 0 {
            return Err(DefinitionError::Invalid(
                "admission_step must be positive".to_string(),
            ));
        }

        Ok(Self {
            realtime: doc.realtime,
            max_flow_rate: doc.max_flow_rate,
            reservation_lead_time: seconds(doc.reservation_lead_time.as_ref())?.unwrap_or(0),
            admission_step,
            log: doc
                .log
                .as_ref()
                .map(|log| cycle_string(log, "log"))
                .transpose()?,
            schedules,
            tasks,
        })
    }

    /// Task with the given id.
    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

fn parse_schedules(doc: &WorkflowDoc) -> DefinitionResult<Vec<CycleSchedule>> {
    let mut schedules = Vec::with_capacity(doc.schedules.len());
    for (id, fields) in &doc.schedules {
        let (Some(id), Some(fields)) = (id.as_str(), fields.as_str()) else {
            return Err(DefinitionError::Invalid(
                "schedules must map ids to field strings".to_string(),
            ));
        };
        let schedule = CycleSchedule::parse(id, fields).map_err(|source| {
            DefinitionError::Schedule {
                id: id.to_string(),
                source,
            }
        })?;
        schedules.push(schedule);
    }
    Ok(schedules)
}

fn seconds(value: Option<&Seconds>) -> DefinitionResult<Option<i64>> {
    value.map(Seconds::to_seconds).transpose()
}

fn timeout(value: Option<&Seconds>, task: &str) -> DefinitionResult<Option<u64>> {
    match seconds(value)? {
        Some(secs) => u64::try_from(secs).map(Some).map_err(|_| {
            DefinitionError::Invalid(format!("task '{task}': timeouts cannot be negative"))
        }),
        None => Ok(None),
    }
}

fn cycle_string(doc: &CycleStringDoc, owner: &str) -> DefinitionResult<CycleString> {
    let (template, offset) = match doc {
        CycleStringDoc::Plain(template) => (template, None),
        CycleStringDoc::Offset { template, offset } => (template, offset.as_ref()),
    };
    let offset = seconds(offset)?.unwrap_or(0);
    CycleString::new(template.as_str())
        .map(|s| s.with_offset(offset))
        .map_err(|source| DefinitionError::Template {
            task: owner.to_string(),
            source,
        })
}

fn build_task(doc: TaskDoc, schedules: &[CycleSchedule]) -> DefinitionResult<TaskDefinition> {
    if !BUILTIN_SCHEDULERS.contains(&doc.scheduler.as_str()) {
        return Err(DefinitionError::UnknownReference {
            kind: "scheduler",
            id: doc.scheduler,
            from: format!("task '{}'", doc.id),
        });
    }

    let task_schedules = match &doc.cycles {
        None => schedules.to_vec(),
        Some(ids) => ids
            .iter()
            .map(|id| {
                schedules
                    .iter()
                    .find(|s| s.id() == id)
                    .cloned()
                    .ok_or_else(|| DefinitionError::UnknownReference {
                        kind: "schedule",
                        id: id.clone(),
                        from: format!("task '{}'", doc.id),
                    })
            })
            .collect::<DefinitionResult<Vec<_>>>()?,
    };

    let render_all = |values: &BTreeMap<String, CycleStringDoc>| {
        values
            .iter()
            .map(|(name, value)| Ok((name.clone(), cycle_string(value, &doc.id)?)))
            .collect::<DefinitionResult<BTreeMap<_, _>>>()
    };
    let properties = render_all(&doc.properties)?;
    let environment = render_all(&doc.environment)?;

    let dependency = |value: &Option<Value>| {
        value
            .as_ref()
            .map(|v| parse_dependency(v, &doc.id))
            .transpose()
    };

    Ok(TaskDefinition {
        schedules: task_schedules,
        tries: doc.tries,
        throttle: doc.throttle,
        properties,
        environment,
        dependency: dependency(&doc.dependency)?,
        hang_dependency: dependency(&doc.hang_dependency)?,
        deadline_dependency: dependency(&doc.deadline_dependency)?,
        start_timeout: timeout(doc.start_timeout.as_ref(), &doc.id)?,
        end_timeout: timeout(doc.end_timeout.as_ref(), &doc.id)?,
        ..TaskDefinition::new(doc.id.clone(), doc.command.clone(), doc.scheduler.clone())
    })
}

fn invalid(task: &str, message: impl std::fmt::Display) -> DefinitionError {
    DefinitionError::Invalid(format!("task '{task}': {message}"))
}

/// Parse one dependency node: a single-key mapping naming the operator.
fn parse_dependency(value: &Value, task: &str) -> DefinitionResult<DependencyNode> {
    let entry = value
        .as_mapping()
        .filter(|m| m.len() == 1)
        .and_then(|m| m.iter().next());
    let Some((Value::String(op), body)) = entry else {
        return Err(invalid(task, "a dependency must be a single-key mapping"));
    };

    match op.as_str() {
        "and" => match body {
            Value::Sequence(items) => Ok(DependencyNode::And {
                operands: parse_operands(items, task)?,
                max_missing: 0,
            }),
            Value::Mapping(map) => {
                let max_missing = match map.get("max_missing") {
                    None => 0,
                    Some(v) => v
                        .as_u64()
                        .and_then(|n| usize::try_from(n).ok())
                        .ok_or_else(|| invalid(task, "max_missing must be a count"))?,
                };
                let Some(Value::Sequence(items)) = map.get("of") else {
                    return Err(invalid(task, "'and' needs a list under 'of'"));
                };
                Ok(DependencyNode::And {
                    operands: parse_operands(items, task)?,
                    max_missing,
                })
            }
            _ => Err(invalid(task, "'and' takes a list")),
        },
        "or" => match body {
            Value::Sequence(items) => Ok(DependencyNode::Or(parse_operands(items, task)?)),
            _ => Err(invalid(task, "'or' takes a list")),
        },
        "not" => {
            let operand = match body {
                Value::Sequence(items) if items.len() == 1 => &items[0],
                Value::Sequence(_) => return Err(invalid(task, "'not' takes exactly one operand")),
                other => other,
            };
            Ok(DependencyNode::Not(Box::new(parse_dependency(operand, task)?)))
        }
        "task" => {
            let reference = match body {
                Value::String(id) => TaskRefDoc {
                    task: id.clone(),
                    cycle: 0,
                    state: TaskStateDoc::DoneOkay,
                },
                other => serde_yaml::from_value(other.clone())?,
            };
            Ok(DependencyNode::Task(TaskPredicate {
                task: reference.task,
                cycle_offset: reference.cycle,
                condition: match reference.state {
                    TaskStateDoc::DoneOkay => TaskCondition::DoneOkay,
                    TaskStateDoc::Done => TaskCondition::Done,
                },
            }))
        }
        "file" => {
            let file = match body {
                Value::String(path) => FileDoc {
                    path: CycleStringDoc::Plain(path.clone()),
                    age: None,
                },
                other => serde_yaml::from_value(other.clone())?,
            };
            let min_age = seconds(file.age.as_ref())?.unwrap_or(0);
            Ok(DependencyNode::File(FilePredicate {
                path: cycle_string(&file.path, task)?,
                min_age: u64::try_from(min_age)
                    .map_err(|_| invalid(task, "file age cannot be negative"))?,
            }))
        }
        "time" => {
            let time = match body {
                Value::String(at) => TimeDoc {
                    at: at.clone(),
                    offset: None,
                },
                other => serde_yaml::from_value(other.clone())?,
            };
            let at = cycle_string(
                &CycleStringDoc::Offset {
                    template: time.at,
                    offset: time.offset,
                },
                task,
            )?;
            let probe = at.render(Cycle::epoch());
            if probe.len() != 14 || !probe.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid(
                    task,
                    format!("time '{}' must render as YYYYMMDDHHMMSS", at.template()),
                ));
            }
            Ok(DependencyNode::Time(TimePredicate { at }))
        }
        other => Err(invalid(task, format!("unknown dependency '{other}'"))),
    }
}

fn parse_operands(items: &[Value], task: &str) -> DefinitionResult<Vec<DependencyNode>> {
    items.iter().map(|item| parse_dependency(item, task)).collect()
}

fn check_task_references(tasks: &[TaskDefinition]) -> DefinitionResult<()> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        let nodes = [
            &task.dependency,
            &task.hang_dependency,
            &task.deadline_dependency,
        ];
        for node in nodes.into_iter().flatten() {
            if let Some(missing) = node.task_refs().into_iter().find(|r| !ids.contains(r)) {
                return Err(DefinitionError::UnknownReference {
                    kind: "task",
                    id: missing.to_string(),
                    from: format!("task '{}'", task.id),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const WORKFLOW: &str = r#"
realtime: false
max_flow_rate: 2.5
log: "/logs/%Y%m%d%H.log"
schedules:
  six_hourly: "2024 1 1-2 0-18/6 0"
  daily: "2024 1 1-2 0 0"
tasks:
  - id: prep
    command: "/bin/prep.sh"
    scheduler: local
    cycles: [six_hourly]
    tries: 3
    throttle: 2
    start_timeout: "01:00:00"
    properties: { stdout: "/logs/prep_%Y%m%d%H.out" }
    environment:
      CDATE: "%Y%m%d%H"
      PDATE: { str: "%Y%m%d%H", offset: "-06:00:00" }
    dependency:
      and:
        - task: { task: prep, cycle: -1 }
        - file: { path: "/in/%Y%m%d%H", age: "05:00" }
  - id: post
    command: "/bin/post.sh"
    scheduler: slurm
    dependency: { task: prep }
    hang_dependency: { time: { at: "%Y%m%d%H%M%S", offset: 7200 } }
    deadline_dependency:
      and: { max_missing: 1, of: [ { task: prep }, { not: { file: "/stop" } } ] }
"#;

    #[test]
    fn test_full_document() {
        let wf = WorkflowDefinition::from_yaml(WORKFLOW).unwrap();
        assert!(!wf.realtime);
        assert_eq!(wf.max_flow_rate, Some(2.5));
        assert_eq!(wf.admission_step, DEFAULT_ADMISSION_STEP);
        assert_eq!(wf.schedules.len(), 2);
        assert_eq!(wf.tasks.len(), 2);

        let prep = wf.task("prep").unwrap();
        assert_eq!(prep.schedules.len(), 1);
        assert_eq!(prep.tries, 3);
        assert_eq!(prep.start_timeout, Some(3600));
        assert_eq!(prep.environment["PDATE"].offset(), -21_600);
        assert_eq!(
            prep.dependency,
            Some(DependencyNode::And {
                operands: vec![
                    DependencyNode::Task(TaskPredicate {
                        task: "prep".to_string(),
                        cycle_offset: -1,
                        condition: TaskCondition::DoneOkay,
                    }),
                    DependencyNode::File(FilePredicate {
                        path: CycleString::new("/in/%Y%m%d%H").unwrap(),
                        min_age: 300,
                    }),
                ],
                max_missing: 0,
            })
        );

        let post = wf.task("post").unwrap();
        assert_eq!(post.schedules.len(), 2);
        assert!(matches!(
            post.deadline_dependency,
            Some(DependencyNode::And { max_missing: 1, .. })
        ));
        assert!(matches!(post.hang_dependency, Some(DependencyNode::Time(_))));
    }

    #[test]
    fn test_metatasks_expand_in_order() {
        let wf = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks:
  - metatask:
      vars: { member: "01 02" }
      tasks:
        - { id: "fcst_#member#", command: "/bin/fcst.sh #member#", scheduler: local }
  - { id: post, command: "/bin/post.sh", scheduler: local,
      dependency: { and: [ { task: fcst_01 }, { task: fcst_02 } ] } }
"#,
        )
        .unwrap();

        let ids: Vec<_> = wf.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["fcst_01", "fcst_02", "post"]);
        assert_eq!(wf.tasks[1].command, "/bin/fcst.sh 02");
    }

    #[test]
    fn test_duplicate_task_id() {
        let result = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks:
  - { id: a, command: x, scheduler: local }
  - { id: a, command: y, scheduler: local }
"#,
        );
        assert!(matches!(result, Err(DefinitionError::DuplicateId { kind: "task", .. })));
    }

    #[test]
    fn test_unknown_references() {
        let unknown_schedule = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks: [ { id: a, command: x, scheduler: local, cycles: [hourly] } ]
"#,
        );
        assert!(matches!(
            unknown_schedule,
            Err(DefinitionError::UnknownReference { kind: "schedule", .. })
        ));

        let unknown_task = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks: [ { id: a, command: x, scheduler: local, dependency: { task: ghost } } ]
"#,
        );
        assert!(matches!(
            unknown_task,
            Err(DefinitionError::UnknownReference { kind: "task", id, .. }) if id == "ghost"
        ));

        let unknown_scheduler = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks: [ { id: a, command: x, scheduler: pbs } ]
"#,
        );
        assert!(matches!(
            unknown_scheduler,
            Err(DefinitionError::UnknownReference { kind: "scheduler", .. })
        ));
    }

    #[test]
    fn test_bad_schedule_and_templates() {
        let bad_schedule = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 13 1 0 0" }
tasks: []
"#,
        );
        assert!(matches!(bad_schedule, Err(DefinitionError::Schedule { .. })));

        let bad_time = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks: [ { id: a, command: x, scheduler: local, dependency: { time: "%Y%m%d" } } ]
"#,
        );
        assert!(matches!(bad_time, Err(DefinitionError::Invalid(msg)) if msg.contains("YYYYMMDDHHMMSS")));

        let bad_age = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks: [ { id: a, command: x, scheduler: local, dependency: { file: { path: /x, age: 5m } } } ]
"#,
        );
        assert!(bad_age.is_err());
    }

    #[test]
    fn test_unknown_dependency_operator() {
        let result = WorkflowDefinition::from_yaml(
            r#"
schedules: { daily: "2024 1 1 0 0" }
tasks: [ { id: a, command: x, scheduler: local, dependency: { xor: [] } } ]
"#,
        );
        assert!(matches!(result, Err(DefinitionError::Invalid(msg)) if msg.contains("xor")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(WORKFLOW.as_bytes()).unwrap();

        let wf = WorkflowDefinition::load(file.path()).unwrap();
        assert_eq!(wf.tasks.len(), 2);

        let missing = WorkflowDefinition::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(DefinitionError::Io { .. })));
    }
}
