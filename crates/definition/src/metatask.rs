//! Metatask expansion.
//!
//! A metatask entry `{ metatask: { vars: {...}, tasks: [...] } }` stands for
//! one copy of its tasks per variable index, with every `#name#` in their
//! strings replaced by the variable's i-th value. Expansion happens on the
//! raw YAML tree before typed parsing; nested metatasks expand inner-first.

use serde_yaml::{Mapping, Value};

use crate::error::{DefinitionError, DefinitionResult};

/// Expand every metatask in a task list, keeping definition order.
pub fn expand_tasks(entries: Vec<Value>) -> DefinitionResult<Vec<Value>> {
    let mut expanded = Vec::with_capacity(entries.len());
    for entry in entries {
        match metatask_body(&entry)? {
            Some(body) => expanded.extend(expand_metatask(body.clone())?),
            None => expanded.push(entry),
        }
    }
    Ok(expanded)
}

fn metatask_body(entry: &Value) -> DefinitionResult<Option<&Value>> {
    let Value::Mapping(map) = entry else {
        return Ok(None);
    };
    match map.get("metatask") {
        Some(_) if map.len() != 1 => Err(DefinitionError::Invalid(
            "a metatask entry cannot carry other keys".to_string(),
        )),
        body => Ok(body),
    }
}

fn expand_metatask(body: Value) -> DefinitionResult<Vec<Value>> {
    let Value::Mapping(mut body) = body else {
        return Err(DefinitionError::Invalid("metatask must be a mapping".to_string()));
    };

    let vars = parse_vars(body.remove("vars"))?;
    let tasks = match body.remove("tasks") {
        Some(Value::Sequence(tasks)) => tasks,
        _ => {
            return Err(DefinitionError::Invalid(
                "metatask needs a list of tasks".to_string(),
            ))
        }
    };
    if let Some((key, _)) = body.iter().next() {
        return Err(DefinitionError::Invalid(format!(
            "unexpected metatask key {key:?}"
        )));
    }

    let inner = expand_tasks(tasks)?;
    let count = vars.first().map_or(0, |(_, values)| values.len());

    let mut expanded = Vec::with_capacity(count * inner.len());
    for i in 0..count {
        for task in &inner {
            let mut task = task.clone();
            substitute(&mut task, &vars, i);
            expanded.push(task);
        }
    }
    Ok(expanded)
}

/// Variables as `(name, values)`; every list has the same non-zero length.
fn parse_vars(vars: Option<Value>) -> DefinitionResult<Vec<(String, Vec<String>)>> {
    let Some(Value::Mapping(vars)) = vars else {
        return Err(DefinitionError::Invalid(
            "metatask needs a mapping of vars".to_string(),
        ));
    };

    let mut parsed = Vec::with_capacity(vars.len());
    for (name, values) in vars {
        let name = scalar(&name)
            .ok_or_else(|| DefinitionError::Invalid("metatask var names must be scalars".into()))?;
        let values: Vec<String> = match &values {
            Value::Sequence(items) => items.iter().filter_map(scalar).collect(),
            other => scalar(other)
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        };
        parsed.push((name, values));
    }

    let count = parsed.first().map(|(_, values)| values.len());
    match count {
        None | Some(0) => Err(DefinitionError::Invalid(
            "metatask vars must have at least one value".to_string(),
        )),
        Some(count) => match parsed.iter().find(|(_, values)| values.len() != count) {
            Some((name, values)) => Err(DefinitionError::Invalid(format!(
                "metatask var '{name}' has {} values, expected {count}",
                values.len()
            ))),
            None => Ok(parsed),
        },
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn substitute(value: &mut Value, vars: &[(String, Vec<String>)], index: usize) {
    match value {
        Value::String(text) => {
            for (name, values) in vars {
                *text = text.replace(&format!("#{name}#"), &values[index]);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                substitute(item, vars, index);
            }
        }
        Value::Mapping(map) => {
            let entries = std::mem::take(map);
            let mut rebuilt = Mapping::with_capacity(entries.len());
            for (mut key, mut item) in entries {
                substitute(&mut key, vars, index);
                substitute(&mut item, vars, index);
                rebuilt.insert(key, item);
            }
            *map = rebuilt;
        }
        Value::Tagged(tagged) => substitute(&mut tagged.value, vars, index),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
