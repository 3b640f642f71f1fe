//! Per-cycle workflow log.

use chrono::Utc;
use cyclewm_core::{Cycle, CycleString};
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Appends task lifecycle events to one log file per cycle.
///
/// Every line is also emitted as a tracing event. Write failures are
/// reported through tracing and otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct CycleLog {
    template: Option<CycleString>,
}

impl CycleLog {
    /// Log to the path `template` renders to for each cycle, or only to
    /// tracing when there is no template.
    pub fn new(template: Option<CycleString>) -> Self {
        Self { template }
    }

    /// Record a routine event.
    pub fn info(&self, cycle: Cycle, task: &str, message: impl Display) {
        info!(%cycle, task, "{}", message);
        self.append(cycle, task, &message);
    }

    /// Record a failure.
    pub fn warn(&self, cycle: Cycle, task: &str, message: impl Display) {
        warn!(%cycle, task, "{}", message);
        self.append(cycle, task, &message);
    }

    fn append(&self, cycle: Cycle, task: &str, message: &dyn Display) {
        let Some(template) = &self.template else {
            return;
        };
        let path = template.render(cycle);
        let line = format!(
            "{} :: {} :: {} :: {}\n",
            Utc::now().to_rfc3339(),
            cycle,
            task,
            message
        );
        if let Err(e) = write_line(Path::new(&path), &line) {
            warn!(path = %path, "failed to write cycle log: {}", e);
        }
    }
}

fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(line.as_bytes())
}
