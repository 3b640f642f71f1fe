//! Orchestrator - the workflow loop.
//!
//! One pass admits new cycles, drives every task through every running
//! cycle, and checkpoints the whole workflow to the store:
//! ```text
//! reload definition → admit cycles → checkpoint → dispatch → checkpoint
//! ```

use chrono::Utc;
use cyclewm_batch::{BatchConfig, BatchRegistry};
use cyclewm_core::{Cycle, CycleSchedule, CycleString, Time};
use cyclewm_definition::WorkflowDefinition;
use cyclewm_storage::{JsonStore, StoreError, StoreLock, Storage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::job::JobState;
use crate::log::CycleLog;
use crate::task::{RunContext, Task};

/// Name used in the cycle log for workflow-level events.
const WORKFLOW: &str = "workflow";

/// Whether a cycle is being worked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CycleStatus {
    /// Tasks run for the cycle on every pass
    Run,
    /// Cycle is skipped until resumed
    Halt,
}

/// Runtime settings that do not come from the definition.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Settings for built-in batch systems
    pub batch: BatchConfig,

    /// Hard limit on each batch system call
    pub boundary_timeout: Duration,

    /// Sleep between passes in loop mode
    pub poll_interval: Duration,

    /// Overrides the definition's real-time admission step, in seconds
    pub admission_step: Option<i64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            boundary_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_secs(60),
            admission_step: None,
        }
    }
}

/// Everything persisted between invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    definition_path: PathBuf,
    parsed_at: Option<Time>,
    realtime: bool,
    max_flow_rate: Option<f64>,
    reservation_lead_time: i64,
    admission_step: i64,
    log: Option<CycleString>,
    schedules: Vec<CycleSchedule>,
    cycles: BTreeMap<Cycle, CycleStatus>,
    discovered: BTreeMap<Cycle, Time>,
    tasks: BTreeMap<String, Task>,
    order: BTreeMap<String, usize>,
    schedulers: Vec<String>,
}

/// State of one task for one cycle, as reported by [`Orchestrator::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    /// Task id
    pub task: String,
    /// Batch job id of the latest attempt
    pub job_id: Option<String>,
    /// State of the latest attempt, `None` if nothing was submitted
    pub state: Option<JobState>,
    /// Exit status of the latest attempt
    pub exit_status: Option<i32>,
    /// Attempts made for the cycle
    pub attempts: u32,
    /// Whether the task expired for the cycle
    pub expired: bool,
    /// Jobs of this task in flight across all cycles
    pub in_flight: u32,
    /// Throughput estimate
    pub tasks_per_hour: Option<f64>,
}

/// One cycle, as reported by [`Orchestrator::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    /// The cycle
    pub cycle: Cycle,
    /// Run or halt
    pub status: CycleStatus,
    /// When the cycle was admitted
    pub discovered: Option<Time>,
    /// Whether every task finished for the cycle
    pub done: bool,
    /// Tasks that apply to the cycle, in definition order
    pub tasks: Vec<TaskSummary>,
}

/// Drives a workflow. Holds the store lock until dropped.
pub struct Orchestrator {
    definition_path: PathBuf,
    store: JsonStore,
    _lock: StoreLock,
    registry: BatchRegistry,
    config: EngineConfig,
    state: Snapshot,
    log: CycleLog,
}

impl Orchestrator {
    /// Open the workflow stored at `store`, defined by `definition`.
    pub async fn open(
        definition: impl AsRef<Path>,
        store: impl AsRef<Path>,
        config: EngineConfig,
    ) -> WorkflowResult<Self> {
        let registry = BatchRegistry::new(config.batch.clone());
        Self::open_with(definition, store, config, registry).await
    }

    /// Open with a prepared batch registry.
    ///
    /// Instances already registered take precedence over built-in ones.
    pub async fn open_with(
        definition: impl AsRef<Path>,
        store: impl AsRef<Path>,
        config: EngineConfig,
        mut registry: BatchRegistry,
    ) -> WorkflowResult<Self> {
        let definition_path = definition.as_ref().to_path_buf();
        let lock = StoreLock::acquire(store.as_ref())?;
        let store = JsonStore::new(store.as_ref());
        let state = load_snapshot(&store, &definition_path).await?;

        for name in &state.schedulers {
            registry.ensure(name)?;
        }

        let mut orchestrator = Self {
            definition_path,
            store,
            _lock: lock,
            registry,
            config,
            log: CycleLog::new(state.log.clone()),
            state,
        };
        orchestrator.reload_if_dirty()?;
        orchestrator.checkpoint().await?;

        info!(
            definition = %orchestrator.definition_path.display(),
            tasks = orchestrator.state.tasks.len(),
            cycles = orchestrator.state.cycles.len(),
            "workflow opened"
        );
        Ok(orchestrator)
    }

    /// Run one pass at `now`.
    ///
    /// The workflow is checkpointed even when the pass fails.
    pub async fn run_pass(&mut self, now: Time) -> WorkflowResult<()> {
        let outcome = self.pass(now).await;
        let saved = self.checkpoint().await;
        outcome?;
        saved
    }

    /// Run passes until the workflow is done, or forever for real-time
    /// workflows. Failed passes are logged and retried.
    pub async fn run_loop(&mut self, interval: Duration) -> WorkflowResult<()> {
        loop {
            if let Err(e) = self.run_pass(Utc::now()).await {
                error!("workflow pass failed: {}", e);
            }
            if self.done() && !self.has_pending_cycles() {
                info!("all cycles are done");
                return Ok(());
            }
            debug!(seconds = interval.as_secs(), "sleeping until next pass");
            tokio::time::sleep(interval).await;
        }
    }

    /// Halt `cycles`, or every known cycle when empty.
    ///
    /// Live jobs are cancelled and their state is forgotten. Progress is
    /// checkpointed after each cycle, so an interrupted halt can be repeated.
    pub async fn halt(&mut self, cycles: &[Cycle]) -> WorkflowResult<()> {
        let order = self.task_order();
        for cycle in self.select_cycles(cycles) {
            self.log.info(cycle, WORKFLOW, "halting cycle");
            for id in &order {
                let Some(task) = self.state.tasks.get_mut(id) else {
                    continue;
                };
                let batch = self.registry.ensure(&task.definition().scheduler)?;
                task.halt(cycle, batch.as_ref(), self.config.boundary_timeout, &self.log)
                    .await;
            }
            self.state.cycles.insert(cycle, CycleStatus::Halt);
            self.log.info(cycle, WORKFLOW, "cycle halted");
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Resume `cycles`, or every known cycle when empty.
    pub async fn resume(&mut self, cycles: &[Cycle]) -> WorkflowResult<()> {
        for cycle in self.select_cycles(cycles) {
            self.state.cycles.insert(cycle, CycleStatus::Run);
            self.log.info(cycle, WORKFLOW, "cycle resumed");
        }
        self.checkpoint().await
    }

    /// Whether every known cycle is done. Real-time workflows never are.
    pub fn done(&self) -> bool {
        !self.state.realtime && self.state.cycles.keys().all(|c| self.cycle_done(*c))
    }

    /// Per-cycle, per-task summary in cycle order.
    pub fn status(&self) -> Vec<CycleSummary> {
        let order = self.task_order();
        self.state
            .cycles
            .iter()
            .map(|(&cycle, &status)| CycleSummary {
                cycle,
                status,
                discovered: self.state.discovered.get(&cycle).copied(),
                done: self.cycle_done(cycle),
                tasks: order
                    .iter()
                    .filter_map(|id| self.state.tasks.get(id))
                    .filter(|task| task.definition().applies_to(cycle))
                    .map(|task| summarize(task, cycle))
                    .collect(),
            })
            .collect()
    }

    /// Task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.state.tasks.get(id)
    }

    /// Status of a known cycle.
    pub fn cycle_status(&self, cycle: Cycle) -> Option<CycleStatus> {
        self.state.cycles.get(&cycle).copied()
    }

    /// Known cycles, ascending.
    pub fn cycles(&self) -> Vec<Cycle> {
        self.state.cycles.keys().copied().collect()
    }

    /// Write the workflow to the store.
    pub async fn checkpoint(&self) -> WorkflowResult<()> {
        self.store.save(&self.state).await?;
        debug!(
            store = %Storage::<Snapshot>::location(&self.store).display(),
            "checkpointed workflow"
        );
        Ok(())
    }

    async fn pass(&mut self, now: Time) -> WorkflowResult<()> {
        self.reload_if_dirty()?;
        self.admit(now);
        self.checkpoint().await?;
        self.dispatch(now).await;
        Ok(())
    }

    async fn dispatch(&mut self, now: Time) {
        let running: Vec<Cycle> = self
            .state
            .cycles
            .iter()
            .filter(|(_, status)| **status == CycleStatus::Run)
            .map(|(cycle, _)| *cycle)
            .collect();
        let order = self.task_order();

        for cycle in running {
            debug!(%cycle, "processing cycle");
            for id in &order {
                let Some(mut task) = self.state.tasks.remove(id) else {
                    continue;
                };
                match self.registry.ensure(&task.definition().scheduler) {
                    Ok(batch) => {
                        let ctx = RunContext {
                            others: &self.state.tasks,
                            batch: batch.as_ref(),
                            log: &self.log,
                            now,
                            timeout: self.config.boundary_timeout,
                        };
                        task.run(cycle, &ctx).await;
                    }
                    Err(e) => self.log.warn(cycle, id, format!("batch system unavailable: {e}")),
                }
                self.state.tasks.insert(id.clone(), task);
            }
        }
    }

    fn admit(&mut self, now: Time) {
        if self.state.realtime {
            for cycle in self.realtime_cycles(now) {
                self.activate(cycle, now);
            }
            return;
        }

        for _ in 0..self.admission_quota(now) {
            let latest = self.state.cycles.keys().next_back().copied().unwrap_or_else(Cycle::epoch);
            let next = self.state.schedules.iter().filter_map(|s| s.next(latest)).min();
            match next {
                Some(cycle) => self.activate(cycle, now),
                None => break,
            }
        }
    }

    /// Latest cycle not after each lead-time probe.
    fn realtime_cycles(&self, now: Time) -> BTreeSet<Cycle> {
        let step = self.state.admission_step.max(1);
        let lead = self.state.reservation_lead_time.max(0);
        let now = Cycle::new(now);

        let mut cycles = BTreeSet::new();
        let mut offset = 0;
        while offset <= lead {
            let latest = now.add_seconds(offset).and_then(|probe| {
                self.state
                    .schedules
                    .iter()
                    .filter_map(|s| s.latest_not_after(probe))
                    .max()
            });
            cycles.extend(latest);
            offset += step;
        }
        cycles
    }

    /// New cycles a retrospective workflow may admit at `now`.
    ///
    /// A rate of `r` cycles per hour allows `round(r / f)` admissions in any
    /// window of `round(1 / f)` hours, where `f` is the fractional part of
    /// `r` (or 1 for whole rates).
    fn admission_quota(&self, now: Time) -> usize {
        let rate = match self.state.max_flow_rate {
            Some(rate) if rate > 0.0 => rate,
            _ => return 1,
        };
        let denominator = if rate.fract() == 0.0 { 1.0 } else { rate.fract() };
        let lookback = chrono::Duration::hours((1.0 / denominator).round() as i64);
        let max_cycles = (rate / denominator).round() as usize;
        let recent = self
            .state
            .discovered
            .values()
            .filter(|&&at| at > now - lookback)
            .count();
        max_cycles.saturating_sub(recent)
    }

    fn activate(&mut self, cycle: Cycle, now: Time) {
        if self.state.cycles.contains_key(&cycle) {
            return;
        }
        self.state.cycles.insert(cycle, CycleStatus::Run);
        self.state.discovered.insert(cycle, now);
        self.log.info(cycle, WORKFLOW, "cycle activated");
    }

    /// Whether a retrospective workflow still has cycles to admit.
    fn has_pending_cycles(&self) -> bool {
        let latest = self.state.cycles.keys().next_back().copied().unwrap_or_else(Cycle::epoch);
        self.state.schedules.iter().any(|s| s.next(latest).is_some())
    }

    /// Every applicable task succeeded, or one gave up or expired.
    fn cycle_done(&self, cycle: Cycle) -> bool {
        let mut tasks = self
            .state
            .tasks
            .values()
            .filter(|task| task.definition().applies_to(cycle))
            .peekable();
        if tasks.peek().is_none() {
            return true;
        }
        let tasks: Vec<&Task> = tasks.collect();
        tasks.iter().all(|t| t.done_okay(cycle))
            || tasks.iter().any(|t| t.crashed(cycle) || t.expired(cycle))
    }

    fn task_order(&self) -> Vec<String> {
        let mut ids: Vec<&String> = self.state.tasks.keys().collect();
        ids.sort_by_key(|id| self.state.order.get(*id).copied().unwrap_or(usize::MAX));
        ids.into_iter().cloned().collect()
    }

    fn select_cycles(&self, cycles: &[Cycle]) -> Vec<Cycle> {
        if cycles.is_empty() {
            return self.cycles();
        }
        cycles
            .iter()
            .copied()
            .filter(|cycle| {
                let known = self.state.cycles.contains_key(cycle);
                if !known {
                    warn!(%cycle, "ignoring unknown cycle");
                }
                known
            })
            .collect()
    }

    fn reload_if_dirty(&mut self) -> WorkflowResult<()> {
        let modified = std::fs::metadata(&self.definition_path)
            .and_then(|m| m.modified())
            .ok()
            .map(Time::from);
        let dirty = self.state.definition_path != self.definition_path
            || match (self.state.parsed_at, modified) {
                (Some(parsed), Some(modified)) => modified > parsed,
                _ => true,
            };
        if !dirty {
            return Ok(());
        }

        let definition = match WorkflowDefinition::load(&self.definition_path) {
            Ok(definition) => definition,
            Err(e) if !self.state.tasks.is_empty() => {
                error!(
                    path = %self.definition_path.display(),
                    "definition reload failed, keeping the previous definition: {}", e
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.apply(definition)
    }

    /// Replace the definition, keeping runtime state of surviving tasks.
    fn apply(&mut self, definition: WorkflowDefinition) -> WorkflowResult<()> {
        let schedulers: BTreeSet<String> =
            definition.tasks.iter().map(|t| t.scheduler.clone()).collect();
        for name in &schedulers {
            self.registry.ensure(name)?;
        }

        let mut previous = std::mem::take(&mut self.state.tasks);
        let mut order = BTreeMap::new();
        for (index, task_def) in definition.tasks.into_iter().enumerate() {
            let id = task_def.id.clone();
            let task = match previous.remove(&id) {
                Some(mut task) => {
                    task.alter(task_def);
                    task
                }
                None => Task::new(task_def),
            };
            order.insert(id.clone(), index);
            self.state.tasks.insert(id, task);
        }
        for (id, task) in &previous {
            if task.in_flight() > 0 {
                warn!(task = %id, jobs = task.in_flight(), "dropping removed task with jobs still in flight");
            } else {
                info!(task = %id, "dropping removed task");
            }
        }

        let state = &mut self.state;
        state.definition_path = self.definition_path.clone();
        state.parsed_at = Some(Utc::now());
        state.realtime = definition.realtime;
        state.max_flow_rate = definition.max_flow_rate;
        state.reservation_lead_time = definition.reservation_lead_time;
        state.admission_step = self
            .config
            .admission_step
            .unwrap_or(definition.admission_step)
            .max(1);
        state.log = definition.log;
        state.schedules = definition.schedules;
        state.order = order;
        state.schedulers = schedulers.into_iter().collect();
        self.log = CycleLog::new(self.state.log.clone());

        info!(
            tasks = self.state.tasks.len(),
            schedules = self.state.schedules.len(),
            "loaded workflow definition"
        );
        Ok(())
    }
}

/// Load the stored snapshot, handling a corrupt store by workflow kind.
async fn load_snapshot(store: &JsonStore, definition: &Path) -> WorkflowResult<Snapshot> {
    match Storage::<Snapshot>::load(store).await {
        Ok(snapshot) => Ok(snapshot.unwrap_or_default()),
        Err(StoreError::Corrupt { path, source }) => {
            let realtime = WorkflowDefinition::load(definition)
                .map(|d| d.realtime)
                .unwrap_or(false);
            if !realtime {
                return Err(WorkflowError::Corrupt { path, source });
            }
            warn!(
                store = %path.display(),
                "store is corrupt, starting the real-time workflow afresh: {}", source
            );
            Storage::<Snapshot>::reset(store).await?;
            Ok(Snapshot::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn summarize(task: &Task, cycle: Cycle) -> TaskSummary {
    let job = task.job(cycle);
    TaskSummary {
        task: task.id().to_string(),
        job_id: job.and_then(|j| j.id()).map(str::to_string),
        state: job.map(|j| j.state()),
        exit_status: job.and_then(|j| j.exit_status()),
        attempts: task.attempts(cycle),
        expired: task.expired(cycle),
        in_flight: task.in_flight(),
        tasks_per_hour: task.tasks_per_hour(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBatch;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const PIPELINE: &str = r#"
schedules:
  daily: "2024 1 1-3 0 0"
tasks:
  - id: a
    command: "/bin/a.sh"
    scheduler: local
  - id: b
    command: "/bin/b.sh"
    scheduler: local
    dependency: { task: a }
"#;

    const ONCE: &str = r#"
schedules:
  once: "2024 1 1 0 0"
tasks:
  - { id: a, command: "/bin/a.sh", scheduler: local }
  - { id: b, command: "/bin/b.sh", scheduler: local, dependency: { task: a } }
"#;

    fn at(day: u32, hour: u32, minute: u32) -> Time {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn cycle(day: u32, hour: u32) -> Cycle {
        Cycle::from_fields(2024, 1, day, hour, 0).unwrap()
    }

    struct Fixture {
        dir: TempDir,
        batch: Arc<ScriptedBatch>,
    }

    impl Fixture {
        fn new(yaml: &str) -> Self {
            let fixture = Self {
                dir: TempDir::new().unwrap(),
                batch: ScriptedBatch::new(),
            };
            fixture.write_definition(yaml);
            fixture
        }

        fn definition(&self) -> PathBuf {
            self.dir.path().join("workflow.yaml")
        }

        fn store(&self) -> PathBuf {
            self.dir.path().join("state/workflow.json")
        }

        /// Write the definition with a modification time later than any parse.
        fn write_definition(&self, yaml: &str) {
            std::fs::write(self.definition(), yaml).unwrap();
            std::fs::File::options()
                .write(true)
                .open(self.definition())
                .unwrap()
                .set_modified(SystemTime::now() + Duration::from_secs(5))
                .unwrap();
        }

        async fn open(&self) -> WorkflowResult<Orchestrator> {
            let mut registry = BatchRegistry::new(BatchConfig::default());
            registry.register("local", self.batch.clone());
            Orchestrator::open_with(
                self.definition(),
                self.store(),
                EngineConfig::default(),
                registry,
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_dependent_task_waits_for_success() {
        let fx = Fixture::new(PIPELINE);
        let mut wf = fx.open().await.unwrap();
        let now = at(1, 1, 0);

        wf.run_pass(now).await.unwrap();
        assert_eq!(wf.cycles(), vec![cycle(1, 0)]);
        assert_eq!(fx.batch.jobs_for("/bin/a.sh"), vec!["1"]);
        assert!(fx.batch.jobs_for("/bin/b.sh").is_empty());

        fx.batch.set_state("1", cyclewm_batch::BatchJobState::Running);
        wf.run_pass(now).await.unwrap();
        assert!(fx.batch.jobs_for("/bin/b.sh").is_empty());

        fx.batch.finish("1", 0);
        wf.run_pass(now).await.unwrap();
        assert_eq!(fx.batch.jobs_for("/bin/b.sh").len(), 1);
        assert!(wf.task("a").unwrap().done_okay(cycle(1, 0)));
    }

    #[tokio::test]
    async fn test_retrospective_admits_one_cycle_per_pass() {
        let fx = Fixture::new(PIPELINE);
        let mut wf = fx.open().await.unwrap();

        for _ in 0..5 {
            wf.run_pass(at(5, 0, 0)).await.unwrap();
        }
        assert_eq!(wf.cycles(), vec![cycle(1, 0), cycle(2, 0), cycle(3, 0)]);
        assert!(!wf.has_pending_cycles());
    }

    #[tokio::test]
    async fn test_retrospective_flow_rate_quota() {
        let fx = Fixture::new(
            r#"
max_flow_rate: 2.5
schedules:
  hourly: "2024 1 1 * 0"
tasks:
  - { id: a, command: "/bin/a.sh", scheduler: local }
"#,
        );
        let mut wf = fx.open().await.unwrap();

        // 2.5 per hour: at most 5 admissions in any 2 hour window
        wf.run_pass(at(2, 0, 0)).await.unwrap();
        assert_eq!(wf.cycles().len(), 5);
        wf.run_pass(at(2, 1, 0)).await.unwrap();
        assert_eq!(wf.cycles().len(), 5);
        wf.run_pass(at(2, 2, 30)).await.unwrap();
        assert_eq!(wf.cycles().len(), 10);
        assert_eq!(wf.cycles()[9], cycle(1, 9));
    }

    #[tokio::test]
    async fn test_realtime_admission_with_lead_time() {
        let fx = Fixture::new(
            r#"
realtime: true
reservation_lead_time: 21600
schedules:
  six_hourly: "2024 1 1-2 0-18/6 0"
tasks:
  - { id: a, command: "/bin/a.sh", scheduler: local }
"#,
        );
        let mut wf = fx.open().await.unwrap();

        wf.run_pass(at(1, 7, 30)).await.unwrap();
        assert_eq!(wf.cycles(), vec![cycle(1, 6), cycle(1, 12)]);
        assert!(!wf.done());

        // Probe lands exactly on a cycle
        wf.run_pass(at(1, 12, 0)).await.unwrap();
        assert_eq!(wf.cycles(), vec![cycle(1, 6), cycle(1, 12), cycle(1, 18)]);
    }

    #[tokio::test]
    async fn test_halt_and_resume_start_fresh() {
        let fx = Fixture::new(ONCE);
        let mut wf = fx.open().await.unwrap();
        let now = at(1, 1, 0);
        let c = cycle(1, 0);

        wf.run_pass(now).await.unwrap();
        wf.halt(&[]).await.unwrap();
        assert_eq!(fx.batch.cancelled(), vec!["1"]);
        assert_eq!(wf.cycle_status(c), Some(CycleStatus::Halt));
        assert_eq!(wf.task("a").unwrap().attempts(c), 0);

        wf.run_pass(now).await.unwrap();
        assert_eq!(fx.batch.submissions().len(), 1);
        let halted = wf.status();
        assert_eq!(halted[0].status, CycleStatus::Halt);

        wf.resume(&[c]).await.unwrap();
        wf.run_pass(now).await.unwrap();
        assert_eq!(fx.batch.jobs_for("/bin/a.sh"), vec!["1", "2"]);
        assert_eq!(wf.task("a").unwrap().attempts(c), 1);
    }

    #[tokio::test]
    async fn test_halt_ignores_unknown_cycles() {
        let fx = Fixture::new(PIPELINE);
        let mut wf = fx.open().await.unwrap();
        wf.run_pass(at(1, 1, 0)).await.unwrap();

        wf.halt(&[cycle(9, 0)]).await.unwrap();
        assert_eq!(wf.cycles(), vec![cycle(1, 0)]);
        assert!(fx.batch.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_done_after_every_cycle_finishes() {
        let fx = Fixture::new(
            r#"
schedules:
  once: "2024 1 1 0 0"
tasks:
  - { id: a, command: "/bin/a.sh", scheduler: local, tries: 1 }
  - { id: b, command: "/bin/b.sh", scheduler: local }
"#,
        );
        let mut wf = fx.open().await.unwrap();
        let now = at(1, 1, 0);

        wf.run_pass(now).await.unwrap();
        assert!(!wf.done());

        // a gives up, which finishes the cycle even though b is still queued
        fx.batch.finish("1", 3);
        wf.run_pass(now).await.unwrap();
        assert!(wf.task("a").unwrap().crashed(cycle(1, 0)));
        assert!(wf.done());

        let status = wf.status();
        assert!(status[0].done);
        assert_eq!(status[0].tasks[0].exit_status, Some(3));
        assert_eq!(status[0].tasks[1].state, Some(JobState::Queued));
    }

    #[tokio::test]
    async fn test_state_survives_reopen_and_reload() {
        let fx = Fixture::new(PIPELINE);
        {
            let mut wf = fx.open().await.unwrap();
            wf.run_pass(at(1, 1, 0)).await.unwrap();
        }

        fx.write_definition(
            r#"
schedules:
  daily: "2024 1 1-3 0 0"
tasks:
  - id: c
    command: "/bin/c.sh"
    scheduler: local
  - id: a
    command: "/bin/a.sh"
    scheduler: local
    tries: 4
"#,
        );
        let wf = fx.open().await.unwrap();

        let a = wf.task("a").unwrap();
        assert_eq!(a.definition().tries, 4);
        assert_eq!(a.job(cycle(1, 0)).and_then(|j| j.id()), Some("1"));
        assert_eq!(a.in_flight(), 1);
        assert!(wf.task("b").is_none());
        assert!(wf.task("c").is_some());
        assert_eq!(wf.task_order(), vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_bad_reload_keeps_previous_definition() {
        let fx = Fixture::new(PIPELINE);
        let mut wf = fx.open().await.unwrap();
        wf.run_pass(at(1, 1, 0)).await.unwrap();

        fx.write_definition("tasks: [ { id: a } ]");
        wf.run_pass(at(1, 2, 0)).await.unwrap();
        assert!(wf.task("b").is_some());
        assert_eq!(wf.cycles(), vec![cycle(1, 0), cycle(2, 0)]);
    }

    #[tokio::test]
    async fn test_bad_definition_fails_first_open() {
        let fx = Fixture::new("schedules: { daily: \"2024 13 1 0 0\" }");
        assert!(matches!(fx.open().await, Err(WorkflowError::Definition(_))));
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let fx = Fixture::new(PIPELINE);
        let _wf = fx.open().await.unwrap();

        let err = fx.open().await.err().unwrap();
        assert!(matches!(err, WorkflowError::Locked(_)));
        assert!(err.to_string().contains("workflow is locked"));
    }

    #[tokio::test]
    async fn test_corrupt_store_of_retrospective_workflow_is_fatal() {
        let fx = Fixture::new(PIPELINE);
        std::fs::create_dir_all(fx.store().parent().unwrap()).unwrap();
        std::fs::write(fx.store(), "{\"cycles\": {").unwrap();

        let err = fx.open().await.err().unwrap();
        assert!(matches!(err, WorkflowError::Corrupt { .. }));
        assert!(err.to_string().contains("restore it from a backup"));
        assert_eq!(std::fs::read_to_string(fx.store()).unwrap(), "{\"cycles\": {");
    }

    #[tokio::test]
    async fn test_corrupt_store_of_realtime_workflow_is_reset() {
        let fx = Fixture::new(
            r#"
realtime: true
schedules:
  six_hourly: "2024 1 1-2 0-18/6 0"
tasks:
  - { id: a, command: "/bin/a.sh", scheduler: local }
"#,
        );
        std::fs::create_dir_all(fx.store().parent().unwrap()).unwrap();
        std::fs::write(fx.store(), "garbage").unwrap();

        let mut wf = fx.open().await.unwrap();
        assert!(wf.cycles().is_empty());
        wf.run_pass(at(1, 7, 0)).await.unwrap();
        assert_eq!(wf.cycles(), vec![cycle(1, 6)]);
    }
}
