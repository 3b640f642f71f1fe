//! Task - per-definition controller of jobs across cycles.

use cyclewm_batch::BatchSystem;
use cyclewm_core::{
    step_cycles, Cycle, DependencyNode, EvalContext, TaskDefinition, TaskLookup, Time,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

use crate::job::Job;
use crate::log::CycleLog;

/// Everything a task needs from the orchestrator during one pass.
pub struct RunContext<'a> {
    /// All other tasks, for dependency lookups
    pub others: &'a BTreeMap<String, Task>,

    /// Batch system the task submits to
    pub batch: &'a dyn BatchSystem,

    /// Lifecycle log
    pub log: &'a CycleLog,

    /// Time of the current pass
    pub now: Time,

    /// Timeout for each batch system call
    pub timeout: Duration,
}

/// A task definition plus its per-cycle runtime state.
///
/// Runtime state survives [`Task::alter`], so a definition reload does not
/// forget submitted jobs or attempt counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    definition: TaskDefinition,
    #[serde(default)]
    jobs: BTreeMap<Cycle, Job>,
    #[serde(default)]
    attempts: BTreeMap<Cycle, u32>,
    #[serde(default)]
    expired: BTreeSet<Cycle>,
    #[serde(default)]
    in_flight: u32,
    #[serde(default)]
    nruns: u64,
    #[serde(default)]
    cumulative_runtime: i64,
}

/// Dependency lookups over the task being run and all others.
struct TaskView<'a> {
    current: &'a Task,
    others: &'a BTreeMap<String, Task>,
}

impl TaskView<'_> {
    fn get(&self, id: &str) -> Option<&Task> {
        if id == self.current.id() {
            Some(self.current)
        } else {
            self.others.get(id)
        }
    }
}

impl TaskLookup for TaskView<'_> {
    fn done_okay(&self, task: &str, cycle: Cycle) -> bool {
        self.get(task).is_some_and(|t| t.done_okay(cycle))
    }

    fn done(&self, task: &str, cycle: Cycle) -> bool {
        self.get(task).is_some_and(|t| t.done(cycle))
    }

    fn offset_cycle(&self, task: &str, cycle: Cycle, offset: i32) -> Option<Cycle> {
        let task = self.get(task)?;
        step_cycles(&task.definition.schedules, cycle, offset)
    }
}

impl Task {
    /// Create a task with no runtime state.
    pub fn new(definition: TaskDefinition) -> Self {
        Self {
            definition,
            jobs: BTreeMap::new(),
            attempts: BTreeMap::new(),
            expired: BTreeSet::new(),
            in_flight: 0,
            nruns: 0,
            cumulative_runtime: 0,
        }
    }

    /// Task id.
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Current definition.
    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    /// Replace the definition, keeping runtime state.
    pub fn alter(&mut self, definition: TaskDefinition) {
        self.definition = definition;
    }

    /// Job for `cycle`, if one was submitted.
    pub fn job(&self, cycle: Cycle) -> Option<&Job> {
        self.jobs.get(&cycle)
    }

    /// Submission attempts made for `cycle`.
    pub fn attempts(&self, cycle: Cycle) -> u32 {
        self.attempts.get(&cycle).copied().unwrap_or(0)
    }

    /// Jobs submitted and not done, across all cycles.
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Succeeded for `cycle`.
    pub fn done_okay(&self, cycle: Cycle) -> bool {
        self.jobs.get(&cycle).is_some_and(Job::done_okay)
    }

    /// Crashed for `cycle` with no tries left.
    pub fn crashed(&self, cycle: Cycle) -> bool {
        let tries = self.definition.tries;
        self.jobs.get(&cycle).is_some_and(Job::crashed) && tries != 0 && self.attempts(cycle) >= tries
    }

    /// Succeeded or gave up for `cycle`.
    pub fn done(&self, cycle: Cycle) -> bool {
        self.done_okay(cycle) || self.crashed(cycle)
    }

    /// Passed its deadline for `cycle`.
    pub fn expired(&self, cycle: Cycle) -> bool {
        self.expired.contains(&cycle)
    }

    /// Throughput estimate from observed runtimes, `None` before the first
    /// success or when the task is not throttled.
    pub fn tasks_per_hour(&self) -> Option<f64> {
        if self.nruns == 0 || self.definition.throttle == 0 {
            return None;
        }
        let avg_hours = self.cumulative_runtime as f64 / self.nruns as f64 / 3600.0;
        (avg_hours > 0.0).then(|| f64::from(self.definition.throttle) / avg_hours)
    }

    /// Advance the task for `cycle`. Safe to call on every pass.
    pub async fn run(&mut self, cycle: Cycle, ctx: &RunContext<'_>) {
        if !self.definition.applies_to(cycle) || self.done(cycle) || self.expired(cycle) {
            return;
        }

        let mut expired = self
            .resolves(&self.definition.deadline_dependency, cycle, ctx)
            .unwrap_or(false);

        if self.jobs.contains_key(&cycle) {
            self.poll(cycle, ctx).await;
            if self.done_okay(cycle) {
                return;
            }
            expired |= self.timed_out(cycle, ctx.now);

            if self.jobs.get(&cycle).is_some_and(Job::crashed) {
                self.recover(cycle, expired, ctx).await;
            } else if self.hung(cycle, ctx) {
                self.abandon_hung(cycle, ctx).await;
                self.recover(cycle, expired, ctx).await;
            }
        } else {
            expired |= self.timed_out(cycle, ctx.now);
        }

        if expired {
            self.expire(cycle, ctx).await;
            return;
        }

        if !self.jobs.contains_key(&cycle) {
            self.start(cycle, ctx).await;
        }
    }

    /// Cancel any live job for `cycle` and forget the cycle.
    pub async fn halt(&mut self, cycle: Cycle, batch: &dyn BatchSystem, timeout: Duration, log: &CycleLog) {
        if let Some(job) = self.jobs.remove(&cycle) {
            if job.in_flight() {
                job.cancel(batch, timeout).await;
                self.in_flight = self.in_flight.saturating_sub(1);
                log.info(cycle, self.id(), format!("halted job {}", job.id().unwrap_or("-")));
            }
        }
        self.attempts.remove(&cycle);
        self.expired.remove(&cycle);
    }

    fn resolves(&self, node: &Option<DependencyNode>, cycle: Cycle, ctx: &RunContext<'_>) -> Option<bool> {
        let view = TaskView {
            current: self,
            others: ctx.others,
        };
        let eval = EvalContext {
            tasks: &view,
            now: ctx.now,
        };
        node.as_ref().map(|node| node.resolved(cycle, &eval))
    }

    fn has_headroom(&self) -> bool {
        self.definition.throttle == 0 || self.in_flight < self.definition.throttle
    }

    fn timed_out(&self, cycle: Cycle, now: Time) -> bool {
        let deadline = |timeout: Option<u64>| {
            timeout
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| cycle.add_seconds(secs))
                .map(|c| c.time())
        };
        let start = deadline(self.definition.start_timeout);
        let end = deadline(self.definition.end_timeout);
        if start.is_none() && end.is_none() {
            return false;
        }
        match self.jobs.get(&cycle) {
            Some(job) => job.expired(start, end, now),
            None => Job::new().expired(start, end, now),
        }
    }

    fn hung(&self, cycle: Cycle, ctx: &RunContext<'_>) -> bool {
        self.jobs.get(&cycle).is_some_and(Job::running)
            && self
                .resolves(&self.definition.hang_dependency, cycle, ctx)
                .unwrap_or(false)
    }

    async fn poll(&mut self, cycle: Cycle, ctx: &RunContext<'_>) {
        let Some(job) = self.jobs.get_mut(&cycle) else {
            return;
        };
        let outcome = job.update_state(ctx.batch, ctx.timeout).await;
        let job = job.clone();
        let job_id = job.id().unwrap_or("-");

        match outcome {
            Err(e) => ctx
                .log
                .warn(cycle, self.id(), format!("failed to poll job {job_id}: {e}")),
            Ok(false) => {}
            Ok(true) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if job.done_okay() {
                    let runtime = job.runtime_secs().unwrap_or(0);
                    self.nruns += 1;
                    self.cumulative_runtime += runtime;
                    ctx.log.info(
                        cycle,
                        self.id(),
                        format!("job {job_id} succeeded after {runtime}s"),
                    );
                } else {
                    let status = job
                        .exit_status()
                        .map_or_else(|| job.state().to_string(), |s| format!("exit status {s}"));
                    ctx.log.warn(
                        cycle,
                        self.id(),
                        format!(
                            "job {job_id} crashed ({status}), attempt {}",
                            self.attempts(cycle)
                        ),
                    );
                    if let Ok(Ok(queue)) =
                        tokio::time::timeout(ctx.timeout, ctx.batch.describe()).await
                    {
                        debug!(task = self.id(), %cycle, "batch queue after crash:\n{}", queue);
                    }
                }
            }
        }
    }

    async fn abandon_hung(&mut self, cycle: Cycle, ctx: &RunContext<'_>) {
        let Some(job) = self.jobs.get_mut(&cycle) else {
            return;
        };
        job.cancel(ctx.batch, ctx.timeout).await;
        let was_in_flight = job.abandon();
        let job_id = job.id().unwrap_or("-").to_string();
        if was_in_flight {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        ctx.log
            .warn(cycle, self.id(), format!("job {job_id} is hung, cancelled"));
    }

    /// Decide what to do about a crashed job.
    async fn recover(&mut self, cycle: Cycle, expired: bool, ctx: &RunContext<'_>) {
        let attempts = self.attempts(cycle);
        let tries = self.definition.tries;
        if tries != 0 && attempts >= tries {
            ctx.log.warn(
                cycle,
                self.id(),
                format!("giving up after {attempts} attempts"),
            );
            return;
        }
        if expired {
            return;
        }
        if !self.has_headroom() {
            debug!(task = self.id(), %cycle, in_flight = self.in_flight, "throttled, deferring retry");
            return;
        }

        ctx.log
            .info(cycle, self.id(), format!("retrying, attempt {}", attempts + 1));
        self.submit(cycle, ctx).await;
    }

    async fn expire(&mut self, cycle: Cycle, ctx: &RunContext<'_>) {
        self.expired.insert(cycle);
        if let Some(job) = self.jobs.get_mut(&cycle) {
            if job.in_flight() {
                job.cancel(ctx.batch, ctx.timeout).await;
                job.abandon();
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
        ctx.log.warn(cycle, self.id(), "expired");
    }

    async fn start(&mut self, cycle: Cycle, ctx: &RunContext<'_>) {
        if self.resolves(&self.definition.dependency, cycle, ctx) == Some(false) {
            debug!(task = self.id(), %cycle, "dependencies not met");
            return;
        }
        if !self.has_headroom() {
            debug!(task = self.id(), %cycle, in_flight = self.in_flight, "throttled, deferring submission");
            return;
        }
        self.submit(cycle, ctx).await;
    }

    async fn submit(&mut self, cycle: Cycle, ctx: &RunContext<'_>) {
        let attributes = self.definition.render_properties(cycle);
        let environment = self.definition.render_environment(cycle);
        let attempt = {
            let attempts = self.attempts.entry(cycle).or_insert(0);
            *attempts += 1;
            *attempts
        };

        let mut job = Job::new();
        let submitted = job
            .submit(
                ctx.batch,
                &self.definition.command,
                &attributes,
                &environment,
                ctx.timeout,
            )
            .await;

        match submitted {
            Ok(()) => {
                self.in_flight += 1;
                ctx.log.info(
                    cycle,
                    self.id(),
                    format!(
                        "submitted job {} (attempt {attempt})",
                        job.id().unwrap_or("-")
                    ),
                );
                self.jobs.insert(cycle, job);
            }
            Err(e) => {
                ctx.log.warn(
                    cycle,
                    self.id(),
                    format!("submission failed (attempt {attempt}): {e}"),
                );
                self.jobs.insert(cycle, Job::rejected());
            }
        }
    }
}
