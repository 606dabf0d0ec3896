//! Dependency-driven step scheduling.
//!
//! One scheduling pass owns one run. The loop is the single writer of
//! the run's event log: executors stream their events into a completion
//! channel and the loop persists them in arrival order, so per-run
//! sequence numbers are totally ordered without any backend
//! coordination.
//!
//! Dispatch is deterministic among simultaneously ready steps: highest
//! priority first, plan order as the tie-break. A step is dispatched at
//! most once per attempt, and its `StepStarted` event is durably
//! appended *before* the backend is invoked; if the log cannot record
//! the start, the step does not start and the run aborts.

mod recovery;
mod resources;

pub use recovery::{recover, RecoverySeed};
pub use resources::ResourcePools;

use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ExecutionConfig;
use crate::events::{EventLog, EventPayload, FailureInfo, LogError, RunEvent};
use crate::executor::{InputValue, ResolvedInput, StepExecutor, StepInvocation};
use crate::io::{IoManager, OutputAddress};
use crate::plan::{ExecutionPlan, InputSource, StepDefinition};
use crate::types::{RunId, RunStatus, SkipCause, StepKey, StepStatus};
use crate::version::Resolution;

/// Fatal scheduling failures. User-code failures are events, never
/// errors; only infrastructure reaching this type aborts a run.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("event log write failed; run aborted")]
    #[diagnostic(
        code(runloom::scheduler::log_write),
        help("The log is the source of truth; scheduling cannot outrun it.")
    )]
    LogWrite(
        #[from]
        #[diagnostic_source]
        LogError,
    ),
}

/// Final result of one scheduling pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub failed_steps: Vec<StepKey>,
}

/// Heap entry ordering: priority descending, plan index ascending.
#[derive(PartialEq, Eq)]
struct ReadyEntry {
    priority: i64,
    index: usize,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One scheduling pass over one plan.
pub struct Scheduler {
    plan: Arc<ExecutionPlan>,
    execution: ExecutionConfig,
    log: Arc<dyn EventLog>,
    io: Arc<dyn IoManager>,
    executor: Arc<dyn StepExecutor>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        plan: Arc<ExecutionPlan>,
        execution: ExecutionConfig,
        log: Arc<dyn EventLog>,
        io: Arc<dyn IoManager>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Scheduler {
            plan,
            execution,
            log,
            io,
            executor,
        }
    }

    /// Drive the run to a terminal status.
    ///
    /// `resolution` carries the memoization decisions, `seed` the
    /// terminal statuses surviving from an interrupted pass (empty for
    /// a fresh run), and `cancel` the cooperative cancellation signal.
    #[instrument(skip_all, fields(run = %run_id, steps = self.plan.len()))]
    pub async fn run(
        &self,
        run_id: RunId,
        resolution: Resolution,
        seed: RecoverySeed,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, SchedulerError> {
        let (completions_tx, completions_rx) = flume::unbounded::<RunEvent>();
        let mut state = RunLoop {
            plan: Arc::clone(&self.plan),
            log: Arc::clone(&self.log),
            io: Arc::clone(&self.io),
            executor: Arc::clone(&self.executor),
            run_id: run_id.clone(),
            resolution,
            status: FxHashMap::default(),
            skip_cause: seed.skip_causes.clone(),
            reused_from_log: seed.reused.clone(),
            pending: FxHashMap::default(),
            attempts: seed.attempts.clone(),
            ready: BinaryHeap::new(),
            running: 0,
            remaining: 0,
            pools: ResourcePools::new(&self.execution.resources),
            max_concurrent: self.execution.max_concurrent.max(1),
            completions_tx,
            cancel: cancel.clone(),
            canceled: *cancel.borrow(),
            engine_failed: false,
        };

        self.log
            .append(RunEvent::run_scoped(run_id.clone(), EventPayload::RunStarted))
            .await?;

        state.initialize(&seed).await?;
        state.drive(completions_rx, cancel).await?;

        let failed_steps = state.failed_steps();
        let status = if state.canceled && state.remaining > 0 {
            self.log
                .append(RunEvent::run_scoped(run_id.clone(), EventPayload::RunCanceled))
                .await?;
            RunStatus::Canceled
        } else if !failed_steps.is_empty() || state.engine_failed {
            self.log
                .append(RunEvent::run_scoped(
                    run_id.clone(),
                    EventPayload::RunFailure {
                        failed_steps: failed_steps.clone(),
                    },
                ))
                .await?;
            RunStatus::Failure
        } else {
            self.log
                .append(RunEvent::run_scoped(run_id.clone(), EventPayload::RunSuccess))
                .await?;
            RunStatus::Success
        };
        info!(%status, failed = failed_steps.len(), "run finished");
        Ok(RunOutcome {
            status,
            failed_steps,
        })
    }
}

struct RunLoop {
    plan: Arc<ExecutionPlan>,
    log: Arc<dyn EventLog>,
    io: Arc<dyn IoManager>,
    executor: Arc<dyn StepExecutor>,
    run_id: RunId,
    resolution: Resolution,
    status: FxHashMap<StepKey, StepStatus>,
    skip_cause: FxHashMap<StepKey, SkipCause>,
    /// Artifact adoptions replayed from the log on resume; consulted
    /// when a seeded memo-skip is absent from this pass's resolution.
    reused_from_log: FxHashMap<StepKey, Vec<(String, OutputAddress)>>,
    pending: FxHashMap<StepKey, usize>,
    attempts: FxHashMap<StepKey, u32>,
    ready: BinaryHeap<ReadyEntry>,
    running: usize,
    remaining: usize,
    pools: ResourcePools,
    max_concurrent: usize,
    completions_tx: flume::Sender<RunEvent>,
    cancel: watch::Receiver<bool>,
    canceled: bool,
    engine_failed: bool,
}

impl RunLoop {
    /// Seed statuses, emit memoized skips, and make root steps ready.
    async fn initialize(&mut self, seed: &RecoverySeed) -> Result<(), SchedulerError> {
        for step in self.plan.steps() {
            let status = seed
                .terminal
                .get(&step.key)
                .copied()
                .unwrap_or(StepStatus::Waiting);
            self.status.insert(step.key.clone(), status);
        }
        self.remaining = self
            .status
            .values()
            .filter(|s| !s.is_terminal())
            .count();

        // A zero-capacity resource can never grant a slot. Fail the
        // steps needing one up front so dependents cascade normally
        // instead of wedging the dispatch loop.
        let mut dead_resources: Vec<String> = Vec::new();
        for step in self.plan.steps() {
            if self.status[&step.key].is_terminal() {
                continue;
            }
            let Some(resource) = self.pools.dead_key(&step.resource_keys) else {
                continue;
            };
            if !dead_resources.iter().any(|r| r == resource) {
                dead_resources.push(resource.to_string());
                self.append(RunEvent::run_scoped(
                    self.run_id.clone(),
                    EventPayload::ResourceInitFailed {
                        resource: resource.to_string(),
                        failure: FailureInfo::msg("resource pool has zero capacity"),
                    },
                ))
                .await?;
            }
            self.append(RunEvent::step_scoped(
                self.run_id.clone(),
                step.key.clone(),
                EventPayload::StepFailed {
                    failure: FailureInfo::msg(format!("resource {resource} has zero capacity")),
                },
            ))
            .await?;
            self.status.insert(step.key.clone(), StepStatus::Failed);
            self.remaining -= 1;
        }

        // Memoized skips are decided up front; plan order guarantees a
        // skipped step's upstream cone is settled before it is visited.
        // A memo-skip is never honored over a failed upstream.
        for step in self.plan.steps() {
            if self.status[&step.key].is_terminal() || !self.resolution.is_skipped(&step.key) {
                continue;
            }
            if step.upstream_keys().into_iter().any(|u| self.failed_ish(u)) {
                continue;
            }
            self.append(RunEvent::step_scoped(
                self.run_id.clone(),
                step.key.clone(),
                EventPayload::StepSkipped {
                    cause: SkipCause::Memoized,
                },
            ))
            .await?;
            if let Some(artifacts) = self.resolution.reused_artifacts(&step.key) {
                for (output, address) in artifacts.to_vec() {
                    self.append(RunEvent::step_scoped(
                        self.run_id.clone(),
                        step.key.clone(),
                        EventPayload::OutputReused { output, address },
                    ))
                    .await?;
                }
            }
            self.status.insert(step.key.clone(), StepStatus::Skipped);
            self.skip_cause.insert(step.key.clone(), SkipCause::Memoized);
            self.remaining -= 1;
        }

        let mut settled = VecDeque::new();
        for step in self.plan.steps() {
            let pending = step
                .upstream_keys()
                .into_iter()
                .filter(|u| !self.status[*u].is_terminal())
                .count();
            self.pending.insert(step.key.clone(), pending);
            if !self.status[&step.key].is_terminal() && pending == 0 {
                settled.push_back(step.key.clone());
            }
        }
        for key in settled {
            self.settle(&key).await?;
        }
        Ok(())
    }

    /// Dispatch and persist completions until nothing is left to do.
    async fn drive(
        &mut self,
        completions: flume::Receiver<RunEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        loop {
            if !self.canceled {
                self.dispatch_round().await?;
            }
            if self.remaining == 0 || (self.canceled && self.running == 0) {
                return Ok(());
            }
            if self.running == 0 {
                // Slots are free yet nothing could start: resource
                // limits (e.g. a zero-size pool) have wedged the run.
                warn!("no step can be dispatched; aborting run");
                self.append(RunEvent::run_scoped(
                    self.run_id.clone(),
                    EventPayload::EngineFailure {
                        failure: FailureInfo::msg(
                            "resource limits leave remaining steps unschedulable",
                        ),
                    },
                ))
                .await?;
                self.engine_failed = true;
                return Ok(());
            }

            tokio::select! {
                changed = cancel.changed(), if !self.canceled => {
                    if changed.is_ok() && *cancel.borrow() {
                        info!("cancellation requested; draining in-flight steps");
                        self.canceled = true;
                    }
                }
                event = completions.recv_async() => {
                    let Ok(event) = event else {
                        // All senders dropped while steps are running
                        // cannot happen: the loop holds one.
                        continue;
                    };
                    self.on_event(event).await?;
                }
            }
        }
    }

    /// Persist one executor event; on a terminal, release slots and
    /// propagate readiness.
    async fn on_event(&mut self, event: RunEvent) -> Result<(), SchedulerError> {
        let terminal = event.is_step_terminal();
        let step_key = event.step.clone();
        let failed = matches!(event.payload, EventPayload::StepFailed { .. });
        self.append(event).await?;
        if !terminal {
            return Ok(());
        }
        let Some(key) = step_key else {
            return Ok(());
        };
        let Some(step) = self.plan.step(&key) else {
            return Ok(());
        };
        let resource_keys = step.resource_keys.clone();

        self.status.insert(
            key.clone(),
            if failed {
                StepStatus::Failed
            } else {
                StepStatus::Succeeded
            },
        );
        self.running -= 1;
        self.remaining -= 1;
        self.pools.release(&resource_keys);
        debug!(step = %key, failed, "step terminal");

        let dependents: Vec<StepKey> = self.plan.dependents_of(&key).to_vec();
        for dependent in dependents {
            if self.status[&dependent].is_terminal() {
                continue;
            }
            let pending = self
                .pending
                .get_mut(&dependent)
                .expect("dependent tracked in pending map");
            *pending -= 1;
            if *pending == 0 {
                self.settle(&dependent).await?;
            }
        }
        Ok(())
    }

    /// All upstreams of `key` are terminal: mark it ready, or skip it
    /// (cascading) when a required upstream failed.
    ///
    /// After cancellation nothing settles: remaining steps stay waiting
    /// so the terminal status reflects that the run was cut short, not
    /// that its steps failed.
    async fn settle(&mut self, key: &StepKey) -> Result<(), SchedulerError> {
        if self.canceled {
            return Ok(());
        }
        let mut queue = VecDeque::from([key.clone()]);
        while let Some(key) = queue.pop_front() {
            let step = self
                .plan
                .step(&key)
                .expect("settled key belongs to the plan");
            let blocked = !step.tolerant
                && step.upstream_keys().into_iter().any(|u| self.failed_ish(u));
            if !blocked {
                self.status.insert(key.clone(), StepStatus::Ready);
                self.ready.push(ReadyEntry {
                    priority: step.priority,
                    index: self
                        .plan
                        .index_of(&key)
                        .expect("plan key has an index"),
                });
                continue;
            }

            self.append(RunEvent::step_scoped(
                self.run_id.clone(),
                key.clone(),
                EventPayload::StepSkipped {
                    cause: SkipCause::UpstreamFailure,
                },
            ))
            .await?;
            self.status.insert(key.clone(), StepStatus::Skipped);
            self.skip_cause
                .insert(key.clone(), SkipCause::UpstreamFailure);
            self.remaining -= 1;

            let dependents: Vec<StepKey> = self.plan.dependents_of(&key).to_vec();
            for dependent in dependents {
                if self.status[&dependent].is_terminal() {
                    continue;
                }
                let pending = self
                    .pending
                    .get_mut(&dependent)
                    .expect("dependent tracked in pending map");
                *pending -= 1;
                if *pending == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        Ok(())
    }

    /// Start as many ready steps as concurrency and resource limits
    /// allow, in deterministic order.
    async fn dispatch_round(&mut self) -> Result<(), SchedulerError> {
        let mut blocked = Vec::new();
        while self.running < self.max_concurrent {
            let Some(entry) = self.ready.pop() else {
                break;
            };
            let step = &self.plan.steps()[entry.index];
            if !self.pools.try_acquire(&step.resource_keys) {
                blocked.push(entry);
                continue;
            }
            let key = step.key.clone();
            self.dispatch(entry.index).await?;
            debug!(step = %key, running = self.running, "dispatched");
        }
        // Resource-blocked steps stay ready and are retried when a
        // slot-holding step terminates.
        for entry in blocked {
            self.ready.push(entry);
        }
        Ok(())
    }

    async fn dispatch(&mut self, index: usize) -> Result<(), SchedulerError> {
        let step = self.plan.steps()[index].clone();
        let attempt = self.attempts.get(&step.key).copied().unwrap_or(0) + 1;
        self.attempts.insert(step.key.clone(), attempt);

        // Durability before dispatch: a start the log did not record
        // must not happen.
        self.append(RunEvent::step_scoped(
            self.run_id.clone(),
            step.key.clone(),
            EventPayload::StepStarted { attempt },
        ))
        .await?;
        self.status.insert(step.key.clone(), StepStatus::Started);
        self.running += 1;

        let invocation = StepInvocation {
            run_id: self.run_id.clone(),
            step: step.key.clone(),
            attempt,
            config: step.config_value(),
            inputs: self.resolve_inputs(&step),
            outputs: step.outputs.clone(),
            version: self.resolution.version_of(&step.key).cloned(),
            compute: Arc::clone(&step.compute),
            cancel: self.cancel.clone(),
        };
        let stream = self.executor.execute(invocation, Arc::clone(&self.io));
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn resolve_inputs(&self, step: &StepDefinition) -> Vec<ResolvedInput> {
        step.inputs
            .iter()
            .map(|input| {
                let value = match &input.source {
                    InputSource::Literal(value) => InputValue::Literal(value.clone()),
                    InputSource::Upstream { step: up, output } => match self.status[up] {
                        StepStatus::Succeeded => InputValue::Stored(OutputAddress::new(
                            self.run_id.clone(),
                            up.clone(),
                            output.clone(),
                        )),
                        StepStatus::Skipped
                            if self.skip_cause.get(up) == Some(&SkipCause::Memoized) =>
                        {
                            self.reused_artifact(up, output)
                                .map(InputValue::Stored)
                                .unwrap_or(InputValue::Absent)
                        }
                        // Reachable only for tolerant steps: the input
                        // is absent from the compute context.
                        _ => InputValue::Absent,
                    },
                };
                ResolvedInput {
                    name: input.name.clone(),
                    value,
                }
            })
            .collect()
    }

    /// Adopted address for one output of a memoized step, from this
    /// pass's resolution or, on resume, from the replayed log.
    fn reused_artifact(&self, step: &StepKey, output: &str) -> Option<OutputAddress> {
        self.resolution
            .reused_artifacts(step)
            .into_iter()
            .flatten()
            .chain(self.reused_from_log.get(step).into_iter().flatten())
            .find(|(name, _)| name == output)
            .map(|(_, addr)| addr.clone())
    }

    fn failed_ish(&self, key: &StepKey) -> bool {
        match self.status.get(key) {
            Some(StepStatus::Failed) => true,
            Some(StepStatus::Skipped) => {
                self.skip_cause.get(key) == Some(&SkipCause::UpstreamFailure)
            }
            _ => false,
        }
    }

    fn failed_steps(&self) -> Vec<StepKey> {
        let mut keys: Vec<StepKey> = self
            .status
            .iter()
            .filter(|(_, s)| **s == StepStatus::Failed)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    async fn append(&self, event: RunEvent) -> Result<(), SchedulerError> {
        self.log.append(event).await?;
        Ok(())
    }
}
