//! The run coordinator: the crate's top-level entry point.
//!
//! A [`RunCoordinator`] owns the event log, the I/O manager, and an
//! execution backend, and turns graphs plus run configs into scheduled
//! runs. Each run is one spawned scheduling pass; the coordinator keeps
//! only the cancellation handle. Status, history, and progress are all
//! answered by folding the event log, never from coordinator-local
//! state, so answers survive a restart.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runloom::config::RunConfig;
//! use runloom::events::InMemoryEventLog;
//! use runloom::executor::{ComputeOutput, FnCompute, InProcessExecutor};
//! use runloom::graph::{GraphBuilder, OutputDef, StepNode};
//! use runloom::io::InMemoryIoManager;
//! use runloom::plan::StepSelection;
//! use runloom::run::RunCoordinator;
//! use serde_json::json;
//!
//! # async fn demo() -> miette::Result<()> {
//! let graph = GraphBuilder::new("demo")
//!     .add_step(StepNode {
//!         name: "hello".into(),
//!         inputs: vec![],
//!         outputs: vec![OutputDef::result()],
//!         required_config: vec![],
//!         resource_keys: vec![],
//!         tolerant: false,
//!         code_version: None,
//!         compute: FnCompute::arc(|_| async { Ok(ComputeOutput::single(json!("hi"))) }),
//!     })
//!     .build()
//!     .map_err(|e| miette::Report::new(e))?;
//!
//! let coordinator = RunCoordinator::new(
//!     Arc::new(InMemoryEventLog::new()),
//!     Arc::new(InMemoryIoManager::new()),
//!     Arc::new(InProcessExecutor::new()),
//! );
//! let run_id = coordinator
//!     .submit(&graph, RunConfig::default(), StepSelection::all())
//!     .await
//!     .map_err(|e| miette::Report::new(e))?;
//! let status = coordinator.wait(&run_id).await.map_err(|e| miette::Report::new(e))?;
//! println!("{run_id}: {status}");
//! # Ok(())
//! # }
//! ```

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info, instrument};

use miette::Diagnostic;
use thiserror::Error;

use crate::config::{ExecutionConfig, RunConfig};
use crate::events::{
    EventLog, EventPayload, EventWatcher, LogError, RunEvent, RunStateFold, StoredEvent,
};
use crate::executor::StepExecutor;
use crate::graph::GraphDefinition;
use crate::io::IoManager;
use crate::plan::{ExecutionPlan, PlanBuilder, PlanError, StepSelection};
use crate::scheduler::{recover, RecoverySeed, Scheduler, SchedulerError};
use crate::types::{RunId, RunStatus, StepKey, StepStatus};
use crate::utils::IdGenerator;
use crate::version::{resolve, PriorRun, Resolution, ResolveError};

/// Errors surfaced by coordinator operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("unknown run {run_id}")]
    #[diagnostic(code(runloom::run::unknown))]
    UnknownRun { run_id: RunId },

    #[error("run {run_id} already finished with status {status}")]
    #[diagnostic(code(runloom::run::finished))]
    AlreadyFinished { run_id: RunId, status: RunStatus },

    #[error("run {run_id} has an unreadable config snapshot")]
    #[diagnostic(
        code(runloom::run::corrupt_snapshot),
        help("The log entry predates this version or was written by another tool.")
    )]
    CorruptSnapshot {
        run_id: RunId,
        #[source]
        source: serde_json::Error,
    },
}

/// What gets snapshotted into the `RunStarting` event, so a resume can
/// rebuild the exact same plan without the caller re-supplying config.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RunSubmission {
    config: RunConfig,
    selection: StepSelection,
}

/// Orchestrates runs end to end.
pub struct RunCoordinator {
    log: Arc<dyn EventLog>,
    io: Arc<dyn IoManager>,
    executor: Arc<dyn StepExecutor>,
    ids: IdGenerator,
    cancels: Arc<Mutex<FxHashMap<RunId, watch::Sender<bool>>>>,
}

impl RunCoordinator {
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        io: Arc<dyn IoManager>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        RunCoordinator {
            log,
            io,
            executor,
            ids: IdGenerator::new(),
            cancels: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Submit a fresh run: every selected step executes.
    pub async fn submit(
        &self,
        graph: &GraphDefinition,
        config: RunConfig,
        selection: StepSelection,
    ) -> Result<RunId, RunError> {
        self.launch(graph, config, selection, None).await
    }

    /// Submit a run memoized against `prior`: steps whose versions match
    /// and whose artifacts survive are skipped and their outputs reused.
    ///
    /// Fails with [`ResolveError::NoStepsToExecute`] when nothing would
    /// run at all.
    pub async fn reexecute(
        &self,
        graph: &GraphDefinition,
        config: RunConfig,
        selection: StepSelection,
        prior: &RunId,
    ) -> Result<RunId, RunError> {
        self.launch(graph, config, selection, Some(prior)).await
    }

    #[instrument(skip_all, fields(graph = %graph.name))]
    async fn launch(
        &self,
        graph: &GraphDefinition,
        config: RunConfig,
        selection: StepSelection,
        prior: Option<&RunId>,
    ) -> Result<RunId, RunError> {
        let plan = Arc::new(
            PlanBuilder::new(graph, &config)
                .select(selection.clone())
                .build()?,
        );
        let prior_run = match prior {
            Some(id) => Some(PriorRun::from_events(&self.log.events(id).await?)),
            None => None,
        };
        let resolution = resolve(&plan, prior_run.as_ref(), self.io.as_ref()).await?;

        let run_id = self.ids.generate();
        let submission = RunSubmission {
            config: config.clone(),
            selection,
        };
        self.log
            .append(RunEvent::run_scoped(
                run_id.clone(),
                EventPayload::RunStarting {
                    job: plan.job.clone(),
                    mode: config.mode.clone(),
                    parent: prior.cloned(),
                    tags: serde_json::to_value(&config.tags).map_err(LogError::Serialize)?,
                    config: serde_json::to_value(&submission).map_err(LogError::Serialize)?,
                },
            ))
            .await?;
        info!(run = %run_id, steps = plan.len(), skipped = resolution.skipped_count(), "run submitted");

        self.spawn_pass(
            plan,
            config.execution,
            run_id.clone(),
            resolution,
            RecoverySeed::default(),
        );
        Ok(run_id)
    }

    /// Resume an interrupted run from its log.
    ///
    /// The caller supplies the graph (compute bodies are not
    /// serializable); config and selection come from the run's own
    /// snapshot. Steps already terminal keep their outcome; steps whose
    /// outcome was lost are closed as failed, never re-dispatched.
    #[instrument(skip_all, fields(run = %run_id))]
    pub async fn resume(
        &self,
        graph: &GraphDefinition,
        run_id: &RunId,
    ) -> Result<(), RunError> {
        let events = self.log.events(run_id).await?;
        if events.is_empty() {
            return Err(RunError::UnknownRun {
                run_id: run_id.clone(),
            });
        }
        let fold = RunStateFold::replay(run_id.clone(), &events);
        if fold.status.is_terminal() {
            return Err(RunError::AlreadyFinished {
                run_id: run_id.clone(),
                status: fold.status,
            });
        }
        let submission: RunSubmission = serde_json::from_value(fold.config.clone())
            .map_err(|source| RunError::CorruptSnapshot {
                run_id: run_id.clone(),
                source,
            })?;
        let plan = Arc::new(
            PlanBuilder::new(graph, &submission.config)
                .select(submission.selection)
                .build()?,
        );

        let prior_run = match &fold.parent {
            Some(parent) => Some(PriorRun::from_events(&self.log.events(parent).await?)),
            None => None,
        };
        let resolution = resolve(&plan, prior_run.as_ref(), self.io.as_ref()).await?;
        let seed = recover(self.log.as_ref(), run_id).await?;
        info!(
            recovered = seed.terminal.len(),
            "resuming from recovered state"
        );
        self.spawn_pass(
            plan,
            submission.config.execution,
            run_id.clone(),
            resolution,
            seed,
        );
        Ok(())
    }

    fn spawn_pass(
        &self,
        plan: Arc<ExecutionPlan>,
        execution: ExecutionConfig,
        run_id: RunId,
        resolution: Resolution,
        seed: RecoverySeed,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .insert(run_id.clone(), cancel_tx);

        let scheduler = Scheduler::new(
            plan,
            execution,
            Arc::clone(&self.log),
            Arc::clone(&self.io),
            Arc::clone(&self.executor),
        );
        let cancels = Arc::clone(&self.cancels);
        tokio::spawn(async move {
            if let Err(err) = scheduler.run(run_id.clone(), resolution, seed, cancel_rx).await {
                // The log itself is down; there is nowhere durable left
                // to record this.
                error!(run = %run_id, error = %err, "scheduling pass aborted");
            }
            // The pass is over; a cancel for this run has nothing left
            // to signal.
            cancels
                .lock()
                .expect("cancel registry poisoned")
                .remove(&run_id);
        });
    }

    /// Request cooperative cancellation. In-flight steps observe the
    /// signal through their context; undispatched steps never start.
    pub fn cancel(&self, run_id: &RunId) -> Result<(), RunError> {
        let cancels = self.cancels.lock().expect("cancel registry poisoned");
        let Some(tx) = cancels.get(run_id) else {
            return Err(RunError::UnknownRun {
                run_id: run_id.clone(),
            });
        };
        let _ = tx.send(true);
        Ok(())
    }

    /// Current run status, folded from the log.
    pub async fn run_status(&self, run_id: &RunId) -> Result<RunStatus, RunError> {
        let events = self.log.events(run_id).await?;
        if events.is_empty() {
            return Err(RunError::UnknownRun {
                run_id: run_id.clone(),
            });
        }
        Ok(RunStateFold::replay(run_id.clone(), &events).status)
    }

    /// Per-step statuses, folded from the log. Steps the log has not
    /// mentioned are absent (they are `Waiting` by definition).
    pub async fn step_statuses(
        &self,
        run_id: &RunId,
    ) -> Result<FxHashMap<StepKey, StepStatus>, RunError> {
        let events = self.log.events(run_id).await?;
        let fold = RunStateFold::replay(run_id.clone(), &events);
        Ok(fold
            .steps()
            .iter()
            .filter_map(|(k, s)| s.status.map(|st| (k.clone(), st)))
            .collect())
    }

    /// Incremental event read for pollers.
    pub async fn events_since(
        &self,
        run_id: &RunId,
        after_seq: u64,
    ) -> Result<Vec<StoredEvent>, RunError> {
        Ok(self.log.events_since(run_id, after_seq).await?)
    }

    /// Live subscription to a run's events.
    #[must_use]
    pub fn watch(&self, run_id: &RunId) -> EventWatcher {
        self.log.watch(run_id)
    }

    /// Block until the run reaches a terminal status and return it.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus, RunError> {
        // Subscribe first, then catch up: a terminal event appended
        // between the two is caught by the status read, and one appended
        // after it reaches the live subscription. Backends without
        // backlog replay (the sqlite log) leave no window either way.
        let mut watcher = self.watch(run_id);
        let status = self.run_status(run_id).await?;
        if status.is_terminal() {
            return Ok(status);
        }
        while let Some(stored) = watcher.recv().await {
            match stored.event.payload {
                EventPayload::RunSuccess => return Ok(RunStatus::Success),
                EventPayload::RunFailure { .. } => return Ok(RunStatus::Failure),
                EventPayload::RunCanceled => return Ok(RunStatus::Canceled),
                _ => {}
            }
        }
        self.run_status(run_id).await
    }
}
