//! Resuming a run from its event log after a crash.
//!
//! Recovery is a replay fold plus one correction: a step whose last
//! event is `StepStarted` had its outcome lost with the process. It is
//! marked failed rather than re-dispatched, because dispatch is
//! at-most-once per attempt and the original backend invocation may
//! have had effects.

use rustc_hash::FxHashMap;
use tracing::{info, instrument};

use crate::events::{EventLog, EventPayload, FailureInfo, RunEvent, RunStateFold};
use crate::io::OutputAddress;
use crate::scheduler::SchedulerError;
use crate::types::{RunId, SkipCause, StepKey, StepStatus};

/// Terminal step state carried into a resumed scheduling pass.
///
/// A bare status is not enough: cascade and input resolution both
/// depend on *why* a step was skipped, and a memoized skip's adopted
/// artifact addresses must keep feeding downstream inputs.
#[derive(Clone, Debug, Default)]
pub struct RecoverySeed {
    pub terminal: FxHashMap<StepKey, StepStatus>,
    pub skip_causes: FxHashMap<StepKey, SkipCause>,
    pub reused: FxHashMap<StepKey, Vec<(String, OutputAddress)>>,
    pub attempts: FxHashMap<StepKey, u32>,
}

impl RecoverySeed {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terminal.is_empty()
    }
}

/// Fold a run's log, close out interrupted steps, and return the seed
/// for a fresh scheduling pass over the same plan.
#[instrument(skip(log))]
pub async fn recover(
    log: &dyn EventLog,
    run_id: &RunId,
) -> Result<RecoverySeed, SchedulerError> {
    let events = log.events(run_id).await?;
    let fold = RunStateFold::replay(run_id.clone(), &events);

    let mut seed = RecoverySeed::default();
    for (key, state) in fold.steps() {
        seed.attempts.insert(key.clone(), state.attempts);
        if let Some(status) = state.status {
            if status.is_terminal() {
                seed.terminal.insert(key.clone(), status);
            }
        }
        if let Some(cause) = state.skip_cause {
            seed.skip_causes.insert(key.clone(), cause);
        }
    }
    for stored in &events {
        if let EventPayload::OutputReused { output, address } = &stored.event.payload {
            if let Some(step) = &stored.event.step {
                seed.reused
                    .entry(step.clone())
                    .or_default()
                    .push((output.clone(), address.clone()));
            }
        }
    }

    for key in fold.interrupted_steps() {
        info!(step = %key, "closing out interrupted step");
        log.append(RunEvent::step_scoped(
            run_id.clone(),
            key.clone(),
            EventPayload::StepFailed {
                failure: FailureInfo::msg("interrupted: outcome lost before it was recorded"),
            },
        ))
        .await?;
        seed.terminal.insert(key, StepStatus::Failed);
    }

    Ok(seed)
}
