//! Pure folds from event streams to run and step state.
//!
//! No status is ever stored; [`RunStateFold::replay`] over the ordered
//! event sequence is the one authoritative way to answer "what state is
//! this run in". The scheduler uses the same fold incrementally (one
//! [`apply`](RunStateFold::apply) per append), so live state and
//! replayed state cannot diverge.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::events::{EventPayload, FailureInfo, RunEvent, StoredEvent};
use crate::types::{RunId, RunStatus, SkipCause, StepKey, StepStatus};
use crate::version::StepVersion;

/// Folded per-step state.
#[derive(Clone, Debug, Default)]
pub struct StepState {
    pub status: Option<StepStatus>,
    pub attempts: u32,
    pub version: Option<StepVersion>,
    pub failure: Option<FailureInfo>,
    pub skip_cause: Option<SkipCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Folded run-level state.
#[derive(Clone, Debug)]
pub struct RunStateFold {
    pub run_id: RunId,
    pub status: RunStatus,
    pub job: Option<String>,
    pub mode: Option<String>,
    pub parent: Option<RunId>,
    pub tags: Value,
    pub config: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub engine_failure: Option<FailureInfo>,
    steps: FxHashMap<StepKey, StepState>,
    last_seq: u64,
}

impl RunStateFold {
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        RunStateFold {
            run_id,
            status: RunStatus::NotStarted,
            job: None,
            mode: None,
            parent: None,
            tags: Value::Null,
            config: Value::Null,
            started_at: None,
            finished_at: None,
            engine_failure: None,
            steps: FxHashMap::default(),
            last_seq: 0,
        }
    }

    /// Fold a complete stored stream. Events out of sequence order or
    /// already folded (by seq) are ignored, so replaying an overlapping
    /// window is harmless.
    #[must_use]
    pub fn replay(run_id: RunId, events: &[StoredEvent]) -> Self {
        let mut fold = RunStateFold::new(run_id);
        for stored in events {
            fold.apply_stored(stored);
        }
        fold
    }

    /// Fold one stored event, de-duplicating by sequence number.
    pub fn apply_stored(&mut self, stored: &StoredEvent) {
        if stored.seq <= self.last_seq {
            return;
        }
        self.last_seq = stored.seq;
        self.apply(&stored.event);
    }

    /// Fold one event without sequence tracking (scheduler-internal use,
    /// where ordering is guaranteed by the single writer).
    pub fn apply(&mut self, event: &RunEvent) {
        match &event.payload {
            EventPayload::RunStarting {
                job,
                mode,
                parent,
                tags,
                config,
            } => {
                self.status = RunStatus::Starting;
                self.job = Some(job.clone());
                self.mode = Some(mode.clone());
                self.parent = parent.clone();
                self.tags = tags.clone();
                self.config = config.clone();
            }
            EventPayload::RunStarted => {
                self.status = RunStatus::Started;
                self.started_at = Some(event.at);
            }
            EventPayload::RunSuccess => {
                self.status = RunStatus::Success;
                self.finished_at = Some(event.at);
            }
            EventPayload::RunFailure { .. } => {
                self.status = RunStatus::Failure;
                self.finished_at = Some(event.at);
            }
            EventPayload::RunCanceled => {
                self.status = RunStatus::Canceled;
                self.finished_at = Some(event.at);
            }
            EventPayload::StepStarted { attempt } => {
                if let Some(step) = &event.step {
                    let state = self.steps.entry(step.clone()).or_default();
                    state.status = Some(StepStatus::Started);
                    state.attempts = (*attempt).max(state.attempts);
                    state.started_at = Some(event.at);
                }
            }
            EventPayload::StepSucceeded { version } => {
                if let Some(step) = &event.step {
                    let state = self.steps.entry(step.clone()).or_default();
                    state.status = Some(StepStatus::Succeeded);
                    state.version = version.clone();
                    state.finished_at = Some(event.at);
                }
            }
            EventPayload::StepFailed { failure } => {
                if let Some(step) = &event.step {
                    let state = self.steps.entry(step.clone()).or_default();
                    state.status = Some(StepStatus::Failed);
                    state.failure = Some(failure.clone());
                    state.finished_at = Some(event.at);
                }
            }
            EventPayload::StepSkipped { cause } => {
                if let Some(step) = &event.step {
                    let state = self.steps.entry(step.clone()).or_default();
                    state.status = Some(StepStatus::Skipped);
                    state.skip_cause = Some(*cause);
                    state.finished_at = Some(event.at);
                }
            }
            EventPayload::EngineFailure { failure } => {
                self.engine_failure = Some(failure.clone());
            }
            EventPayload::StepMessage { .. }
            | EventPayload::OutputHandled { .. }
            | EventPayload::OutputReused { .. }
            | EventPayload::ResourceInitFailed { .. } => {}
        }
    }

    /// Step status, defaulting to `Waiting` for steps the log has not
    /// mentioned yet.
    #[must_use]
    pub fn step_status(&self, step: &StepKey) -> StepStatus {
        self.steps
            .get(step)
            .and_then(|s| s.status)
            .unwrap_or(StepStatus::Waiting)
    }

    #[must_use]
    pub fn step_state(&self, step: &StepKey) -> Option<&StepState> {
        self.steps.get(step)
    }

    /// All steps the log has mentioned, with their folded state.
    #[must_use]
    pub fn steps(&self) -> &FxHashMap<StepKey, StepState> {
        &self.steps
    }

    /// Steps that were started but never reached a terminal status.
    /// After a crash these are the steps whose outcome was lost; resume
    /// marks them failed rather than re-dispatching, because the backend
    /// may still be (or have been) running them.
    #[must_use]
    pub fn interrupted_steps(&self) -> Vec<StepKey> {
        let mut keys: Vec<StepKey> = self
            .steps
            .iter()
            .filter(|(_, s)| s.status == Some(StepStatus::Started))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Steps with a terminal status of `Failed`.
    #[must_use]
    pub fn failed_steps(&self) -> Vec<StepKey> {
        let mut keys: Vec<StepKey> = self
            .steps
            .iter()
            .filter(|(_, s)| s.status == Some(StepStatus::Failed))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Highest folded sequence number; `events_since` resumes from here.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(seq: u64, event: RunEvent) -> StoredEvent {
        StoredEvent { seq, event }
    }

    #[test]
    fn fold_tracks_run_lifecycle() {
        let run = RunId::new("r1");
        let events = vec![
            stored(
                1,
                RunEvent::run_scoped(
                    run.clone(),
                    EventPayload::RunStarting {
                        job: "etl".into(),
                        mode: "default".into(),
                        parent: None,
                        tags: json!({}),
                        config: json!({}),
                    },
                ),
            ),
            stored(2, RunEvent::run_scoped(run.clone(), EventPayload::RunStarted)),
            stored(
                3,
                RunEvent::step_scoped(
                    run.clone(),
                    StepKey::new("a"),
                    EventPayload::StepStarted { attempt: 1 },
                ),
            ),
            stored(
                4,
                RunEvent::step_scoped(
                    run.clone(),
                    StepKey::new("a"),
                    EventPayload::StepSucceeded { version: None },
                ),
            ),
            stored(5, RunEvent::run_scoped(run.clone(), EventPayload::RunSuccess)),
        ];

        let fold = RunStateFold::replay(run, &events);
        assert_eq!(fold.status, RunStatus::Success);
        assert_eq!(fold.job.as_deref(), Some("etl"));
        assert_eq!(fold.step_status(&StepKey::new("a")), StepStatus::Succeeded);
        assert_eq!(fold.step_status(&StepKey::new("never")), StepStatus::Waiting);
        assert_eq!(fold.last_seq(), 5);
    }

    #[test]
    fn interrupted_steps_are_started_without_terminal() {
        let run = RunId::new("r1");
        let events = vec![
            stored(
                1,
                RunEvent::step_scoped(
                    run.clone(),
                    StepKey::new("a"),
                    EventPayload::StepStarted { attempt: 1 },
                ),
            ),
            stored(
                2,
                RunEvent::step_scoped(
                    run.clone(),
                    StepKey::new("b"),
                    EventPayload::StepStarted { attempt: 1 },
                ),
            ),
            stored(
                3,
                RunEvent::step_scoped(
                    run.clone(),
                    StepKey::new("b"),
                    EventPayload::StepFailed {
                        failure: FailureInfo::msg("boom"),
                    },
                ),
            ),
        ];
        let fold = RunStateFold::replay(run, &events);
        assert_eq!(fold.interrupted_steps(), vec![StepKey::new("a")]);
        assert_eq!(fold.failed_steps(), vec![StepKey::new("b")]);
    }

    #[test]
    fn duplicate_seq_is_ignored() {
        let run = RunId::new("r1");
        let event = stored(
            1,
            RunEvent::step_scoped(
                run.clone(),
                StepKey::new("a"),
                EventPayload::StepStarted { attempt: 1 },
            ),
        );
        let mut fold = RunStateFold::new(run);
        fold.apply_stored(&event);
        fold.apply_stored(&event);
        assert_eq!(fold.step_state(&StepKey::new("a")).unwrap().attempts, 1);
    }
}
