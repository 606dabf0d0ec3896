//! Typed lifecycle events.
//!
//! Every observable fact about a run is an appended [`RunEvent`]. Run
//! and step statuses are never stored directly; they are folds over the
//! ordered event sequence (see [`crate::events::fold`]), which is what
//! makes crash recovery and "replay this run to a UI" the same
//! operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::io::OutputAddress;
use crate::types::{RunId, SkipCause, StepKey};
use crate::version::StepVersion;

/// Structured failure detail carried by failure events.
///
/// Mirrors an error chain: `message` is the outermost description and
/// `cause` recurses through sources, so a UI can render the full chain
/// without re-running anything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<FailureInfo>>,
    #[serde(default)]
    pub context: Value,
}

impl Default for FailureInfo {
    fn default() -> Self {
        FailureInfo {
            message: String::new(),
            cause: None,
            context: Value::Null,
        }
    }
}

impl FailureInfo {
    pub fn msg(message: impl Into<String>) -> Self {
        FailureInfo {
            message: message.into(),
            cause: None,
            context: Value::Null,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: FailureInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Build a failure chain by walking an error's `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut info = FailureInfo::msg(err.to_string());
        if let Some(source) = err.source() {
            info.cause = Some(Box::new(FailureInfo::from_error(source)));
        }
        info
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// What happened, minus the envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Run was submitted; carries everything needed to reconstruct the
    /// run record by folding (see [`crate::events::RunStateFold`]).
    RunStarting {
        job: String,
        mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<RunId>,
        #[serde(default)]
        tags: Value,
        /// Resolved config snapshot for the run.
        #[serde(default)]
        config: Value,
    },
    /// Scheduler loop took ownership of the run.
    RunStarted,
    RunSuccess,
    RunFailure {
        failed_steps: Vec<StepKey>,
    },
    RunCanceled,

    StepStarted {
        attempt: u32,
    },
    StepSucceeded {
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<StepVersion>,
    },
    StepFailed {
        failure: FailureInfo,
    },
    StepSkipped {
        cause: SkipCause,
    },
    /// Free-form message emitted by a compute body.
    StepMessage {
        message: String,
    },

    /// An output value was materialized through the I/O manager.
    OutputHandled {
        output: String,
        address: OutputAddress,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<StepVersion>,
    },
    /// A memoized step's prior artifact was adopted as this run's
    /// artifact for that output.
    OutputReused {
        output: String,
        address: OutputAddress,
    },

    /// A declared resource failed to initialize; steps requiring it are
    /// skipped.
    ResourceInitFailed {
        resource: String,
        failure: FailureInfo,
    },
    /// Infrastructure failure (event-log write, executor unavailable).
    /// Fatal to the run and distinct from user code failures.
    EngineFailure {
        failure: FailureInfo,
    },
}

/// One immutable event as emitted by a component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepKey>,
    pub at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl RunEvent {
    pub fn run_scoped(run_id: RunId, payload: EventPayload) -> Self {
        RunEvent {
            run_id,
            step: None,
            at: Utc::now(),
            payload,
        }
    }

    pub fn step_scoped(run_id: RunId, step: StepKey, payload: EventPayload) -> Self {
        RunEvent {
            run_id,
            step: Some(step),
            at: Utc::now(),
            payload,
        }
    }

    /// Whether this payload ends the step's lifecycle.
    #[must_use]
    pub fn is_step_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::StepSucceeded { .. }
                | EventPayload::StepFailed { .. }
                | EventPayload::StepSkipped { .. }
        )
    }
}

/// An event as persisted: the emitted record plus its per-run monotonic
/// sequence number, assigned by the log on append. Watch subscribers
/// de-duplicate by `(run_id, seq)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: RunEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_info_walks_source_chain() {
        let inner = std::io::Error::other("disk offline");
        let info = FailureInfo::from_error(&inner);
        assert_eq!(info.message, "disk offline");
        assert!(info.cause.is_none());

        let chained = FailureInfo::msg("load failed").with_cause(info);
        assert_eq!(chained.cause.as_ref().unwrap().message, "disk offline");
    }

    #[test]
    fn payload_serde_round_trip() {
        let event = RunEvent::step_scoped(
            RunId::new("r1"),
            StepKey::new("train"),
            EventPayload::StepFailed {
                failure: FailureInfo::msg("boom"),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_failed\""));
        let back: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, event.payload);
    }
}
