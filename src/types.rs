//! Core identifier and status types for the runloom engine.
//!
//! This module defines the fundamental vocabulary used throughout the
//! crate: step and run identifiers, per-step lifecycle statuses, and
//! run-level statuses. These are the domain concepts every other module
//! speaks in.
//!
//! # Key Types
//!
//! - [`StepKey`]: identifies one executable step within a plan
//! - [`RunId`]: identifies one execution attempt of a plan
//! - [`StepStatus`]: the monotonic per-step state machine
//! - [`RunStatus`]: the run-level terminal/non-terminal states
//!
//! # Examples
//!
//! ```rust
//! use runloom::types::{StepKey, StepStatus};
//!
//! let key = StepKey::new("ingest");
//! let nested = key.child("parse");
//! assert_eq!(nested.as_str(), "ingest.parse");
//!
//! assert!(StepStatus::Succeeded.is_terminal());
//! assert!(!StepStatus::Ready.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a single executable step within an execution plan.
///
/// Step keys are unique within a plan. When a composite node is flattened
/// the inner step names are joined to the composite name with `.`, so a
/// key also records the lineage of the flattening
/// (`"normalize.dedupe"` came from the `dedupe` step inside the
/// `normalize` composite).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepKey(String);

impl StepKey {
    pub fn new(name: impl Into<String>) -> Self {
        StepKey(name.into())
    }

    /// Key for a step nested under this one (composite flattening).
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        StepKey(format!("{}.{name}", self.0))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepKey {
    fn from(s: &str) -> Self {
        StepKey(s.to_string())
    }
}

impl From<String> for StepKey {
    fn from(s: String) -> Self {
        StepKey(s)
    }
}

/// Identifies one execution attempt of a plan.
///
/// Run ids are opaque strings; [`crate::utils::id_generator::IdGenerator`]
/// produces uuid-v4 ids, but callers may supply their own (e.g. for
/// deterministic tests).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Why a step was skipped rather than executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// A prior run produced an identical-version artifact that is still
    /// materialized; the output is reused.
    Memoized,
    /// A required upstream step failed (or was itself skipped for this
    /// reason), so this step can never become ready.
    UpstreamFailure,
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipCause::Memoized => write!(f, "memoized"),
            SkipCause::UpstreamFailure => write!(f, "upstream_failure"),
        }
    }
}

/// Per-step lifecycle status.
///
/// Transitions are monotonic: `Waiting → Ready → Started → Succeeded|Failed`,
/// with `Waiting → Skipped` as the only shortcut (memoization or upstream
/// failure). A retry never rewinds a status; it appends a new attempt
/// record in the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Upstream dependencies are not yet all terminal.
    Waiting,
    /// All dependencies satisfied; eligible for dispatch.
    Ready,
    /// Dispatched to an execution backend.
    Started,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal statuses never transition again within a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Waiting => "waiting",
            StepStatus::Ready => "ready",
            StepStatus::Started => "started",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Run-level status, derived exclusively by folding the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Starting,
    Started,
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Canceled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::Starting => "starting",
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}
