//! Event sourcing for runs: typed events, append-only storage, and the
//! folds that turn an event stream back into run state.

mod event;
mod fold;
mod log;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use event::{EventPayload, FailureInfo, RunEvent, StoredEvent};
pub use fold::{RunStateFold, StepState};
pub use log::{EventLog, EventWatcher, InMemoryEventLog, LogError};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventLog;
