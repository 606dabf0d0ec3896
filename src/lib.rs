//! # runloom
//!
//! An execution-plan engine for pipeline orchestration: graphs of
//! dependent steps are resolved into flat, topologically ordered plans,
//! scheduled with concurrency and resource limits, and recorded as an
//! append-only event log from which all run state is derived.
//!
//! ## Architecture
//!
//! - [`graph`]: the authoring layer of leaf steps and composite
//!   sub-graphs, validated into immutable [`graph::GraphDefinition`]s
//! - [`plan`]: composite flattening, input binding, step selection,
//!   strict config validation, deterministic topological ordering
//! - [`version`]: blake3 step versioning and memoization resolution
//!   against a prior run
//! - [`scheduler`]: the single-writer dispatch loop with priorities,
//!   concurrency caps, per-resource slot pools, cancellation, and crash
//!   recovery
//! - [`events`]: typed run events, append-only storage (in-memory, and
//!   SQLite behind the `sqlite` feature), and the folds that turn an
//!   event stream back into run and step status
//! - [`executor`]: the compute-body contract and the in-process backend
//! - [`io`]: the artifact load/store contract between steps
//! - [`run`]: the top-level [`run::RunCoordinator`]
//!
//! ## Design rules
//!
//! Statuses are never stored; they are folds over the event log, so
//! live state, crash recovery, and historical queries are the same
//! computation. Step dispatch is at-most-once per attempt: the start
//! event is durably appended before the backend is invoked, and a step
//! whose outcome was lost in a crash is closed as failed on resume
//! rather than re-dispatched.
//!
//! ## Quickstart
//!
//! See [`run::RunCoordinator`] for an end-to-end example.

pub mod config;
pub mod events;
pub mod executor;
pub mod graph;
pub mod io;
pub mod plan;
pub mod run;
pub mod scheduler;
pub mod types;
pub mod utils;
pub mod version;
