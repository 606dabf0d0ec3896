//! Step versioning and memoization resolution.
//!
//! A [`StepVersion`] is a content digest over everything that can change
//! a step's output: its declared code identity, its resolved config, and
//! the versions of its upstream inputs. Two steps with equal versions
//! are assumed to produce equal artifacts, which is what lets a
//! re-execution adopt a prior run's outputs instead of recomputing them.
//!
//! [`resolve`] walks a plan in dependency order against a [`PriorRun`]
//! and decides, per step, whether the prior artifact can be reused. The
//! decision is conservative: a step is only skipped when it is versioned,
//! its version matches the prior run, every upstream is itself skipped,
//! and every prior artifact is still materialized.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use miette::Diagnostic;
use thiserror::Error;

use crate::events::{EventPayload, StoredEvent};
use crate::io::{IoError, IoManager, OutputAddress};
use crate::plan::ExecutionPlan;
use crate::types::{RunId, StepKey};

/// Content digest identifying one versioned incarnation of a step.
///
/// Stored and compared as lowercase blake3 hex. Versions are total over
/// (code identity, config, upstream versions); a step whose upstream
/// chain contains any unversioned step has no version at all.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepVersion(String);

impl StepVersion {
    /// Digest a step from its code identity, resolved config, and the
    /// versions of its upstreams (sorted by step key before hashing, so
    /// declaration order never leaks into the digest).
    #[must_use]
    pub fn compute(
        code_version: &str,
        config: &Value,
        upstream_versions: &[(&StepKey, &StepVersion)],
    ) -> Self {
        let mut upstream: Vec<_> = upstream_versions.to_vec();
        upstream.sort_by_key(|(key, _)| (*key).clone());

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"code:");
        hasher.update(code_version.as_bytes());
        hasher.update(b"\nconfig:");
        hasher.update(canonical_json(config).as_bytes());
        for (key, version) in upstream {
            hasher.update(b"\nupstream:");
            hasher.update(key.as_str().as_bytes());
            hasher.update(b"=");
            hasher.update(version.0.as_bytes());
        }
        StepVersion(hasher.finalize().to_hex().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialize a JSON value with object keys in sorted order, recursively.
///
/// `serde_json::Value` already stores objects as a sorted map, but the
/// digest must not depend on that implementation detail.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// The memoization-relevant view of a completed run, reconstructed from
/// its stored events.
#[derive(Clone, Debug, Default)]
pub struct PriorRun {
    versions: FxHashMap<StepKey, StepVersion>,
    artifacts: FxHashMap<(StepKey, String), OutputAddress>,
}

impl PriorRun {
    /// Fold a prior run's event stream into version and artifact maps.
    ///
    /// `OutputReused` events are honored the same as `OutputHandled`, so
    /// reuse chains across several generations of runs resolve to the
    /// run that originally materialized the artifact.
    #[must_use]
    pub fn from_events(events: &[StoredEvent]) -> Self {
        let mut prior = PriorRun::default();
        for stored in events {
            let Some(step) = stored.event.step.clone() else {
                continue;
            };
            match &stored.event.payload {
                EventPayload::StepSucceeded {
                    version: Some(version),
                } => {
                    prior.versions.insert(step, version.clone());
                }
                EventPayload::StepSkipped { .. } => {}
                EventPayload::OutputHandled {
                    output, address, ..
                }
                | EventPayload::OutputReused { output, address } => {
                    prior
                        .artifacts
                        .insert((step, output.clone()), address.clone());
                }
                _ => {}
            }
        }
        prior
    }

    #[must_use]
    pub fn version_of(&self, step: &StepKey) -> Option<&StepVersion> {
        self.versions.get(step)
    }

    #[must_use]
    pub fn artifact(&self, step: &StepKey, output: &str) -> Option<&OutputAddress> {
        self.artifacts.get(&(step.clone(), output.to_string()))
    }
}

/// Failures during memoization resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum ResolveError {
    /// Every step in the plan resolved to a memoized skip. The run would
    /// do no work, which is treated as a caller mistake rather than an
    /// instant success.
    #[error("all {step_count} steps are memoized; nothing to execute")]
    #[diagnostic(
        code(runloom::version::no_steps_to_execute),
        help("Change a step's config or code version, or disable memoization for the run.")
    )]
    NoStepsToExecute { step_count: usize },

    #[error("artifact existence check failed")]
    #[diagnostic(code(runloom::version::io))]
    Io(
        #[from]
        #[diagnostic_source]
        IoError,
    ),
}

/// Per-step memoization decision for one run.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    /// Version digests for every versioned step in the plan, skipped or
    /// not. Recorded on `StepSucceeded` events so later runs can compare.
    versions: FxHashMap<StepKey, StepVersion>,
    /// Steps resolved to a memoized skip, with the prior artifact
    /// address to adopt for each declared output.
    reuse: FxHashMap<StepKey, Vec<(String, OutputAddress)>>,
}

impl Resolution {
    #[must_use]
    pub fn version_of(&self, step: &StepKey) -> Option<&StepVersion> {
        self.versions.get(step)
    }

    #[must_use]
    pub fn is_skipped(&self, step: &StepKey) -> bool {
        self.reuse.contains_key(step)
    }

    /// `(output, prior address)` pairs for a memoized step.
    #[must_use]
    pub fn reused_artifacts(&self, step: &StepKey) -> Option<&[(String, OutputAddress)]> {
        self.reuse.get(step).map(Vec::as_slice)
    }

    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.reuse.len()
    }
}

/// Decide, for every step in `plan`, whether a prior artifact can be
/// reused or the step must execute.
///
/// With `prior = None` (a fresh run) no step skips, but versions are
/// still computed and recorded so the *next* run can memoize. The
/// resolver is idempotent: resolving the same plan against the same
/// prior run twice yields the same resolution.
#[instrument(skip_all, fields(steps = plan.steps().len()))]
pub async fn resolve(
    plan: &ExecutionPlan,
    prior: Option<&PriorRun>,
    io: &dyn IoManager,
) -> Result<Resolution, ResolveError> {
    let mut resolution = Resolution::default();

    // Plan order is topological, so upstream versions and skip decisions
    // are always settled before their dependents are visited.
    for step in plan.steps() {
        let upstream_keys = step.upstream_keys();

        let version = step.code_version.as_deref().and_then(|code| {
            let mut pairs: Vec<(&StepKey, &StepVersion)> = Vec::with_capacity(upstream_keys.len());
            for up in &upstream_keys {
                pairs.push((*up, resolution.versions.get(*up)?));
            }
            Some(StepVersion::compute(code, &step.config_value(), &pairs))
        });
        if let Some(v) = &version {
            resolution.versions.insert(step.key.clone(), v.clone());
        }

        let Some(prior) = prior else {
            continue;
        };
        let Some(version) = &version else {
            continue;
        };

        // A step only skips when its whole upstream cone skipped;
        // otherwise a freshly-produced input could silently differ from
        // the one the prior artifact was computed from.
        let upstream_all_skipped = upstream_keys
            .iter()
            .all(|up| resolution.reuse.contains_key(*up));
        if !upstream_all_skipped || prior.version_of(&step.key) != Some(version) {
            continue;
        }

        let mut reusable = Vec::with_capacity(step.outputs.len());
        let mut all_materialized = true;
        for output in &step.outputs {
            let Some(address) = prior.artifact(&step.key, output) else {
                all_materialized = false;
                break;
            };
            if !io.exists(address).await? {
                debug!(step = %step.key, %output, "prior artifact evicted; re-executing");
                all_materialized = false;
                break;
            }
            reusable.push((output.clone(), address.clone()));
        }
        if all_materialized {
            resolution.reuse.insert(step.key.clone(), reusable);
        }
    }

    let step_count = plan.steps().len();
    if step_count > 0 && resolution.reuse.len() == step_count {
        return Err(ResolveError::NoStepsToExecute { step_count });
    }

    debug!(
        skipped = resolution.reuse.len(),
        versioned = resolution.versions.len(),
        "memoization resolved"
    );
    Ok(resolution)
}
