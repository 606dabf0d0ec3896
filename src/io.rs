//! The I/O manager contract.
//!
//! Step outputs are persisted and step inputs are loaded through an
//! [`IoManager`], keyed by [`OutputAddress`]. The scheduler treats the
//! manager as an opaque capability: it never inspects the transported
//! value's representation, and the memoization resolver relies only on
//! [`IoManager::exists`] to verify that a prior artifact is still
//! materialized.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

use miette::Diagnostic;
use thiserror::Error;

use crate::types::{RunId, StepKey};
use crate::version::StepVersion;

/// Addresses one materialized step output.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputAddress {
    pub run_id: RunId,
    pub step: StepKey,
    pub output: String,
}

impl OutputAddress {
    pub fn new(run_id: RunId, step: StepKey, output: impl Into<String>) -> Self {
        OutputAddress {
            run_id,
            step,
            output: output.into(),
        }
    }
}

impl std::fmt::Display for OutputAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.step, self.output)
    }
}

/// Failures raised by an I/O manager backend.
#[derive(Debug, Error, Diagnostic)]
pub enum IoError {
    #[error("artifact not found: {address}")]
    #[diagnostic(
        code(runloom::io::not_found),
        help("The artifact may have been garbage-collected; re-execute the producing step.")
    )]
    NotFound { address: OutputAddress },

    #[error("storage backend error: {message}")]
    #[diagnostic(code(runloom::io::backend))]
    Backend { message: String },
}

/// Abstract load/store capability for passing values between steps.
///
/// Implemented by storage collaborators; the engine ships an in-memory
/// reference implementation for tests and local execution.
#[async_trait]
pub trait IoManager: Send + Sync {
    /// Persist a step output value under `address`, tagged with the
    /// step version that produced it (when the step is versioned).
    async fn handle_output(
        &self,
        address: &OutputAddress,
        version: Option<&StepVersion>,
        value: Value,
    ) -> Result<(), IoError>;

    /// Load a previously materialized value.
    async fn load_input(&self, address: &OutputAddress) -> Result<Value, IoError>;

    /// Whether the artifact at `address` is still materialized. Used by
    /// the memoization resolver before committing to a skip.
    async fn exists(&self, address: &OutputAddress) -> Result<bool, IoError>;
}

#[derive(Clone, Debug)]
struct StoredArtifact {
    version: Option<StepVersion>,
    value: Value,
}

/// In-memory [`IoManager`] keyed by address.
#[derive(Default)]
pub struct InMemoryIoManager {
    store: Mutex<FxHashMap<OutputAddress, StoredArtifact>>,
}

impl InMemoryIoManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts (test observability).
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.lock().expect("artifact store poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Version tag recorded for an artifact, if any.
    #[must_use]
    pub fn version_of(&self, address: &OutputAddress) -> Option<StepVersion> {
        self.store
            .lock()
            .expect("artifact store poisoned")
            .get(address)
            .and_then(|a| a.version.clone())
    }

    /// Drop an artifact, simulating external garbage collection.
    pub fn evict(&self, address: &OutputAddress) {
        self.store
            .lock()
            .expect("artifact store poisoned")
            .remove(address);
    }
}

#[async_trait]
impl IoManager for InMemoryIoManager {
    async fn handle_output(
        &self,
        address: &OutputAddress,
        version: Option<&StepVersion>,
        value: Value,
    ) -> Result<(), IoError> {
        self.store.lock().expect("artifact store poisoned").insert(
            address.clone(),
            StoredArtifact {
                version: version.cloned(),
                value,
            },
        );
        Ok(())
    }

    async fn load_input(&self, address: &OutputAddress) -> Result<Value, IoError> {
        self.store
            .lock()
            .expect("artifact store poisoned")
            .get(address)
            .map(|a| a.value.clone())
            .ok_or_else(|| IoError::NotFound {
                address: address.clone(),
            })
    }

    async fn exists(&self, address: &OutputAddress) -> Result<bool, IoError> {
        Ok(self
            .store
            .lock()
            .expect("artifact store poisoned")
            .contains_key(address))
    }
}
