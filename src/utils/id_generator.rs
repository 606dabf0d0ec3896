//! Run id generation.

use crate::types::RunId;
use uuid::Uuid;

/// Produces run ids. The default generator is uuid-v4; tests swap in
/// fixed ids by constructing [`RunId`] values directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        IdGenerator
    }

    #[must_use]
    pub fn generate(&self) -> RunId {
        RunId::new(Uuid::new_v4().to_string())
    }
}
