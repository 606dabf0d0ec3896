//! Small shared utilities.

pub mod id_generator;
pub mod telemetry;

pub use id_generator::IdGenerator;
pub use telemetry::init_tracing;
