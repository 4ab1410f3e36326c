//! Shared plumbing for linemux: tracing setup and message id generation

pub mod ids;
pub mod tracing;

pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
