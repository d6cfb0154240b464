#![deny(clippy::all)]
/// # `trace-agent-layer`: A tracing layer and trace writers for `trace-agent-core`
// Internal modules:
mod args;

// Public modules:
pub mod error;
pub mod json_writer;
pub mod layer;

// Convenience re-exports:
pub use error::Error;
pub use json_writer::JsonTraceWriter;
pub use layer::AgentLayer;
