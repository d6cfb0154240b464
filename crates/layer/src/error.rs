//! Common error definitions

use std::io;

/// Errors from the layer and the bundled writers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Failed to serialize trace event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Trace agent error: {0}")]
    Agent(#[from] trace_agent_core::Error),
    #[error("Encountered a poisoned mutex")]
    PoisonedMutex,
}

/// Convenience alias for [`std::result::Result`] using our own `Error` type.
pub type Result<A> = std::result::Result<A, Error>;
