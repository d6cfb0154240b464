//! Common error definitions

use std::io;

/// Errors surfaced by the trace agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to spawn the tracing thread: {0}")]
    ThreadSpawn(#[source] io::Error),
    #[error("Encountered a poisoned mutex")]
    PoisonedMutex,
    #[error("The agent has been dropped")]
    AgentStopped,
    #[error("Failed to complete operation before timeout was reached")]
    TimedOut,
    #[error("Invalid trace config: {0}")]
    Config(#[from] serde_yaml::Error),
}

/// Convenience alias for [`std::result::Result`] using our own `Error` type.
pub type Result<A> = std::result::Result<A, Error>;
