//! The move-only registration token handed to agent clients.
use std::{sync, time};

use crate::agent::{Agent, Inner};
use crate::category::CategoryFilter;
use crate::controller::TracingController;
use crate::error;

/// Keeps a writer registered with an [`Agent`].
///
/// Dropping the handle, or calling [`reset`](AgentWriterHandle::reset),
/// disconnects the writer exactly once. The handle is not `Clone`: there is
/// only ever one owner per registration. A default-constructed handle is
/// empty and every operation on it is a no-op.
#[derive(Debug, Default)]
pub struct AgentWriterHandle {
    agent: Option<sync::Weak<Inner>>,
    id: i32,
}

impl AgentWriterHandle {
    pub(crate) fn new(agent: sync::Weak<Inner>, id: i32) -> Self {
        Self {
            agent: Some(agent),
            id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.agent.is_none()
    }

    /// The registration id, `None` for an empty handle.
    pub fn id(&self) -> Option<i32> {
        self.agent.as_ref().map(|_| self.id)
    }

    /// Disconnect from the agent and leave the handle empty.
    pub fn reset(&mut self) {
        if let Some(inner) = self.agent.take().and_then(|agent| agent.upgrade()) {
            inner.disconnect(self.id);
        }
    }

    pub fn enable<I, S>(&self, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enable_filter(&CategoryFilter::new(categories));
    }

    pub fn disable<I, S>(&self, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disable_filter(&CategoryFilter::new(categories));
    }

    pub fn enable_filter(&self, categories: &CategoryFilter) {
        if let Some(inner) = self.upgrade() {
            inner.enable(self.id, categories);
        }
    }

    pub fn disable_filter(&self, categories: &CategoryFilter) {
        if let Some(inner) = self.upgrade() {
            inner.disable(self.id, categories);
        }
    }

    /// The categories this writer was registered with, including any
    /// default categories picked up at registration.
    ///
    /// The agent delivers every event to every writer; a writer that wants
    /// to narrow what it records can check events against this filter.
    pub fn filter(&self) -> Option<CategoryFilter> {
        self.upgrade().and_then(|inner| inner.filter_of(self.id))
    }

    /// The agent this handle is registered with, if both still exist.
    pub fn agent(&self) -> Option<Agent> {
        self.upgrade().map(Agent::from_inner)
    }

    pub fn tracing_controller(&self) -> Option<sync::Arc<TracingController>> {
        self.upgrade().map(|inner| inner.controller())
    }

    /// Block until the writer's on-loop initialization has run.
    ///
    /// Returns immediately for an empty handle or one whose writer was
    /// already initialized.
    pub fn wait_initialized(&self, timeout: time::Duration) -> error::Result<()> {
        if self.agent.is_none() {
            return Ok(());
        }
        let inner = self.upgrade().ok_or(error::Error::AgentStopped)?;
        inner.wait_initialized(self.id, timeout)
    }

    fn upgrade(&self) -> Option<sync::Arc<Inner>> {
        self.agent.as_ref().and_then(sync::Weak::upgrade)
    }
}

impl Drop for AgentWriterHandle {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handle_is_inert() {
        let mut handle = AgentWriterHandle::default();
        assert!(handle.is_empty());
        assert_eq!(handle.id(), None);
        handle.enable(["a"]);
        handle.disable(["a"]);
        assert!(handle.agent().is_none());
        assert!(handle.tracing_controller().is_none());
        assert!(handle.wait_initialized(time::Duration::ZERO).is_ok());
        handle.reset();
        handle.reset();
        assert!(handle.is_empty());
    }

    #[test]
    fn handle_outliving_agent_is_inert() {
        let agent = Agent::new();
        let handle = agent.default_handle();
        drop(agent);
        assert!(!handle.is_empty());
        assert!(handle.agent().is_none());
        assert!(matches!(
            handle.wait_initialized(time::Duration::ZERO),
            Err(error::Error::AgentStopped)
        ));
        handle.enable(["a"]);
    }
}
