//! The interface trace sinks implement to receive events from the agent.
use crate::event::TraceObject;
use crate::run_loop::TraceLoop;

/// A trace sink.
///
/// `append_trace_event` and `flush` are called directly from producer
/// threads, concurrently, so implementations must serialize internally.
/// Sinks handle their own I/O failures; nothing is reported back to the
/// agent.
pub trait AsyncTraceWriter: Send + Sync {
    fn append_trace_event(&self, trace_event: &TraceObject);

    /// With `blocking`, return only once buffered events have been handed to
    /// the underlying storage.
    fn flush(&self, blocking: bool);

    /// Set up resources bound to the agent's background loop.
    ///
    /// Called at most once, on the loop thread, possibly after the first
    /// events were already appended.
    fn initialize_on_thread(&self, _event_loop: &mut TraceLoop) {}
}
