#![deny(clippy::all)]
//! # `trace-agent-core`: fan trace events out to independently configured writers
//!
//! An [`Agent`] owns a registry of [`AsyncTraceWriter`]s and a background
//! thread running a [`TraceLoop`] on which writers set up loop-bound
//! resources. Clients register through [`Agent::add_client`] and keep the
//! returned [`AgentWriterHandle`] for as long as they want to receive events.
//! Categories enabled through handles are reference counted per handle.

// Internal modules:
mod category;
mod handle;

// Public modules:
pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod run_loop;
pub mod writer;

// Convenience re-exports:
pub use agent::{Agent, ShutdownPolicy, UseDefaultCategoryMode};
pub use category::{CategoryFilter, CategorySet};
pub use config::{RecordMode, TraceConfig};
pub use controller::{ClockSource, MonotonicClock, TracingController};
pub use error::Error;
pub use event::{ArgValue, Phase, TraceArgs, TraceObject};
pub use handle::AgentWriterHandle;
pub use run_loop::{AsyncHandle, LoopHandle, TimerId, TraceLoop};
pub use writer::AsyncTraceWriter;
