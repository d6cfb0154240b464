//! The main tracing layer feeding spans and events into a trace agent.
use std::sync::atomic;
use std::{env, path, sync, thread};

use trace_agent_core::{
    Agent, AgentWriterHandle, ArgValue, AsyncTraceWriter, Phase, TraceArgs, TraceConfig,
    TraceObject, TracingController, UseDefaultCategoryMode,
};
use tracing::span;
use tracing_subscriber::{layer, registry};

use crate::{args, error};

const METADATA_CATEGORY: &str = "__metadata";

/// A layer to be used with `tracing-subscriber` that turns spans into
/// begin/end trace events and events into instant trace events, and hands
/// them to an [`Agent`].
///
/// The callsite target is used as the category group. Nothing is produced
/// for targets that are not enabled in the agent's active trace config.
#[derive(Clone)]
#[repr(transparent)]
pub struct AgentLayer {
    inner: sync::Arc<Inner>,
}

struct ThreadLocalCtx {
    descriptor_sent: atomic::AtomicBool,
}

struct Inner {
    agent: Agent,
    controller: sync::Arc<TracingController>,
    process_name: String,
    process_descriptor_sent: atomic::AtomicBool,
    thread_local_ctxs: thread_local::ThreadLocal<ThreadLocalCtx>,
}

/// Span extension: the begin event was emitted, so the end event must be too.
struct SpanTraced {
    args: args::TraceArgsVisitor,
}

impl AgentLayer {
    pub fn new(agent: Agent) -> Self {
        let controller = agent.tracing_controller();
        let process_name = env::current_exe()
            .ok()
            .as_deref()
            .and_then(path::Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let inner = sync::Arc::new(Inner {
            agent,
            controller,
            process_name,
            process_descriptor_sent: atomic::AtomicBool::new(false),
            thread_local_ctxs: thread_local::ThreadLocal::new(),
        });
        Self { inner }
    }

    /// Registers `writer` with a fresh agent and enables the categories
    /// included by `config`.
    ///
    /// The returned handle keeps the writer registered; dropping it
    /// disconnects the writer and finishes its output.
    pub fn from_config<W>(
        config: &TraceConfig,
        writer: W,
    ) -> error::Result<(Self, AgentWriterHandle)>
    where
        W: AsyncTraceWriter + 'static,
    {
        let agent = Agent::new();
        let handle = agent.add_client(
            [] as [&str; 0],
            writer,
            UseDefaultCategoryMode::IgnoreDefaultCategories,
        )?;
        handle.enable(
            config
                .included_categories
                .iter()
                .filter(|c| !config.excluded_categories.contains(c)),
        );
        Ok((Self::new(agent), handle))
    }

    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    fn is_enabled(&self, meta: &tracing::Metadata) -> bool {
        self.inner.agent.is_category_group_enabled(meta.target())
    }

    fn ensure_context_known(&self) {
        self.ensure_process_known();
        self.ensure_thread_known();
    }

    fn ensure_process_known(&self) {
        let process_descriptor_sent = self
            .inner
            .process_descriptor_sent
            .fetch_or(true, atomic::Ordering::Relaxed);

        if !process_descriptor_sent {
            let event = self
                .new_event(Phase::Metadata, METADATA_CATEGORY, "process_name")
                .with_arg("name", ArgValue::Str(self.inner.process_name.clone()));
            self.inner.agent.append_trace_event(&event);
        }
    }

    fn ensure_thread_known(&self) {
        let thread_local_ctx = self.inner.thread_local_ctxs.get_or(|| ThreadLocalCtx {
            descriptor_sent: atomic::AtomicBool::new(false),
        });
        let thread_descriptor_sent = thread_local_ctx
            .descriptor_sent
            .fetch_or(true, atomic::Ordering::Relaxed);
        if !thread_descriptor_sent {
            let thread_name = thread::current().name().unwrap_or("").to_owned();
            let event = self
                .new_event(Phase::Metadata, METADATA_CATEGORY, "thread_name")
                .with_arg("name", ArgValue::Str(thread_name));
            self.inner.agent.append_trace_event(&event);
        }
    }

    fn new_event(&self, phase: Phase, category_group: &str, name: &str) -> TraceObject {
        TraceObject::new(phase, category_group, name)
            .with_timestamp(self.inner.controller.current_timestamp_microseconds())
            .with_tid(thread_id::get() as u64)
    }

    fn emit(&self, meta: &tracing::Metadata, phase: Phase, name: &str, args: TraceArgs) {
        self.ensure_context_known();
        let event = self.new_event(phase, meta.target(), name).with_args(args);
        self.inner.agent.append_trace_event(&event);
    }
}

impl<S> tracing_subscriber::Layer<S> for AgentLayer
where
    S: tracing::Subscriber,
    S: for<'a> registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: layer::Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let meta = span.metadata();
        if !self.is_enabled(meta) {
            return;
        }

        let mut begin_args = args::TraceArgsVisitor::default();
        attrs.record(&mut begin_args);
        self.emit(meta, Phase::Begin, meta.name(), begin_args.into_args());

        span.extensions_mut().insert(SpanTraced {
            args: args::TraceArgsVisitor::default(),
        });
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: layer::Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut extensions = span.extensions_mut();
        if let Some(traced) = extensions.get_mut::<SpanTraced>() {
            values.record(&mut traced.args);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
        let meta = event.metadata();
        if !self.is_enabled(meta) {
            return;
        }

        let mut visitor = args::TraceArgsVisitor::default();
        event.record(&mut visitor);
        let name = visitor.message().unwrap_or(meta.name()).to_owned();
        self.emit(meta, Phase::Instant, &name, visitor.into_args());
    }

    fn on_close(&self, id: span::Id, ctx: layer::Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };

        let Some(traced) = span.extensions_mut().remove::<SpanTraced>() else {
            return;
        };
        let meta = span.metadata();
        self.emit(meta, Phase::End, meta.name(), traced.args.into_args());
    }
}
