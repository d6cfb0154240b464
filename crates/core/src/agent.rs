//! The agent distributing trace events to registered writers.
use std::collections::{BTreeMap, BTreeSet};
use std::{mem, sync, thread, time};

use crate::category::{CategoryFilter, CategoryTable};
use crate::config::TraceConfig;
use crate::controller::{ClockSource, MonotonicClock, TracingController};
use crate::error;
use crate::event::TraceObject;
use crate::handle::AgentWriterHandle;
use crate::run_loop::{AsyncHandle, LoopHandle, TraceLoop};
use crate::writer::AsyncTraceWriter;

pub(crate) const LOG_TARGET: &str = "trace-agent";

/// Id of the handle managing the default categories; it owns no writer.
pub(crate) const DEFAULT_HANDLE_ID: i32 = -1;

/// Whether a new client also picks up the categories enabled through
/// [`Agent::default_handle`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum UseDefaultCategoryMode {
    #[default]
    UseDefaultCategories,
    IgnoreDefaultCategories,
}

/// What happens to the background thread once the last writer disconnects.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ShutdownPolicy {
    /// Stop and join the thread; the next `add_client` starts a fresh one.
    #[default]
    StopWhenIdle,
    /// Keep the thread until the agent is dropped.
    KeepAlive,
}

/// Collects trace events from producers and fans them out to writers.
///
/// Cloning is cheap and yields another reference to the same agent. The
/// background thread and all writers are torn down when the last clone is
/// dropped; handles only hold a weak reference and become inert after that.
#[derive(Clone)]
#[repr(transparent)]
pub struct Agent {
    inner: sync::Arc<Inner>,
}

pub struct Builder {
    thread_name: String,
    shutdown_policy: ShutdownPolicy,
    clock: sync::Arc<dyn ClockSource>,
    flush_on_drop: bool,
}

pub(crate) struct Inner {
    // Serializes starting the background thread against joining a stopped
    // one. Taken before `registry`.
    lifecycle: sync::Mutex<()>,
    // Held for registry access only, never while calling into a writer.
    registry: sync::Mutex<Registry>,
    active_config: sync::RwLock<sync::Arc<TraceConfig>>,
    controller: sync::Arc<TracingController>,
    thread_name: String,
    shutdown_policy: ShutdownPolicy,
    flush_on_drop: bool,
}

struct Registry {
    next_writer_id: i32,
    categories: CategoryTable,
    // Ids are handed out in increasing order, so iteration follows
    // registration order.
    writers: BTreeMap<i32, Registration>,
    worker: Option<Worker>,
    // Told to stop, not joined yet.
    stopping: Vec<Worker>,
    threads_started: usize,
}

struct Registration {
    filter: CategoryFilter,
    writer: sync::Arc<dyn AsyncTraceWriter>,
    // The init queue of the worker that was running when this writer was
    // added.
    init: sync::Arc<WriterInit>,
}

struct Worker {
    init: sync::Arc<WriterInit>,
    initialize_writers: AsyncHandle,
    loop_handle: LoopHandle,
    thread: thread::JoinHandle<()>,
}

/// Writers waiting for `initialize_on_thread` on one worker, guarded
/// separately from the registry so slow initialization never blocks
/// producers.
#[derive(Default)]
struct WriterInit {
    pending: sync::Mutex<PendingInit>,
    initialized: sync::Condvar,
}

#[derive(Default)]
struct PendingInit {
    queued: BTreeMap<i32, sync::Arc<dyn AsyncTraceWriter>>,
    in_progress: BTreeSet<i32>,
}

impl Agent {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Register `writer` and return the handle that keeps it registered.
    ///
    /// Starts the background thread if needed. The writer's on-loop
    /// initialization is scheduled but not awaited; see
    /// [`AgentWriterHandle::wait_initialized`].
    pub fn add_client<I, S, W>(
        &self,
        categories: I,
        writer: W,
        mode: UseDefaultCategoryMode,
    ) -> error::Result<AgentWriterHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        W: AsyncTraceWriter + 'static,
    {
        let filter = CategoryFilter::new(categories);
        let writer: sync::Arc<dyn AsyncTraceWriter> = sync::Arc::new(writer);

        let _lifecycle = self
            .inner
            .lifecycle
            .lock()
            .map_err(|_| error::Error::PoisonedMutex)?;
        self.inner.join_stopping();

        let mut registry = self
            .inner
            .registry
            .lock()
            .map_err(|_| error::Error::PoisonedMutex)?;
        let init = self.inner.ensure_started(&mut registry)?;

        let filter = match mode {
            UseDefaultCategoryMode::UseDefaultCategories => {
                filter.union(&registry.categories.categories_of(DEFAULT_HANDLE_ID))
            }
            UseDefaultCategoryMode::IgnoreDefaultCategories => filter,
        };
        let id = registry.next_writer_id;
        registry.next_writer_id += 1;
        registry.writers.insert(
            id,
            Registration {
                filter,
                writer: sync::Arc::clone(&writer),
                init: sync::Arc::clone(&init),
            },
        );

        init.schedule(id, writer);
        if let Some(worker) = registry.worker.as_ref() {
            worker.initialize_writers.send();
        }
        tracing::debug!(target: LOG_TARGET, id, "added trace writer");

        Ok(AgentWriterHandle::new(sync::Arc::downgrade(&self.inner), id))
    }

    /// A handle that only manages the default categories picked up by
    /// clients added with [`UseDefaultCategoryMode::UseDefaultCategories`].
    pub fn default_handle(&self) -> AgentWriterHandle {
        AgentWriterHandle::new(sync::Arc::downgrade(&self.inner), DEFAULT_HANDLE_ID)
    }

    /// Comma separated enabled categories, empty if none.
    pub fn get_enabled_categories(&self) -> String {
        self.inner.lock_registry().categories.enabled().join(",")
    }

    /// Deliver `trace_event` to every registered writer.
    ///
    /// Whether an event is produced at all is decided upstream against the
    /// enabled categories; writer filters are not consulted here.
    pub fn append_trace_event(&self, trace_event: &TraceObject) {
        for writer in self.inner.writers() {
            writer.append_trace_event(trace_event);
        }
    }

    /// Flush every registered writer.
    ///
    /// With `blocking`, returns once each writer's blocking flush returned.
    pub fn flush(&self, blocking: bool) {
        for writer in self.inner.writers() {
            writer.flush(blocking);
        }
    }

    /// A config including every currently enabled category.
    pub fn create_trace_config(&self) -> TraceConfig {
        build_trace_config(&self.inner.lock_registry().categories)
    }

    /// The config last published after a category change.
    ///
    /// Cheaper than [`Agent::create_trace_config`]: it does not touch the
    /// registry lock.
    pub fn active_trace_config(&self) -> sync::Arc<TraceConfig> {
        self.inner.active_config()
    }

    pub fn is_category_group_enabled(&self, category_group: &str) -> bool {
        self.inner
            .active_config()
            .is_category_group_enabled(category_group)
    }

    pub fn tracing_controller(&self) -> sync::Arc<TracingController> {
        sync::Arc::clone(&self.inner.controller)
    }

    /// Whether the background thread is running.
    pub fn is_started(&self) -> bool {
        self.inner.lock_registry().worker.is_some()
    }

    /// How many times the background thread has been spawned so far.
    pub fn threads_started(&self) -> usize {
        self.inner.lock_registry().threads_started
    }

    pub fn writer_count(&self) -> usize {
        self.inner.lock_registry().writers.len()
    }

    pub(crate) fn from_inner(inner: sync::Arc<Inner>) -> Self {
        Self { inner }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn lock_registry(&self) -> sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(target: LOG_TARGET, "recovering poisoned agent registry");
            poisoned.into_inner()
        })
    }

    fn active_config(&self) -> sync::Arc<TraceConfig> {
        let config = self
            .active_config
            .read()
            .unwrap_or_else(sync::PoisonError::into_inner);
        sync::Arc::clone(&config)
    }

    fn publish_config(&self, registry: &Registry) {
        let config = sync::Arc::new(build_trace_config(&registry.categories));
        *self
            .active_config
            .write()
            .unwrap_or_else(sync::PoisonError::into_inner) = config;
    }

    fn lock_lifecycle(&self) -> sync::MutexGuard<'_, ()> {
        self.lifecycle
            .lock()
            .unwrap_or_else(sync::PoisonError::into_inner)
    }

    /// Join workers that were told to stop. Called with `lifecycle` held so
    /// no new worker starts before the old ones are gone.
    fn join_stopping(&self) {
        let stopping = mem::take(&mut self.lock_registry().stopping);
        for worker in stopping {
            worker.join();
        }
    }

    /// Start the worker if needed and return its init queue.
    fn ensure_started(&self, registry: &mut Registry) -> error::Result<sync::Arc<WriterInit>> {
        if let Some(worker) = registry.worker.as_ref() {
            return Ok(sync::Arc::clone(&worker.init));
        }

        let init = sync::Arc::new(WriterInit::default());
        let mut event_loop = TraceLoop::new();
        let on_loop = sync::Arc::clone(&init);
        let initialize_writers =
            event_loop.new_async(move |event_loop| on_loop.initialize_on_thread(event_loop));
        let loop_handle = event_loop.handle();
        let thread = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                tracing::debug!(target: LOG_TARGET, "tracing thread started");
                event_loop.run();
                tracing::debug!(target: LOG_TARGET, "tracing thread stopped");
            })
            .map_err(error::Error::ThreadSpawn)?;

        registry.worker = Some(Worker {
            init: sync::Arc::clone(&init),
            initialize_writers,
            loop_handle,
            thread,
        });
        registry.threads_started += 1;
        Ok(init)
    }

    fn writers(&self) -> Vec<sync::Arc<dyn AsyncTraceWriter>> {
        self.lock_registry()
            .writers
            .values()
            .map(|r| sync::Arc::clone(&r.writer))
            .collect()
    }

    pub(crate) fn disconnect(&self, id: i32) {
        if id == DEFAULT_HANDLE_ID {
            return;
        }

        let (registration, stopped_elsewhere) = {
            let mut registry = self.lock_registry();
            let Some(registration) = registry.writers.remove(&id) else {
                return;
            };
            registration.init.cancel(id);
            if registry.categories.remove(id) {
                self.publish_config(&registry);
            }
            let mut stopped_elsewhere = false;
            if registry.writers.is_empty()
                && self.shutdown_policy == ShutdownPolicy::StopWhenIdle
            {
                if let Some(worker) = registry.worker.take() {
                    worker.stop();
                    // On the loop thread itself the join is left to the next
                    // `add_client` or to the agent's drop.
                    stopped_elsewhere = !worker.is_current();
                    registry.stopping.push(worker);
                }
            }
            (registration, stopped_elsewhere)
        };
        tracing::debug!(target: LOG_TARGET, id, "disconnected trace writer");

        drop(registration);
        if stopped_elsewhere {
            let _lifecycle = self.lock_lifecycle();
            self.join_stopping();
        }
    }

    /// The filter `id` was registered with.
    pub(crate) fn filter_of(&self, id: i32) -> Option<CategoryFilter> {
        self.lock_registry()
            .writers
            .get(&id)
            .map(|r| r.filter.clone())
    }

    pub(crate) fn enable(&self, id: i32, categories: &CategoryFilter) {
        let mut registry = self.lock_registry();
        if id != DEFAULT_HANDLE_ID && !registry.writers.contains_key(&id) {
            return;
        }
        if registry.categories.enable(id, categories) {
            self.publish_config(&registry);
        }
    }

    pub(crate) fn disable(&self, id: i32, categories: &CategoryFilter) {
        let mut registry = self.lock_registry();
        if registry.categories.disable(id, categories) {
            self.publish_config(&registry);
        }
    }

    pub(crate) fn controller(&self) -> sync::Arc<TracingController> {
        sync::Arc::clone(&self.controller)
    }

    pub(crate) fn wait_initialized(&self, id: i32, timeout: time::Duration) -> error::Result<()> {
        let init = match self.lock_registry().writers.get(&id) {
            Some(registration) => sync::Arc::clone(&registration.init),
            None => return Ok(()),
        };
        init.wait(id, timeout)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(sync::PoisonError::into_inner);
        if self.flush_on_drop {
            for registration in registry.writers.values() {
                registration.writer.flush(true);
            }
        }
        if let Some(worker) = registry.worker.take() {
            worker.stop();
            registry.stopping.push(worker);
        }
        for worker in registry.stopping.drain(..) {
            worker.join();
        }
        registry.writers.clear();
    }
}

impl Worker {
    fn stop(&self) {
        self.loop_handle.stop();
    }

    fn is_current(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    fn join(self) {
        if self.is_current() {
            // Dropped from a callback on the loop itself; the loop exits once
            // that callback returns.
            return;
        }
        if self.thread.join().is_err() {
            tracing::warn!(target: LOG_TARGET, "tracing thread panicked");
        }
    }
}

impl WriterInit {
    fn lock(&self) -> sync::MutexGuard<'_, PendingInit> {
        self.pending
            .lock()
            .unwrap_or_else(sync::PoisonError::into_inner)
    }

    fn schedule(&self, id: i32, writer: sync::Arc<dyn AsyncTraceWriter>) {
        self.lock().queued.insert(id, writer);
    }

    fn cancel(&self, id: i32) {
        self.lock().queued.remove(&id);
        self.initialized.notify_all();
    }

    fn initialize_on_thread(&self, event_loop: &mut TraceLoop) {
        loop {
            let batch = {
                let mut pending = self.lock();
                let batch = mem::take(&mut pending.queued);
                pending.in_progress.extend(batch.keys().copied());
                batch
            };
            if batch.is_empty() {
                break;
            }

            for (id, writer) in &batch {
                writer.initialize_on_thread(event_loop);
                tracing::debug!(target: LOG_TARGET, id, "initialized trace writer on thread");
            }

            let mut pending = self.lock();
            for id in batch.keys() {
                pending.in_progress.remove(id);
            }
            drop(pending);
            self.initialized.notify_all();
        }
    }

    fn wait(&self, id: i32, timeout: time::Duration) -> error::Result<()> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| error::Error::PoisonedMutex)?;
        let (_pending, result) = self
            .initialized
            .wait_timeout_while(pending, timeout, |p| p.is_pending(id))
            .map_err(|_| error::Error::PoisonedMutex)?;
        if result.timed_out() {
            return Err(error::Error::TimedOut);
        }
        Ok(())
    }
}

impl PendingInit {
    fn is_pending(&self, id: i32) -> bool {
        self.queued.contains_key(&id) || self.in_progress.contains(&id)
    }
}

impl Builder {
    fn new() -> Self {
        Self {
            thread_name: "trace-agent".to_owned(),
            shutdown_policy: ShutdownPolicy::default(),
            clock: sync::Arc::new(MonotonicClock),
            flush_on_drop: true,
        }
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn with_shutdown_policy(mut self, shutdown_policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = shutdown_policy;
        self
    }

    pub fn with_clock(mut self, clock: sync::Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether dropping the agent flushes writers (blocking) first.
    pub fn with_flush_on_drop(mut self, flush_on_drop: bool) -> Self {
        self.flush_on_drop = flush_on_drop;
        self
    }

    pub fn build(self) -> Agent {
        let inner = Inner {
            lifecycle: sync::Mutex::new(()),
            registry: sync::Mutex::new(Registry {
                next_writer_id: 1,
                categories: CategoryTable::default(),
                writers: BTreeMap::new(),
                worker: None,
                stopping: Vec::new(),
                threads_started: 0,
            }),
            active_config: sync::RwLock::new(sync::Arc::new(TraceConfig::default())),
            controller: sync::Arc::new(TracingController::new(self.clock)),
            thread_name: self.thread_name,
            shutdown_policy: self.shutdown_policy,
            flush_on_drop: self.flush_on_drop,
        };
        Agent::from_inner(sync::Arc::new(inner))
    }
}

fn build_trace_config(categories: &CategoryTable) -> TraceConfig {
    let mut config = TraceConfig::default();
    for category in categories.enabled() {
        config.add_included_category(category);
    }
    config
}
