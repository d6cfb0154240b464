//! A trace writer producing Chrome trace event JSON files.
use std::io::Write as _;
use std::sync::atomic;
use std::{fs, io, path, process, sync, time};

use bytes::BufMut as _;
use trace_agent_core::{AsyncHandle, AsyncTraceWriter, TimerId, TraceLoop, TraceObject};

use crate::error;

const LOG_TARGET: &str = "trace-agent";
const FILE_HEADER: &[u8] = b"{\"traceEvents\":[\n";
const FILE_FOOTER: &[u8] = b"\n]}\n";

/// Writes events to `{"traceEvents":[...]}` files.
///
/// Events are serialized into an in-memory buffer on the producer thread.
/// Once initialized on the agent's loop, the buffer is written out from the
/// loop periodically, when it grows past a threshold and on non-blocking
/// flushes. Blocking flushes write on the calling thread. After
/// `events_per_file` events the current file is finished and the next event
/// goes into a new file.
pub struct JsonTraceWriter {
    inner: sync::Arc<Inner>,
}

pub struct Builder {
    file_pattern: String,
    events_per_file: usize,
    flush_threshold: usize,
    flush_interval: time::Duration,
}

struct Inner {
    file_pattern: String,
    events_per_file: usize,
    flush_threshold: usize,
    flush_interval: time::Duration,
    state: sync::Mutex<State>,
    binding: sync::Mutex<Option<LoopBinding>>,
    closed: atomic::AtomicBool,
}

struct State {
    buffer: bytes::BytesMut,
    file: Option<io::BufWriter<fs::File>>,
    events_in_file: usize,
    rotation: u32,
    files: Vec<path::PathBuf>,
}

// Resources living on the agent loop.
struct LoopBinding {
    wake: AsyncHandle,
    timer: TimerId,
}

impl JsonTraceWriter {
    /// `file_pattern` may contain `${pid}` and `${rotation}`.
    pub fn builder(file_pattern: impl Into<String>) -> Builder {
        Builder::new(file_pattern.into())
    }

    /// Paths of all files opened so far, oldest first.
    pub fn files(&self) -> Vec<path::PathBuf> {
        self.inner.lock_state().files.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock_binding().is_some()
    }

    fn wake_loop(&self) -> bool {
        match self.inner.lock_binding().as_ref() {
            Some(binding) => binding.wake.send(),
            None => false,
        }
    }
}

impl AsyncTraceWriter for JsonTraceWriter {
    fn append_trace_event(&self, trace_event: &TraceObject) {
        let buffered = {
            let mut state = self.inner.lock_state();
            if state.events_in_file >= self.inner.events_per_file {
                if let Err(error) = self.inner.rotate(&mut state) {
                    tracing::warn!(target: LOG_TARGET, %error, "failed to rotate trace file");
                }
            }

            if let Err(error) = buffer_event(&mut state, trace_event) {
                tracing::warn!(target: LOG_TARGET, %error, "dropping trace event");
            }
            state.buffer.len()
        };

        if buffered >= self.inner.flush_threshold {
            self.wake_loop();
        }
    }

    fn flush(&self, blocking: bool) {
        if !blocking {
            self.wake_loop();
            return;
        }
        let mut state = self.inner.lock_state();
        if let Err(error) = self.inner.write_out(&mut state, true) {
            tracing::warn!(target: LOG_TARGET, %error, "failed to flush trace file");
        }
    }

    fn initialize_on_thread(&self, event_loop: &mut TraceLoop) {
        let inner = sync::Arc::clone(&self.inner);
        let wake = event_loop.new_async(move |event_loop| inner.on_wake(event_loop));
        let inner = sync::Arc::clone(&self.inner);
        let timer = event_loop.start_timer(
            self.inner.flush_interval,
            Some(self.inner.flush_interval),
            move |_| inner.write_out_logged(),
        );
        *self.inner.lock_binding() = Some(LoopBinding { wake, timer });
    }
}

impl Drop for JsonTraceWriter {
    fn drop(&mut self) {
        self.inner.closed.store(true, atomic::Ordering::Release);
        let mut state = self.inner.lock_state();
        if let Err(error) = self.inner.finish_file(&mut state) {
            tracing::warn!(target: LOG_TARGET, %error, "failed to finish trace file");
        }
        drop(state);
        // Lets the loop release the timer and async handle it holds for us.
        self.wake_loop();
    }
}

fn buffer_event(state: &mut State, trace_event: &TraceObject) -> error::Result<()> {
    let mark = state.buffer.len();
    if state.events_in_file > 0 {
        state.buffer.put_slice(b",\n");
    }
    if let Err(error) = serde_json::to_writer((&mut state.buffer).writer(), trace_event) {
        state.buffer.truncate(mark);
        return Err(error.into());
    }
    state.events_in_file += 1;
    Ok(())
}

impl Inner {
    fn lock_state(&self) -> sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(sync::PoisonError::into_inner)
    }

    fn lock_binding(&self) -> sync::MutexGuard<'_, Option<LoopBinding>> {
        self.binding
            .lock()
            .unwrap_or_else(sync::PoisonError::into_inner)
    }

    fn on_wake(&self, event_loop: &mut TraceLoop) {
        if !self.closed.load(atomic::Ordering::Acquire) {
            self.write_out_logged();
            return;
        }
        if let Some(binding) = self.lock_binding().take() {
            event_loop.stop_timer(binding.timer);
            event_loop.close_async(&binding.wake);
        }
    }

    fn write_out_logged(&self) {
        if self.closed.load(atomic::Ordering::Acquire) {
            return;
        }
        let result = self
            .state
            .lock()
            .map_err(|_| error::Error::PoisonedMutex)
            .and_then(|mut state| self.write_out(&mut state, false));
        if let Err(error) = result {
            tracing::warn!(target: LOG_TARGET, %error, "failed to write trace file");
        }
    }

    fn path_for(&self, rotation: u32) -> path::PathBuf {
        self.file_pattern
            .replace("${pid}", &process::id().to_string())
            .replace("${rotation}", &rotation.to_string())
            .into()
    }

    fn write_out(&self, state: &mut State, sync_file: bool) -> error::Result<()> {
        if !state.buffer.is_empty() {
            if state.file.is_none() {
                let path = self.path_for(state.rotation);
                let mut file = io::BufWriter::new(fs::File::create(&path)?);
                file.write_all(FILE_HEADER)?;
                state.file = Some(file);
                state.files.push(path);
            }
            let data = state.buffer.split();
            if let Some(file) = state.file.as_mut() {
                file.write_all(&data)?;
            }
        }
        if let Some(file) = state.file.as_mut() {
            file.flush()?;
            if sync_file {
                file.get_ref().sync_data()?;
            }
        }
        Ok(())
    }

    fn finish_file(&self, state: &mut State) -> error::Result<()> {
        self.write_out(state, false)?;
        if let Some(mut file) = state.file.take() {
            file.write_all(FILE_FOOTER)?;
            file.flush()?;
        }
        Ok(())
    }

    fn rotate(&self, state: &mut State) -> error::Result<()> {
        let result = self.finish_file(state);
        state.events_in_file = 0;
        state.rotation += 1;
        result
    }
}

impl Builder {
    fn new(file_pattern: String) -> Self {
        Self {
            file_pattern,
            events_per_file: 1 << 19,
            flush_threshold: 64 * 1024,
            flush_interval: time::Duration::from_secs(1),
        }
    }

    pub fn with_events_per_file(mut self, events_per_file: usize) -> Self {
        self.events_per_file = events_per_file.max(1);
        self
    }

    /// Buffered bytes after which the loop is asked to write out.
    pub fn with_flush_threshold(mut self, flush_threshold: usize) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: time::Duration) -> Self {
        self.flush_interval = flush_interval.max(time::Duration::from_millis(1));
        self
    }

    pub fn build(self) -> JsonTraceWriter {
        let inner = Inner {
            file_pattern: self.file_pattern,
            events_per_file: self.events_per_file,
            flush_threshold: self.flush_threshold,
            flush_interval: self.flush_interval,
            state: sync::Mutex::new(State {
                buffer: bytes::BytesMut::new(),
                file: None,
                events_in_file: 0,
                rotation: 1,
                files: Vec::new(),
            }),
            binding: sync::Mutex::new(None),
            closed: atomic::AtomicBool::new(false),
        };
        JsonTraceWriter {
            inner: sync::Arc::new(inner),
        }
    }
}
