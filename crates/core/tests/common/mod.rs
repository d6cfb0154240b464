use std::{sync, thread, time};

use trace_agent_core::{AsyncTraceWriter, Phase, TraceLoop, TraceObject};

#[derive(Debug, Default)]
pub struct Calls {
    pub appended: Vec<TraceObject>,
    pub flushes: Vec<bool>,
    pub initialized_on: Vec<thread::ThreadId>,
    pub dropped: usize,
}

/// Shared view on what a [`RecordingWriter`] has seen, usable after the
/// writer itself was handed to the agent.
#[derive(Clone, Debug, Default)]
pub struct Recorder(sync::Arc<sync::Mutex<Calls>>);

pub struct RecordingWriter {
    recorder: Recorder,
}

impl Recorder {
    pub fn writer(&self) -> RecordingWriter {
        RecordingWriter {
            recorder: self.clone(),
        }
    }

    pub fn calls(&self) -> sync::MutexGuard<'_, Calls> {
        self.0.lock().unwrap()
    }

    pub fn names(&self) -> Vec<String> {
        self.calls()
            .appended
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }
}

impl AsyncTraceWriter for RecordingWriter {
    fn append_trace_event(&self, trace_event: &TraceObject) {
        self.recorder.calls().appended.push(trace_event.clone());
    }

    fn flush(&self, blocking: bool) {
        self.recorder.calls().flushes.push(blocking);
    }

    fn initialize_on_thread(&self, _event_loop: &mut TraceLoop) {
        self.recorder
            .calls()
            .initialized_on
            .push(thread::current().id());
    }
}

impl Drop for RecordingWriter {
    fn drop(&mut self) {
        self.recorder.calls().dropped += 1;
    }
}

pub fn instant(category_group: &str, name: &str) -> TraceObject {
    TraceObject::new(Phase::Instant, category_group, name)
}

/// Ordered record of `initialize_on_thread` calls across several writers.
#[derive(Clone, Debug, Default)]
pub struct InitLog(sync::Arc<sync::Mutex<Vec<(String, thread::ThreadId)>>>);

/// A writer whose on-loop initialization takes `delay`.
pub struct SlowInitWriter {
    label: &'static str,
    delay: time::Duration,
    log: InitLog,
}

impl InitLog {
    pub fn writer(&self, label: &'static str, delay: time::Duration) -> SlowInitWriter {
        SlowInitWriter {
            label,
            delay,
            log: self.clone(),
        }
    }

    pub fn entries(&self) -> Vec<(String, thread::ThreadId)> {
        self.0.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries().into_iter().map(|(label, _)| label).collect()
    }

    /// Poll until `label` was logged.
    pub fn wait_for(&self, label: &str) -> anyhow::Result<()> {
        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        while !self.labels().iter().any(|l| l == label) {
            if time::Instant::now() > deadline {
                anyhow::bail!("{label:?} was never logged");
            }
            thread::sleep(time::Duration::from_millis(1));
        }
        Ok(())
    }

    fn push(&self, entry: String) {
        self.0.lock().unwrap().push((entry, thread::current().id()));
    }
}

impl AsyncTraceWriter for SlowInitWriter {
    fn append_trace_event(&self, _trace_event: &TraceObject) {}

    fn flush(&self, _blocking: bool) {}

    fn initialize_on_thread(&self, _event_loop: &mut TraceLoop) {
        self.log.push(format!("{} start", self.label));
        thread::sleep(self.delay);
        self.log.push(format!("{} end", self.label));
    }
}
