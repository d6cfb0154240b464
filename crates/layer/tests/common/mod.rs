use std::sync;

use trace_agent_core::{AsyncTraceWriter, TraceObject};

/// Collects every appended event; clones share the same storage.
#[derive(Clone, Default)]
pub struct CollectingWriter(sync::Arc<sync::Mutex<Vec<TraceObject>>>);

impl CollectingWriter {
    pub fn events(&self) -> Vec<TraceObject> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncTraceWriter for CollectingWriter {
    fn append_trace_event(&self, trace_event: &TraceObject) {
        self.0.lock().unwrap().push(trace_event.clone());
    }

    fn flush(&self, _blocking: bool) {}
}

pub fn read_trace(path: &std::path::Path) -> anyhow::Result<Vec<serde_json::Value>> {
    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(path)?)?;
    let events = json["traceEvents"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("no traceEvents array in {}", path.display()))?;
    Ok(events.clone())
}
