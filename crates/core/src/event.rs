//! The trace event record handed from producers to writers.
use std::process;

use serde::ser::SerializeMap as _;

/// Event phase, serialized with the single-letter codes of the Chrome trace
/// event format.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize)]
pub enum Phase {
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "E")]
    End,
    #[serde(rename = "X")]
    Complete,
    #[serde(rename = "i")]
    Instant,
    #[serde(rename = "C")]
    Counter,
    #[serde(rename = "b")]
    AsyncBegin,
    #[serde(rename = "e")]
    AsyncEnd,
    #[serde(rename = "M")]
    Metadata,
}

/// A single argument value attached to an event.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Str(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
}

/// Ordered key/value arguments; serialized as a JSON object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceArgs(Vec<(String, ArgValue)>);

/// A structured record describing something that happened during execution.
///
/// The category group is a comma separated list of categories, e.g.
/// `"v8,devtools.timeline"`.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TraceObject {
    pub name: String,
    #[serde(rename = "cat")]
    pub category_group: String,
    #[serde(rename = "ph")]
    pub phase: Phase,
    #[serde(rename = "ts")]
    pub timestamp_us: i64,
    #[serde(rename = "dur", skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<i64>,
    pub pid: u32,
    pub tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "TraceArgs::is_empty")]
    pub args: TraceArgs,
}

impl TraceObject {
    pub fn new(phase: Phase, category_group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category_group: category_group.into(),
            phase,
            timestamp_us: 0,
            duration_us: None,
            pid: process::id(),
            tid: 0,
            id: None,
            args: TraceArgs::default(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: i64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    pub fn with_duration(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn with_tid(mut self, tid: u64) -> Self {
        self.tid = tid;
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: ArgValue) -> Self {
        self.args.push(key, value);
        self
    }

    pub fn with_args(mut self, args: TraceArgs) -> Self {
        self.args = args;
        self
    }

    /// Iterate the individual categories of the category group.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.category_group
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

impl TraceArgs {
    pub fn push(&mut self, key: impl Into<String>, value: ArgValue) {
        self.0.push((key.into(), value));
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl serde::Serialize for TraceArgs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_group_splits_on_commas() {
        let event = TraceObject::new(Phase::Instant, "v8, node.perf,,gc", "tick");
        let categories: Vec<_> = event.categories().collect();
        assert_eq!(categories, ["v8", "node.perf", "gc"]);
    }

    #[test]
    fn args_keep_insertion_order() {
        let event = TraceObject::new(Phase::Begin, "net", "request")
            .with_arg("url", ArgValue::Str("/".to_owned()))
            .with_arg("retry", ArgValue::Bool(false));
        let keys: Vec<_> = event.args.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["url", "retry"]);
        assert_eq!(event.args.get("retry"), Some(&ArgValue::Bool(false)));
        assert_eq!(event.args.get("missing"), None);
    }

    #[test]
    fn phases_use_chrome_letter_codes() {
        let codes: Vec<String> = [Phase::Begin, Phase::End, Phase::Instant, Phase::Metadata]
            .iter()
            .map(|phase| serde_yaml::to_string(phase).unwrap().trim().to_owned())
            .collect();
        assert_eq!(codes, ["B", "E", "i", "M"]);
    }
}
