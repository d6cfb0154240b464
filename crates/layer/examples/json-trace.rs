use std::{fs, thread, time};

use trace_agent_core::TraceConfig;
use trace_agent_layer::{AgentLayer, JsonTraceWriter};

// In a real app, one would read this from a config file or similar.
const CONFIG: &str = r#"
record_mode: record-continuously
included_categories: [json_trace, demo, noisy]
excluded_categories: [noisy]
"#;

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt as _;

    let config = TraceConfig::from_yaml_str(CONFIG)?;
    let out_file = "json-trace-example.json";
    let (layer, handle) =
        AgentLayer::from_config(&config, JsonTraceWriter::builder(out_file).build())?;
    eprintln!(
        "enabled categories: {}",
        layer.agent().get_enabled_categories()
    );

    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(foo = "baz", int = 7, "hello trace!");
        tracing::info!(target: "noisy", "not recorded");

        let span = tracing::info_span!(target: "demo", "hi", foo = "bar", int = 3);
        let guard = span.enter();
        thread::sleep(time::Duration::from_millis(100));
        drop(guard);
    });
    drop(handle);

    let trace: serde_json::Value = serde_json::from_slice(&fs::read(out_file)?)?;
    eprintln!("{}", serde_json::to_string_pretty(&trace)?);

    Ok(())
}
