mod common;

use common::CollectingWriter;
use trace_agent_core::{Agent, ArgValue, Phase, UseDefaultCategoryMode};
use trace_agent_layer::AgentLayer;
use tracing_subscriber::layer::SubscriberExt as _;

const NO_CATEGORIES: [&str; 0] = [];

fn subscriber(agent: &Agent) -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::registry().with(AgentLayer::new(agent.clone()))
}

#[test]
fn disabled_targets_produce_nothing() -> anyhow::Result<()> {
    let agent = Agent::new();
    let writer = CollectingWriter::default();
    let _handle = agent.add_client(
        NO_CATEGORIES,
        writer.clone(),
        UseDefaultCategoryMode::IgnoreDefaultCategories,
    )?;

    tracing::subscriber::with_default(subscriber(&agent), || {
        tracing::info!(target: "net", "not traced");
        let _span = tracing::info_span!(target: "net", "request").entered();
    });

    assert!(writer.events().is_empty());
    Ok(())
}

#[test]
fn spans_and_events_become_trace_events() -> anyhow::Result<()> {
    let agent = Agent::new();
    let writer = CollectingWriter::default();
    let handle = agent.add_client(
        NO_CATEGORIES,
        writer.clone(),
        UseDefaultCategoryMode::IgnoreDefaultCategories,
    )?;
    handle.enable(["net"]);

    tracing::subscriber::with_default(subscriber(&agent), || {
        let span = tracing::info_span!(target: "net", "request", url = "/index", status = tracing::field::Empty);
        {
            let _entered = span.enter();
            tracing::info!(target: "net", bytes = 42_u64, "received");
            tracing::info!(target: "gc", "ignored");
        }
        span.record("status", 200_i64);
        drop(span);
    });

    let events = writer.events();
    let phases: Vec<Phase> = events.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        [Phase::Metadata, Phase::Metadata, Phase::Begin, Phase::Instant, Phase::End]
    );
    assert_eq!(events[0].name, "process_name");
    let exe = std::env::current_exe()?;
    let exe_name = exe.file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(events[0].args.get("name"), Some(&ArgValue::Str(exe_name)));
    assert_eq!(events[1].name, "thread_name");

    let begin = &events[2];
    assert_eq!(begin.name, "request");
    assert_eq!(begin.category_group, "net");
    assert_eq!(begin.args.get("url"), Some(&ArgValue::Str("/index".to_owned())));

    let instant = &events[3];
    assert_eq!(instant.name, "received");
    assert_eq!(instant.args.get("bytes"), Some(&ArgValue::UInt(42)));
    assert!(instant.timestamp_us >= begin.timestamp_us);

    let end = &events[4];
    assert_eq!(end.name, "request");
    assert_eq!(end.args.get("status"), Some(&ArgValue::Int(200)));
    assert!(events.iter().all(|e| e.tid == events[0].tid));
    Ok(())
}

#[test]
fn span_opened_while_enabled_is_closed_after_disable() -> anyhow::Result<()> {
    let agent = Agent::new();
    let writer = CollectingWriter::default();
    let handle = agent.add_client(
        NO_CATEGORIES,
        writer.clone(),
        UseDefaultCategoryMode::IgnoreDefaultCategories,
    )?;
    handle.enable(["db"]);

    tracing::subscriber::with_default(subscriber(&agent), || {
        let span = tracing::info_span!(target: "db", "query");
        handle.disable(["db"]);
        tracing::info!(target: "db", "dropped");
        drop(span);
    });

    let phases: Vec<Phase> = writer
        .events()
        .iter()
        .filter(|e| e.phase != Phase::Metadata)
        .map(|e| e.phase)
        .collect();
    assert_eq!(phases, [Phase::Begin, Phase::End]);
    Ok(())
}

#[test]
fn thread_metadata_is_sent_once_per_thread() -> anyhow::Result<()> {
    let agent = Agent::new();
    let writer = CollectingWriter::default();
    let handle = agent.add_client(
        NO_CATEGORIES,
        writer.clone(),
        UseDefaultCategoryMode::IgnoreDefaultCategories,
    )?;
    handle.enable(["work"]);

    let layer = AgentLayer::new(agent.clone());
    let subscriber = std::sync::Arc::new(tracing_subscriber::registry().with(layer));
    let threads: Vec<_> = (0..3)
        .map(|i| {
            let subscriber = std::sync::Arc::clone(&subscriber);
            std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    tracing::subscriber::with_default(subscriber, || {
                        tracing::info!(target: "work", "first");
                        tracing::info!(target: "work", "second");
                    })
                })
        })
        .collect::<Result<_, _>>()?;
    for thread in threads {
        thread.join().unwrap();
    }

    let events = writer.events();
    let process_names = events.iter().filter(|e| e.name == "process_name").count();
    let mut thread_names: Vec<String> = events
        .iter()
        .filter(|e| e.name == "thread_name")
        .filter_map(|e| match e.args.get("name") {
            Some(ArgValue::Str(name)) => Some(name.clone()),
            _ => None,
        })
        .collect();
    thread_names.sort();
    assert_eq!(process_names, 1);
    assert_eq!(thread_names, ["worker-0", "worker-1", "worker-2"]);
    assert_eq!(events.iter().filter(|e| e.phase == Phase::Instant).count(), 6);
    Ok(())
}

#[test]
fn from_config_enables_included_categories() -> anyhow::Result<()> {
    let config = trace_agent_core::TraceConfig::from_yaml_str(
        "included_categories: [net, gc]\nexcluded_categories: [gc]\n",
    )?;
    let writer = CollectingWriter::default();
    let (layer, handle) = AgentLayer::from_config(&config, writer.clone())?;
    assert_eq!(layer.agent().get_enabled_categories(), "net");

    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(target: "net", "kept");
        tracing::info!(target: "gc", "skipped");
    });

    let names: Vec<String> = writer
        .events()
        .into_iter()
        .filter(|e| e.phase == Phase::Instant)
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["kept"]);

    drop(handle);
    assert!(writer.events().iter().all(|e| e.name != "skipped"));
    Ok(())
}
