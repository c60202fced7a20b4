//! Tests for version 2 of `stream_events`.

use agent_runnable::callbacks::dispatch_custom_event;
use agent_runnable::chunk::Chunk;
use agent_runnable::error::{Error, Result};
use agent_runnable::runnables::{
    CUSTOM_EVENT_TYPE, RootEventFilter, Runnable, RunnableConfig, RunnableExt, RunnableLambda,
    StreamEvent, call_with_config,
};
use agent_runnable::tracers::{RunType, StreamEventsOptions};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A model that reports each token as it "generates" it.
#[derive(Debug)]
struct FakeLlm {
    tokens: Vec<&'static str>,
}

#[async_trait]
impl Runnable for FakeLlm {
    fn name(&self) -> String {
        "FakeLlm".to_string()
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        call_with_config(self, input, config, RunType::Llm, |_, _, run_manager| async move {
            let mut text = String::new();
            for token in &self.tokens {
                run_manager.on_new_token(token, None)?;
                text.push_str(token);
            }
            Ok(Chunk::from(text))
        })
        .await
    }
}

#[derive(Debug)]
struct BrokenTool;

#[async_trait]
impl Runnable for BrokenTool {
    fn name(&self) -> String {
        "broken_tool".to_string()
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        call_with_config(self, input, config, RunType::Tool, |_, _, _| async move {
            Err(Error::other("tool broke"))
        })
        .await
    }
}

fn add(n: i64) -> RunnableLambda {
    RunnableLambda::from_fn(move |input| {
        input
            .as_i64()
            .map(|value| Chunk::Int(value + n))
            .ok_or_else(|| Error::other("expected an integer"))
    })
    .with_name(format!("add_{n}"))
}

async fn collect_events<R: Runnable + ?Sized>(
    runnable: &R,
    input: Chunk,
    filter: RootEventFilter,
) -> Vec<StreamEvent> {
    let options = StreamEventsOptions::builder().filter(filter).build();
    runnable
        .stream_events(input, None, options)
        .map(|event| event.unwrap())
        .collect()
        .await
}

fn kinds(events: &[StreamEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .map(|event| (event.event().to_string(), event.name().to_string()))
        .collect()
}

fn pair(event: &str, name: &str) -> (String, String) {
    (event.to_string(), name.to_string())
}

// ===========================================================================
// Root events
// ===========================================================================

#[tokio::test]
async fn test_lambda_events() {
    let events = collect_events(&add(1), Chunk::Int(1), RootEventFilter::default()).await;
    assert_eq!(
        kinds(&events),
        vec![
            pair("on_chain_start", "add_1"),
            pair("on_chain_stream", "add_1"),
            pair("on_chain_end", "add_1"),
        ]
    );

    let run_id = events[0].run_id().to_string();
    assert!(events.iter().all(|event| event.run_id() == run_id));
    assert!(events.iter().all(|event| event.parent_ids().is_empty()));

    assert_eq!(events[0].data().unwrap().input, Some(json!(1)));
    assert_eq!(events[1].data().unwrap().chunk, Some(json!(2)));
    let end = events[2].data().unwrap();
    assert_eq!(end.output, Some(json!(2)));
    assert_eq!(end.input, None);
}

#[tokio::test]
async fn test_llm_tokens_become_stream_events() {
    let llm = FakeLlm {
        tokens: vec!["Hel", "lo"],
    };
    let events = collect_events(&llm, Chunk::from("hi"), RootEventFilter::default()).await;
    assert_eq!(
        kinds(&events),
        vec![
            pair("on_llm_start", "FakeLlm"),
            pair("on_llm_stream", "FakeLlm"),
            pair("on_llm_stream", "FakeLlm"),
            pair("on_llm_end", "FakeLlm"),
        ]
    );
    assert_eq!(events[0].data().unwrap().input, Some(json!("hi")));
    assert_eq!(events[1].data().unwrap().chunk, Some(json!("Hel")));
    assert_eq!(events[2].data().unwrap().chunk, Some(json!("lo")));
    assert_eq!(events[3].data().unwrap().output, Some(json!("Hello")));
}

#[tokio::test]
async fn test_tool_error_event_then_stream_error() {
    let items: Vec<Result<StreamEvent>> = BrokenTool
        .stream_events(Chunk::dict([("q", "x")]), None, StreamEventsOptions::default())
        .collect()
        .await;
    assert_eq!(items.len(), 3);

    let start = items[0].as_ref().unwrap();
    assert_eq!(start.event(), "on_tool_start");
    let error = items[1].as_ref().unwrap();
    assert_eq!(error.event(), "on_tool_error");
    assert_eq!(error.data().unwrap().error.as_deref(), Some("tool broke"));
    assert_eq!(items[2].as_ref().unwrap_err().to_string(), "tool broke");
}

#[tokio::test]
async fn test_chain_errors_only_surface_in_stream() {
    let failing = RunnableLambda::from_fn(|_| Err(Error::other("chain broke"))).with_name("failing");
    let items: Vec<Result<StreamEvent>> = failing
        .stream_events(Chunk::Null, None, StreamEventsOptions::default())
        .collect()
        .await;
    let event_names: Vec<&str> = items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .map(StreamEvent::event)
        .collect();
    assert_eq!(event_names, vec!["on_chain_start"]);
    assert_eq!(items.last().unwrap().as_ref().unwrap_err().to_string(), "chain broke");
}

// ===========================================================================
// Nested runs
// ===========================================================================

#[tokio::test]
async fn test_sequence_events_nest_under_root() {
    let chain = add(1).pipe(add(2));
    let events = collect_events(&chain, Chunk::Int(1), RootEventFilter::default()).await;

    let first = events.first().unwrap();
    assert_eq!(first.event(), "on_chain_start");
    assert_eq!(first.name(), "RunnableSequence");
    assert_eq!(first.data().unwrap().input, Some(json!(1)));
    let root_id = first.run_id().to_string();

    let last = events.last().unwrap();
    assert_eq!(last.event(), "on_chain_end");
    assert_eq!(last.run_id(), root_id);
    assert_eq!(last.data().unwrap().output, Some(json!(4)));
    assert_eq!(last.data().unwrap().input, None);

    for event in events.iter().filter(|event| event.run_id() != root_id) {
        assert_eq!(event.parent_ids(), [root_id.clone()]);
    }

    for name in ["add_1", "add_2"] {
        let of_step: Vec<&str> = events
            .iter()
            .filter(|event| event.name() == name)
            .map(StreamEvent::event)
            .collect();
        assert_eq!(of_step, vec!["on_chain_start", "on_chain_stream", "on_chain_end"]);
    }

    let add_2_end = events
        .iter()
        .find(|event| event.name() == "add_2" && event.event() == "on_chain_end")
        .unwrap();
    assert_eq!(add_2_end.data().unwrap().input, Some(json!(2)));
    assert_eq!(add_2_end.data().unwrap().output, Some(json!(4)));
    assert!(add_2_end.tags().contains(&"seq:step:2".to_string()));
}

#[tokio::test]
async fn test_custom_events_carry_ancestry() {
    let reporter = RunnableLambda::with_config_fn(|input, config: RunnableConfig| async move {
        dispatch_custom_event("progress", json!({ "done": 50 }), &config)?;
        Ok(input)
    })
    .with_name("reporter");
    let chain = add(1).pipe(reporter);
    let events = collect_events(&chain, Chunk::Int(1), RootEventFilter::default()).await;

    let root_id = events[0].run_id().to_string();
    let reporter_id = events
        .iter()
        .find(|event| event.name() == "reporter")
        .unwrap()
        .run_id()
        .to_string();
    let custom = events
        .iter()
        .find(|event| event.event() == CUSTOM_EVENT_TYPE)
        .unwrap();
    assert_eq!(custom.name(), "progress");
    assert_eq!(custom.run_id(), reporter_id);
    assert_eq!(custom.parent_ids(), [root_id]);
    match custom {
        StreamEvent::Custom(event) => assert_eq!(event.data, json!({ "done": 50 })),
        StreamEvent::Standard(_) => panic!("expected a custom event"),
    }
}

#[tokio::test]
async fn test_dispatch_outside_run_fails() {
    let err = dispatch_custom_event("orphan", json!(null), &RunnableConfig::default()).unwrap_err();
    assert!(err.to_string().contains("orphan"));
}

// ===========================================================================
// Filtering and encoding
// ===========================================================================

#[tokio::test]
async fn test_include_names_filter() {
    let chain = add(1).pipe(add(2));
    let filter = RootEventFilter::builder()
        .include_names(vec!["add_1".to_string()])
        .build();
    let events = collect_events(&chain, Chunk::Int(1), filter).await;
    assert_eq!(
        kinds(&events),
        vec![
            pair("on_chain_start", "add_1"),
            pair("on_chain_stream", "add_1"),
            pair("on_chain_end", "add_1"),
        ]
    );
}

#[tokio::test]
async fn test_include_tags_and_exclude_types() {
    let chain = add(1).pipe(FakeLlm { tokens: vec!["a"] });

    let by_tag = RootEventFilter::builder()
        .include_tags(vec!["seq:step:2".to_string()])
        .build();
    let events = collect_events(&chain, Chunk::Int(1), by_tag).await;
    assert!(!events.is_empty());
    assert!(events.iter().all(|event| event.name() == "FakeLlm"));

    let no_chains = RootEventFilter::builder()
        .exclude_types(vec!["chain".to_string()])
        .build();
    let events = collect_events(&chain, Chunk::Int(1), no_chains).await;
    assert!(!events.is_empty());
    assert!(events.iter().all(|event| event.event().starts_with("on_llm_")));
}

#[tokio::test]
async fn test_encoded_event_stream() {
    let frames: Vec<String> = add(1)
        .stream_events_encoded(Chunk::Int(1), None, StreamEventsOptions::default())
        .map(|frame| frame.unwrap())
        .collect()
        .await;
    assert_eq!(frames.len(), 4);
    for frame in &frames[..3] {
        assert!(frame.starts_with("event: data\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
    }
    assert_eq!(frames[3], "event: end\n\n");

    let payload = frames[0]
        .strip_prefix("event: data\ndata: ")
        .and_then(|rest| rest.strip_suffix("\n\n"))
        .unwrap();
    let event: StreamEvent = serde_json::from_str(payload).unwrap();
    assert_eq!(event.event(), "on_chain_start");
}
