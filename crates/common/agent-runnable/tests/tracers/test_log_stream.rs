//! Tests for run logs streamed as JSON Patch.

use agent_runnable::chunk::Chunk;
use agent_runnable::error::{Error, Result};
use agent_runnable::runnables::{
    RootEventFilter, Runnable, RunnableConfig, RunnableExt, RunnableLambda, call_with_config,
};
use agent_runnable::tracers::{
    LogStreamOptions, PatchOp, RunLog, RunLogPatch, RunType, SchemaFormat, accumulate_run_log,
    stream_log,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FakeLlm;

#[async_trait]
impl Runnable for FakeLlm {
    fn name(&self) -> String {
        "FakeLlm".to_string()
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        call_with_config(self, input, config, RunType::Llm, |_, _, run_manager| async move {
            run_manager.on_new_token("Hel", None)?;
            run_manager.on_new_token("lo", None)?;
            Ok(Chunk::from("Hello"))
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

async fn final_log<R: Runnable + ?Sized>(
    runnable: &R,
    input: Chunk,
    options: LogStreamOptions,
) -> RunLog {
    let logs: Vec<RunLog> = accumulate_run_log(stream_log(runnable, input, None, options))
        .map(|log| log.unwrap())
        .collect()
        .await;
    logs.into_iter().last().unwrap()
}

fn log_keys(log: &RunLog) -> Vec<String> {
    let mut keys: Vec<String> = log.state["logs"]
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect();
    keys.sort();
    keys
}

// ===========================================================================
// stream_log
// ===========================================================================

#[tokio::test]
async fn test_first_patch_replaces_root() {
    let patches: Vec<RunLogPatch> = stream_log(&add(1), Chunk::Int(1), None, LogStreamOptions::default())
        .map(|patch| patch.unwrap())
        .collect()
        .await;
    let first = &patches[0];
    assert_eq!(first.ops.len(), 1);
    match &first.ops[0] {
        PatchOp::Replace { path, value } => {
            assert_eq!(path, "");
            assert_eq!(value["name"], json!("add_1"));
            assert_eq!(value["type"], json!("chain"));
            assert_eq!(value["streamed_output"], json!([]));
            assert_eq!(value["logs"], json!({}));
        }
        other => panic!("expected a root replace, got {other:?}"),
    }
}

#[tokio::test]
async fn test_root_has_no_log_entry() {
    let log = final_log(&add(1), Chunk::Int(1), LogStreamOptions::default()).await;
    assert_eq!(log.state["logs"], json!({}));
    assert_eq!(log.state["streamed_output"], json!([2]));
    assert_eq!(log.state["final_output"], json!(2));
}

#[tokio::test]
async fn test_repeated_names_get_numbered_keys() {
    let chain = add(1).pipe(add(1));
    let log = final_log(&chain, Chunk::Int(1), LogStreamOptions::default()).await;
    assert_eq!(log_keys(&log), vec!["add_1".to_string(), "add_1:2".to_string()]);
    assert_eq!(log.state["final_output"], json!(3));

    for key in ["add_1", "add_1:2"] {
        let entry = log.log(key).unwrap();
        assert_eq!(entry["type"], json!("chain"));
        assert!(entry["end_time"].is_string());
        assert!(entry.get("inputs").is_none());
        assert!(entry["final_output"]["output"].is_i64());
    }
}

#[tokio::test]
async fn test_llm_tokens_recorded_as_strings() {
    let chain = add(0).pipe(FakeLlm);
    let log = final_log(&chain, Chunk::Int(1), LogStreamOptions::default()).await;
    let entry = log.log("FakeLlm").unwrap();
    assert_eq!(entry["streamed_output_str"], json!(["Hel", "lo"]));
    assert_eq!(entry["streamed_output"], json!(["Hel", "lo"]));
    assert_eq!(entry["final_output"], json!({ "output": "Hello" }));
    assert_eq!(log.state["final_output"], json!("Hello"));
}

#[tokio::test]
async fn test_streaming_events_schema_unwraps_values() {
    let chain = add(1).pipe(add(2));
    let options = LogStreamOptions::builder()
        .schema_format(SchemaFormat::StreamingEvents)
        .build();
    let log = final_log(&chain, Chunk::Int(1), options).await;
    let entry = log.log("add_2").unwrap();
    assert_eq!(entry["inputs"], json!(2));
    assert_eq!(entry["final_output"], json!(4));
}

#[tokio::test]
async fn test_filter_limits_log_entries() {
    let chain = add(1).pipe(add(2));
    let options = LogStreamOptions::builder()
        .filter(
            RootEventFilter::builder()
                .include_names(vec!["add_2".to_string()])
                .build(),
        )
        .build();
    let log = final_log(&chain, Chunk::Int(1), options).await;
    assert_eq!(log_keys(&log), vec!["add_2".to_string()]);
}

#[tokio::test]
async fn test_without_streamed_output_list() {
    let options = LogStreamOptions::builder()
        .with_streamed_output_list(false)
        .build();
    let log = final_log(&add(1), Chunk::Int(1), options).await;
    assert_eq!(log.state["streamed_output"], json!([]));
    assert_eq!(log.state["final_output"], json!(2));
}

#[tokio::test]
async fn test_runnable_error_ends_patch_stream() {
    let failing = RunnableLambda::from_fn(|_| Err(Error::other("log broke")));
    let items: Vec<Result<RunLogPatch>> =
        stream_log(&failing, Chunk::Null, None, LogStreamOptions::default())
            .collect()
            .await;
    assert!(items[0].is_ok());
    assert_eq!(items.last().unwrap().as_ref().unwrap_err().to_string(), "log broke");
}

#[tokio::test]
async fn test_runnable_trait_stream_log() {
    let patches: Vec<RunLogPatch> = add(1)
        .stream_log(Chunk::Int(1), None, LogStreamOptions::default())
        .map(|patch| patch.unwrap())
        .collect()
        .await;
    let log = patches
        .iter()
        .try_fold(RunLog::default(), |log, patch| log.concat(patch))
        .unwrap();
    assert_eq!(log.state["final_output"], json!(2));
}

// ===========================================================================
// RunLog and RunLogPatch
// ===========================================================================

fn sample_patches() -> Vec<RunLogPatch> {
    vec![
        RunLogPatch::new(vec![PatchOp::replace(
            "",
            json!({ "streamed_output": [], "final_output": null, "logs": {} }),
        )]),
        RunLogPatch::new(vec![PatchOp::add("/streamed_output/-", json!("a"))]),
        RunLogPatch::new(vec![
            PatchOp::add("/logs/step", json!({ "final_output": null })),
            PatchOp::replace("/final_output", json!("a")),
        ]),
        RunLogPatch::new(vec![PatchOp::add("/logs/step/final_output", json!(1))]),
    ]
}

#[test]
fn test_run_log_concat_is_associative() {
    let [a, b, c, d]: [RunLogPatch; 4] = sample_patches().try_into().unwrap();

    let left = a.concat(&b).unwrap().concat(&c).unwrap().concat(&d).unwrap();
    let cd = RunLogPatch::new(c.ops.iter().chain(&d.ops).cloned().collect());
    let right = RunLogPatch::from(a.concat(&b).unwrap())
        .concat(&cd)
        .unwrap();
    assert_eq!(left, right);
    assert_eq!(left.state["final_output"], json!("a"));
    assert_eq!(left.state["logs"]["step"]["final_output"], json!(1));
}

#[test]
fn test_patch_ops_match_json_patch_documents() {
    let ops = sample_patches()
        .into_iter()
        .flat_map(|patch| patch.ops)
        .collect::<Vec<_>>();
    let document: Value = serde_json::to_value(&ops).unwrap();
    assert_eq!(document[0]["op"], json!("replace"));
    assert_eq!(document[1], json!({ "op": "add", "path": "/streamed_output/-", "value": "a" }));

    let parsed: Vec<PatchOp> = serde_json::from_value(document).unwrap();
    assert_eq!(parsed, ops);
    let log = RunLog::from_ops(parsed).unwrap();
    assert_eq!(log.state["streamed_output"], json!(["a"]));
}

#[test]
fn test_bad_patch_is_an_error() {
    let log = RunLog::default();
    let err = log
        .concat(&RunLogPatch::new(vec![PatchOp::remove("/missing")]))
        .unwrap_err();
    assert!(matches!(err, Error::Patch(_)));
}
