//! Tests for run tree ordering and ingestion batching.

use std::sync::Arc;

use agent_runnable::chunk::Chunk;
use agent_runnable::error::Error;
use agent_runnable::runnables::{Runnable, RunnableConfig, RunnableExt, RunnableLambda, RunnableMap};
use agent_runnable::tracers::run_collector::DEFAULT_BATCH_SIZE_LIMIT_BYTES;
use agent_runnable::tracers::schemas::dotted_order_segment;
use agent_runnable::tracers::{Run, RunCollector, batch_runs_for_ingest, flatten_runs};
use chrono::Utc;
use uuid::Uuid;

fn add(n: i64) -> RunnableLambda {
    RunnableLambda::from_fn(move |input| {
        input
            .as_i64()
            .map(|value| Chunk::Int(value + n))
            .ok_or_else(|| Error::other("expected an integer"))
    })
    .with_name(format!("add_{n}"))
}

async fn traced<R: Runnable + ?Sized>(runnable: &R, input: Chunk) -> Run {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::default().with_handler(collector.clone());
    runnable.invoke(input, Some(config)).await.unwrap();
    collector.latest_run().unwrap()
}

#[tokio::test]
async fn test_children_extend_parent_dotted_order() {
    let root = traced(&add(1).pipe(add(2)).pipe(add(3)), Chunk::Int(0)).await;
    assert_eq!(root.execution_order, 1);
    assert_eq!(root.trace_id, root.id);
    assert!(!root.dotted_order.contains('.'));
    assert!(root.dotted_order.ends_with(&format!("Z{}", root.id)));

    let orders: Vec<u64> = root.child_runs.iter().map(|run| run.execution_order).collect();
    assert_eq!(orders, vec![2, 3, 4]);

    for child in &root.child_runs {
        assert_eq!(child.trace_id, root.id);
        assert_eq!(child.parent_run_id, Some(root.id));
        assert!(child.dotted_order.starts_with(&format!("{}.", root.dotted_order)));
    }

    let dotted: Vec<&str> = root.child_runs.iter().map(|run| run.dotted_order.as_str()).collect();
    let mut sorted = dotted.clone();
    sorted.sort();
    assert_eq!(dotted, sorted);
}

#[tokio::test]
async fn test_grandchildren_nest_under_their_parent() {
    let map: RunnableMap = [("a", add(1).boxed()), ("b", add(2).boxed())]
        .into_iter()
        .map(|(key, runnable)| (key.to_string(), runnable))
        .collect();
    let root = traced(&add(0).pipe(map), Chunk::Int(1)).await;

    let map_run = root
        .child_runs
        .iter()
        .find(|run| run.name.starts_with("RunnableMap"))
        .unwrap();
    assert_eq!(map_run.child_runs.len(), 2);
    for grandchild in &map_run.child_runs {
        assert_eq!(grandchild.trace_id, root.id);
        assert_eq!(grandchild.parent_run_id, Some(map_run.id));
        assert!(
            grandchild
                .dotted_order
                .starts_with(&format!("{}.", map_run.dotted_order))
        );
        assert_eq!(grandchild.dotted_order.matches('.').count(), 2);
        assert!(grandchild.execution_order > map_run.execution_order);
    }
    assert_ne!(
        map_run.child_runs[0].execution_order,
        map_run.child_runs[1].execution_order
    );
}

#[test]
fn test_dotted_order_segment_clamps_execution_order() {
    let id = Uuid::new_v4();
    let segment = dotted_order_segment(Utc::now(), 12_345, id);
    assert!(segment.ends_with(&format!("999Z{id}")));
    assert_eq!(segment.len(), dotted_order_segment(Utc::now(), 1, id).len());
}

#[tokio::test]
async fn test_flatten_and_persist_runs() {
    let root = traced(&add(1).pipe(add(2)), Chunk::Int(0)).await;
    let flat = flatten_runs(&root);
    let names: Vec<&str> = flat.iter().map(|run| run.name.as_str()).collect();
    assert_eq!(names, vec!["RunnableSequence", "add_1", "add_2"]);

    let persisted = flat[1].to_persisted();
    for key in ["id", "name", "run_type", "inputs", "outputs", "parent_run_id", "trace_id", "dotted_order"] {
        assert!(persisted.get(key).is_some(), "missing {key}");
    }
    assert!(persisted.get("child_runs").is_none());
    assert_eq!(persisted["outputs"], serde_json::json!({ "output": 1 }));
    assert_eq!(flat[2].to_persisted()["outputs"], serde_json::json!({ "output": 3 }));
}

#[tokio::test]
async fn test_ingest_batches_split_on_size() {
    let root = traced(&add(1).pipe(add(2)), Chunk::Int(0)).await;
    let flat = flatten_runs(&root);

    let single = batch_runs_for_ingest(&flat, &flat, DEFAULT_BATCH_SIZE_LIMIT_BYTES).unwrap();
    assert_eq!(single.len(), 1);
    assert_eq!(single[0]["post"].as_array().unwrap().len(), 3);
    assert_eq!(single[0]["patch"].as_array().unwrap().len(), 3);

    let one_size = serde_json::to_vec(&flat[0].to_persisted()).unwrap().len();
    let split = batch_runs_for_ingest(&flat, &[], one_size).unwrap();
    assert!(split.len() >= 2);
    let total: usize = split
        .iter()
        .map(|batch| batch["post"].as_array().unwrap().len())
        .sum();
    assert_eq!(total, 3);
}
