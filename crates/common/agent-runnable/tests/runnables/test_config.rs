//! Tests for config resolution, merging and bindings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_runnable::callbacks::{
    CallbackHandler, CallbackManager, Callbacks, DynCallbackHandler, RunStart,
};
use agent_runnable::chunk::Chunk;
use agent_runnable::error::{Error, Result};
use agent_runnable::runnables::{
    BatchOptions, ConfigOrList, DEFAULT_RECURSION_LIMIT, Runnable, RunnableConfig, RunnableExt,
    RunnableLambda, ensure_config, get_config_list, merge_configs, patch_config,
};
use agent_runnable::tracers::RunCollector;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

fn metadata(entries: &[(&str, Value)]) -> HashMap<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Echoes the `configurable` map it was called with.
fn echo_configurable() -> RunnableLambda {
    RunnableLambda::with_config_fn(|_input, config: RunnableConfig| async move {
        let configurable: serde_json::Map<String, Value> = config.configurable.into_iter().collect();
        Ok(Chunk::from_json(Value::Object(configurable)))
    })
}

/// Appends its name to a shared log on every run start.
#[derive(Debug)]
struct Named {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl CallbackHandler for Named {
    fn name(&self) -> &str {
        self.name
    }

    fn on_run_start(&self, _run: &RunStart) -> Result<()> {
        self.log.lock().push(self.name);
        Ok(())
    }
}

fn named(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> DynCallbackHandler {
    Arc::new(Named {
        name,
        log: log.clone(),
    })
}

/// Calls itself through its config until the input counts down to zero.
fn countdown() -> RunnableLambda {
    RunnableLambda::with_config_fn(|input: Chunk, config: RunnableConfig| async move {
        let remaining = input
            .as_i64()
            .ok_or_else(|| Error::other("expected an integer"))?;
        if remaining == 0 {
            return Ok(Chunk::from("done"));
        }
        let inner = countdown();
        inner.invoke(Chunk::Int(remaining - 1), Some(config)).await
    })
    .with_name("countdown")
}

// ===========================================================================
// ensure_config / merge_configs / get_config_list
// ===========================================================================

#[test]
fn test_ensure_config_defaults() {
    let config = ensure_config(None);
    assert!(config.tags.is_empty());
    assert_eq!(config.recursion_limit, DEFAULT_RECURSION_LIMIT);
    assert!(config.signal.is_none());
}

#[test]
fn test_ensure_config_copies_primitive_configurable_into_metadata() {
    let configurable = metadata(&[
        ("user", json!("ada")),
        ("temperature", json!(0.5)),
        ("__secret", json!("hidden")),
        ("nested", json!({ "a": 1 })),
    ]);
    let config = ensure_config(Some(RunnableConfig::default().with_configurable(configurable)));
    assert_eq!(config.metadata.get("user"), Some(&json!("ada")));
    assert_eq!(config.metadata.get("temperature"), Some(&json!(0.5)));
    assert!(!config.metadata.contains_key("__secret"));
    assert!(!config.metadata.contains_key("nested"));
}

#[test]
fn test_ensure_config_turns_timeout_into_signal() {
    let config = ensure_config(Some(
        RunnableConfig::default().with_timeout(Duration::from_secs(30)),
    ));
    assert!(config.timeout.is_none());
    let signal = config.signal.expect("timeout becomes a signal");
    assert!(!signal.is_aborted());
}

#[test]
fn test_merge_configs_is_deterministic_and_associative() {
    let a = RunnableConfig::default()
        .with_tags(["a", "shared"])
        .with_metadata(metadata(&[("k", json!(1)), ("only_a", json!(true))]))
        .with_max_concurrency(4);
    let b = RunnableConfig::default()
        .with_tags(["shared", "b"])
        .with_metadata(metadata(&[("k", json!(2))]))
        .with_run_name("b");
    let c = RunnableConfig::default()
        .with_tags(["c"])
        .with_timeout(Duration::from_secs(5))
        .with_recursion_limit(10);

    let flat = merge_configs([Some(&a), Some(&b), Some(&c)]);
    let ab = merge_configs([Some(&a), Some(&b)]);
    let left = merge_configs([Some(&ab), Some(&c)]);
    let bc = merge_configs([Some(&b), Some(&c)]);
    let right = merge_configs([Some(&a), Some(&bc)]);

    for merged in [&flat, &left, &right] {
        assert_eq!(merged.tags, vec!["a", "shared", "b", "c"]);
        assert_eq!(merged.metadata.get("k"), Some(&json!(2)));
        assert_eq!(merged.metadata.get("only_a"), Some(&json!(true)));
        assert_eq!(merged.max_concurrency, Some(4));
        assert_eq!(merged.run_name.as_deref(), Some("b"));
        assert_eq!(merged.timeout, Some(Duration::from_secs(5)));
        assert_eq!(merged.recursion_limit, 10);
    }
}

#[test]
fn test_merge_configs_smaller_timeout_wins() {
    let a = RunnableConfig::default().with_timeout(Duration::from_secs(3));
    let b = RunnableConfig::default().with_timeout(Duration::from_secs(9));
    let merged = merge_configs([Some(&a), None, Some(&b)]);
    assert_eq!(merged.timeout, Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn test_merge_configs_keeps_callback_order_across_lists_and_managers() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let list_first = RunnableConfig::default().with_handler(named("h1", &log));
    let manager_second = RunnableConfig::default()
        .with_callbacks(CallbackManager::new(vec![named("h2", &log)]));

    let merged = merge_configs([Some(&list_first), Some(&manager_second)]);
    let Some(Callbacks::Manager(manager)) = &merged.callbacks else {
        panic!("expected a manager, got {:?}", merged.callbacks);
    };
    let names: Vec<&str> = manager.handlers.iter().map(|handler| handler.name()).collect();
    assert_eq!(names, vec!["h1", "h2"]);
    let inherited: Vec<&str> = manager
        .inheritable_handlers
        .iter()
        .map(|handler| handler.name())
        .collect();
    assert_eq!(inherited, vec!["h1", "h2"]);

    RunnableLambda::from_fn(Ok)
        .invoke(Chunk::Int(1), Some(merged))
        .await
        .unwrap();
    assert_eq!(*log.lock(), vec!["h1", "h2"]);

    log.lock().clear();
    let manager_first = RunnableConfig::default()
        .with_callbacks(CallbackManager::new(vec![named("m1", &log)]));
    let list_second = RunnableConfig::default().with_handler(named("l2", &log));
    let merged = merge_configs([Some(&manager_first), Some(&list_second)]);
    RunnableLambda::from_fn(Ok)
        .invoke(Chunk::Int(1), Some(merged))
        .await
        .unwrap();
    assert_eq!(*log.lock(), vec!["m1", "l2"]);
}

#[test]
fn test_get_config_list_keeps_run_id_for_first_only() {
    let run_id = Uuid::new_v4();
    let config = RunnableConfig::default().with_run_id(run_id).with_tags(["t"]);
    let configs = get_config_list(Some(ConfigOrList::Single(Box::new(config))), 3).unwrap();
    assert_eq!(configs.len(), 3);
    assert_eq!(configs[0].run_id, Some(run_id));
    assert!(configs[1..].iter().all(|config| config.run_id.is_none()));
    assert!(configs.iter().all(|config| config.tags == vec!["t".to_string()]));
}

#[test]
fn test_patch_config_clears_parent_run_identity() {
    let config = RunnableConfig::default()
        .with_run_name("parent")
        .with_run_id(Uuid::new_v4());
    let patched = patch_config()
        .config(config)
        .callbacks(Default::default())
        .max_concurrency(2)
        .call();
    assert!(patched.run_name.is_none());
    assert!(patched.run_id.is_none());
    assert_eq!(patched.max_concurrency, Some(2));
}

// ===========================================================================
// Run identity from config
// ===========================================================================

#[tokio::test]
async fn test_run_name_and_id_from_config() {
    let run_id = Uuid::new_v4();
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::default()
        .with_run_id(run_id)
        .with_run_name("renamed")
        .with_handler(collector.clone());
    RunnableLambda::from_fn(Ok)
        .invoke(Chunk::Int(1), Some(config))
        .await
        .unwrap();
    let run = collector.latest_run().unwrap();
    assert_eq!(run.id, run_id);
    assert_eq!(run.name, "renamed");
}

#[tokio::test]
async fn test_batch_with_per_input_configs() {
    let collector = Arc::new(RunCollector::new());
    let configs = ["first", "second"]
        .into_iter()
        .map(|name| {
            RunnableConfig::default()
                .with_run_name(name)
                .with_handler(collector.clone())
        })
        .collect();
    RunnableLambda::from_fn(Ok)
        .batch(
            vec![Chunk::Int(1), Chunk::Int(2)],
            Some(ConfigOrList::List(configs)),
            BatchOptions::default(),
        )
        .await
        .unwrap();
    let mut names: Vec<String> = collector.traced_runs().into_iter().map(|run| run.name).collect();
    names.sort();
    assert_eq!(names, vec!["first", "second"]);
}

// ===========================================================================
// Bindings
// ===========================================================================

#[tokio::test]
async fn test_bind_delivers_values_through_configurable() {
    let bound = echo_configurable().bind(metadata(&[("stop", json!("\n"))]));
    let output = bound.invoke(Chunk::Null, None).await.unwrap();
    assert_eq!(output.get("stop"), Some(&Chunk::from("\n")));
}

#[tokio::test]
async fn test_call_time_config_wins_over_bound_config() {
    let bound = echo_configurable().with_config(
        RunnableConfig::default().with_configurable(metadata(&[("model", json!("small"))])),
    );
    let call = RunnableConfig::default().with_configurable(metadata(&[("model", json!("large"))]));
    let output = bound.invoke(Chunk::Null, Some(call)).await.unwrap();
    assert_eq!(output.get("model"), Some(&Chunk::from("large")));
}

#[tokio::test]
async fn test_rebinding_collapses_onto_one_binding() {
    let once = echo_configurable().bind(metadata(&[("a", json!(1))]));
    let twice = once
        .with_config(RunnableConfig::default().with_tags(["bound"]))
        .bind(metadata(&[("b", json!(2))]));
    assert!(twice.bound().as_binding().is_none());
    assert_eq!(twice.config().tags, vec!["bound".to_string()]);
    assert_eq!(twice.kwargs().len(), 2);

    let output = twice.invoke(Chunk::Null, None).await.unwrap();
    assert_eq!(output.get("a"), Some(&Chunk::Int(1)));
    assert_eq!(output.get("b"), Some(&Chunk::Int(2)));
}

#[tokio::test]
async fn test_binding_tags_reach_the_run() {
    let collector = Arc::new(RunCollector::new());
    let bound = RunnableLambda::from_fn(Ok)
        .with_name("inner")
        .with_config(RunnableConfig::default().with_tags(["bound"]));
    assert_eq!(bound.name(), "inner");
    let call = RunnableConfig::default()
        .with_tags(["call"])
        .with_handler(collector.clone());
    bound.invoke(Chunk::Null, Some(call)).await.unwrap();
    let run = collector.latest_run().unwrap();
    assert_eq!(run.tags, vec!["bound".to_string(), "call".to_string()]);
}

// ===========================================================================
// Recursion limit
// ===========================================================================

#[tokio::test]
async fn test_recursion_within_limit_completes() {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::default()
        .with_recursion_limit(5)
        .with_handler(collector.clone());
    let output = countdown().invoke(Chunk::Int(4), Some(config)).await.unwrap();
    assert_eq!(output, Chunk::from("done"));

    let mut depth = 1;
    let mut run = collector.latest_run().unwrap();
    while let Some(child) = run.child_runs.first().cloned() {
        depth += 1;
        run = child;
    }
    assert_eq!(depth, 5);
}

#[tokio::test]
async fn test_unbounded_recursion_hits_the_limit() {
    let err = countdown()
        .invoke(Chunk::Int(1_000), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecursionLimit(ref name) if name == "countdown"));

    let config = RunnableConfig::default().with_recursion_limit(3);
    let err = countdown()
        .invoke(Chunk::Int(3), Some(config))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecursionLimit(_)));
}

#[tokio::test]
async fn test_zero_recursion_limit_fails_before_the_run_starts() {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::default()
        .with_recursion_limit(0)
        .with_handler(collector.clone());
    let err = RunnableLambda::from_fn(Ok)
        .invoke(Chunk::Int(1), Some(config.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecursionLimit(_)));
    assert!(collector.latest_run().is_none());

    let chunks: Vec<_> = RunnableLambda::from_fn(Ok)
        .stream(Chunk::Int(1), Some(config))
        .collect()
        .await;
    assert_eq!(chunks.len(), 1);
    assert!(matches!(chunks[0], Err(Error::RecursionLimit(_))));
}
