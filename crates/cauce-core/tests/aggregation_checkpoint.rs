//! Checkpoint de agregación: serialización del buffer, roundtrip contra un
//! executor nuevo, contadores de trigger restaurados y el sobre versionado
//! del CheckpointManager.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use cauce_core::checkpoint::CheckpointManager;
use cauce_core::clock::{Clock, MockClock, SystemClock};
use cauce_core::contracts::{
    AggregationMode, AggregationSettings, CheckpointSettings, NodeKind, TriggerConfig,
};
use cauce_core::executors::AggregationExecutor;
use cauce_core::spans::SpanFactory;
use cauce_core::tokens::TokenManager;
use cauce_core::EngineError;

use common::{begin_run, recorder, register_node};

fn settings_by_count(name: &str, count: usize) -> AggregationSettings {
    AggregationSettings { name: name.to_string(),
                          trigger: TriggerConfig::by_count(count),
                          mode: AggregationMode::Passthrough }
}

#[test]
fn checkpoint_state_contains_rows_tokens_and_batch() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let agg_node = register_node(&recorder, &run.run_id, "checkpoint_test",
                                 NodeKind::Aggregation);
    let spans = SpanFactory::noop();
    let manager = TokenManager::new(&recorder);

    let mut settings = HashMap::new();
    settings.insert(agg_node.node_id.clone(), settings_by_count("test_agg", 10));
    let mut executor = AggregationExecutor::new(&recorder,
                                                &spans,
                                                &run.run_id,
                                                settings,
                                                Arc::new(SystemClock::new()));

    let mut token_ids = Vec::new();
    for i in 0..3 {
        let token = manager.create_initial_token(&run.run_id,
                                                 &agg_node.node_id,
                                                 i,
                                                 json!({"value": i}))
                           .unwrap();
        token_ids.push(token.token_id.clone());
        executor.buffer_row(&agg_node.node_id, token).unwrap();
    }

    let state = executor.get_checkpoint_state();
    let entry = &state[&agg_node.node_id];
    assert_eq!(entry["rows"], json!([{"value": 0}, {"value": 1}, {"value": 2}]));
    assert_eq!(entry["token_ids"],
               serde_json::Value::Array(token_ids.iter().map(|t| json!(t)).collect()));
    assert!(entry["batch_id"].is_string());
    // El estado del contador de timeout viaja en el checkpoint.
    assert!(entry["buffered_for_seconds"].is_number());

    // JSON-roundtrip stable.
    let serialized = serde_json::to_string(&state).unwrap();
    let restored: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(restored, state);
}

#[test]
fn empty_buffers_are_excluded_from_checkpoint() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let agg_node = register_node(&recorder, &run.run_id, "empty_buffer",
                                 NodeKind::Aggregation);
    let spans = SpanFactory::noop();

    let mut settings = HashMap::new();
    settings.insert(agg_node.node_id.clone(), settings_by_count("test_agg", 10));
    let executor = AggregationExecutor::new(&recorder,
                                            &spans,
                                            &run.run_id,
                                            settings,
                                            Arc::new(SystemClock::new()));

    assert_eq!(executor.get_checkpoint_state(), json!({}));
}

#[test]
fn checkpoint_roundtrip_restores_buffer_and_trigger_progress() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let agg_node = register_node(&recorder, &run.run_id, "roundtrip",
                                 NodeKind::Aggregation);
    let spans = SpanFactory::noop();
    let manager = TokenManager::new(&recorder);

    let make_settings = || {
        let mut settings = HashMap::new();
        settings.insert(agg_node.node_id.clone(), settings_by_count("test_agg", 4));
        settings
    };

    // First executor: buffer 3 of 4, then "crash".
    let mut executor1 = AggregationExecutor::new(&recorder,
                                                 &spans,
                                                 &run.run_id,
                                                 make_settings(),
                                                 Arc::new(SystemClock::new()));
    let mut buffered_tokens = Vec::new();
    for i in 0..3 {
        let token = manager.create_initial_token(&run.run_id,
                                                 &agg_node.node_id,
                                                 i,
                                                 json!({"value": i * 10}))
                           .unwrap();
        buffered_tokens.push(token.clone());
        let decision = executor1.buffer_row(&agg_node.node_id, token).unwrap();
        assert!(!decision.should_flush);
    }
    let serialized = serde_json::to_string(&executor1.get_checkpoint_state()).unwrap();
    drop(executor1);

    // Second executor rehydrates from the serialized state.
    let mut executor2 = AggregationExecutor::new(&recorder,
                                                 &spans,
                                                 &run.run_id,
                                                 make_settings(),
                                                 Arc::new(SystemClock::new()));
    let state: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    executor2.restore_from_checkpoint(&state).unwrap();

    // Identical rows, token ids and batch id.
    assert_eq!(executor2.get_buffered_rows(&agg_node.node_id),
               vec![json!({"value": 0}), json!({"value": 10}), json!({"value": 20})]);
    let restored_ids: Vec<String> = executor2.get_buffered_tokens(&agg_node.node_id)
                                             .iter()
                                             .map(|t| t.token_id.clone())
                                             .collect();
    let original_ids: Vec<String> =
        buffered_tokens.iter().map(|t| t.token_id.clone()).collect();
    assert_eq!(restored_ids, original_ids);
    assert!(executor2.get_batch_id(&agg_node.node_id).is_some());

    // The restored counter means the NEXT row fires the count=4 trigger,
    // exactly as it would have without the restart.
    assert!(!executor2.should_flush(&agg_node.node_id));
    let fourth = manager.create_initial_token(&run.run_id,
                                              &agg_node.node_id,
                                              3,
                                              json!({"value": 30}))
                        .unwrap();
    let decision = executor2.buffer_row(&agg_node.node_id, fourth).unwrap();
    assert!(decision.should_flush, "near-full batch flushes on the next row");
}

#[test]
fn checkpoint_roundtrip_resumes_the_timeout_window() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let agg_node = register_node(&recorder, &run.run_id, "timeout_roundtrip",
                                 NodeKind::Aggregation);
    let spans = SpanFactory::noop();
    let manager = TokenManager::new(&recorder);

    let make_settings = || {
        let mut settings = HashMap::new();
        settings.insert(agg_node.node_id.clone(),
                        AggregationSettings { name: "timed_agg".to_string(),
                                              trigger: TriggerConfig {
                                                  count: Some(100), // won't fire by count
                                                  timeout_seconds: Some(60.0),
                                                  size_bytes: None,
                                              },
                                              mode: AggregationMode::Passthrough });
        settings
    };

    // First executor: one row buffered, then 55s of the 60s window elapse
    // before the "crash".
    let clock1 = Arc::new(MockClock::new(1_000.0));
    let mut executor1 = AggregationExecutor::new(&recorder,
                                                 &spans,
                                                 &run.run_id,
                                                 make_settings(),
                                                 Arc::clone(&clock1) as Arc<dyn Clock>);
    let token = manager.create_initial_token(&run.run_id,
                                             &agg_node.node_id,
                                             0,
                                             json!({"value": 1}))
                       .unwrap();
    executor1.buffer_row(&agg_node.node_id, token).unwrap();
    clock1.advance(55.0);
    let serialized = serde_json::to_string(&executor1.get_checkpoint_state()).unwrap();
    drop(executor1);

    // Second executor in a "new process": the clock origin starts over.
    let clock2 = Arc::new(MockClock::new(0.0));
    let mut executor2 = AggregationExecutor::new(&recorder,
                                                 &spans,
                                                 &run.run_id,
                                                 make_settings(),
                                                 Arc::clone(&clock2) as Arc<dyn Clock>);
    let state: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    executor2.restore_from_checkpoint(&state).unwrap();

    // The window resumes 55s in; it must NOT restart from zero.
    assert!(!executor2.timed_out(&agg_node.node_id));
    assert!(!executor2.should_flush(&agg_node.node_id));

    clock2.advance(4.0); // 59s into the original window: still waiting
    assert!(!executor2.timed_out(&agg_node.node_id));

    clock2.advance(1.5); // 60.5s: fires exactly when it would have
    assert!(executor2.timed_out(&agg_node.node_id));
    assert!(executor2.should_flush(&agg_node.node_id));
}

#[test]
fn checkpoint_manager_round_trips_versioned_envelope() {
    let dir = std::env::temp_dir().join(format!("cauce-ckpt-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("checkpoint.json");
    let manager = CheckpointManager::new(CheckpointSettings { path: path.clone() });

    let state = json!({"node-1": {"rows": [{"v": 1}], "token_ids": ["t-1"], "batch_id": "b"}});
    manager.save("run-1", &state).unwrap();

    let loaded = manager.load().unwrap().expect("state present");
    assert_eq!(loaded, state);

    std::fs::remove_file(&path).ok();
}

#[test]
fn unknown_checkpoint_version_is_a_hard_error() {
    let dir = std::env::temp_dir().join(format!("cauce-ckpt-bad-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("checkpoint.json");
    std::fs::write(&path, r#"{"version": 999, "aggregations": {}}"#).unwrap();

    let manager = CheckpointManager::new(CheckpointSettings { path: path.clone() });
    let err = manager.load().expect_err("unknown version must not be papered over");
    assert!(matches!(err, EngineError::InvariantViolation(_)), "got {err:?}");

    std::fs::remove_file(&path).ok();
}
