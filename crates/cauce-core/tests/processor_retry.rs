//! Retry semantics: one node_state per attempt, FAILED on exhaustion, and
//! the conversion rules when no retry manager is configured.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use serde_json::json;

use cauce_core::contracts::{
    NodeKind, PipelineStep, PluginCallError, PluginContext, RetrySettings, RowOutcome,
    TransformResult,
};
use cauce_core::processor::RowProcessor;
use cauce_core::spans::SpanFactory;
use cauce_core::EngineError;

use common::{begin_run, recorder, register_node, FnTransform};

fn fast_retries(max_attempts: u32) -> RetrySettings {
    RetrySettings { max_attempts,
                    base_delay: 0.001,
                    max_delay: 0.01,
                    exponential_base: 2.0,
                    jitter: 0.0 }
}

#[test]
fn flaky_transform_records_one_state_per_attempt() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let flaky = register_node(&recorder, &run.run_id, "flaky", NodeKind::Transform);
    let spans = SpanFactory::noop();

    // Fails twice with a retryable error, then succeeds.
    let calls = Rc::new(Cell::new(0u32));
    let calls_in = Rc::clone(&calls);
    let mut steps = vec![
        PipelineStep::Transform(Box::new(FnTransform::new("flaky", &flaky.node_id, move |row| {
            let n = calls_in.get();
            calls_in.set(n + 1);
            if n < 2 {
                return Err(PluginCallError::retryable("rate limited"));
            }
            Ok(TransformResult::success(row.clone()))
        }))),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .retry(fast_retries(3))
        .build();

    let results = processor.process_row(0, json!({"value": 1}), &mut steps, &ctx).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, RowOutcome::Completed);

    // Exactly 3 node_states: attempts 0 and 1 failed, attempt 2 completed.
    let states = recorder.get_node_states_for_token(results[0].token_id()).unwrap();
    assert_eq!(states.len(), 3);
    let attempts: Vec<u32> = states.iter().map(|s| s.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(states[0].status.as_str(), "failed");
    assert!(states[0].error_json.is_some());
    assert_eq!(states[1].status.as_str(), "failed");
    assert!(states[1].error_json.is_some());
    assert_eq!(states[2].status.as_str(), "completed");
    assert!(states[2].error_json.is_none());
}

#[test]
fn retry_exhaustion_maps_to_failed_outcome() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let dead = register_node(&recorder, &run.run_id, "dead", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(FnTransform::new("dead", &dead.node_id, |_row| {
            Err(PluginCallError::retryable("still down"))
        }))),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .retry(fast_retries(2))
        .build();

    // Exhaustion returns FAILED, it does not raise.
    let results = processor.process_row(0, json!({"value": 1}), &mut steps, &ctx).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, RowOutcome::Failed);

    let outcome = recorder.get_token_outcome(results[0].token_id()).unwrap().unwrap();
    assert_eq!(outcome.outcome, RowOutcome::Failed);
    assert!(outcome.error_hash.is_some());

    let states = recorder.get_node_states_for_token(results[0].token_id()).unwrap();
    assert_eq!(states.len(), 2, "one failed state per attempt");
    assert!(states.iter().all(|s| s.status.as_str() == "failed"));
}

#[test]
fn non_retryable_failure_propagates() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let bug = register_node(&recorder, &run.run_id, "buggy", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(FnTransform::new("buggy", &bug.node_id, |_row| {
            Err(PluginCallError::fatal("null pointer, basically"))
        }))),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .retry(fast_retries(3))
        .build();

    let err = processor.process_row(0, json!({"value": 1}), &mut steps, &ctx)
                       .expect_err("plugin bugs are not retried");
    match err {
        EngineError::PluginFailure { retryable, .. } => assert!(!retryable),
        other => panic!("expected PluginFailure, got {other:?}"),
    }

    // Single attempt, closed failed with the error payload.
    let rows = recorder.get_rows(&run.run_id).unwrap();
    let tokens = recorder.get_tokens(&rows[0].row_id).unwrap();
    let states = recorder.get_node_states_for_token(&tokens[0].token_id).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status.as_str(), "failed");
}

#[test]
fn no_retry_manager_converts_retryable_to_routed_error() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let shaky = register_node(&recorder, &run.run_id, "shaky", NodeKind::Transform);
    let error_sink = register_node(&recorder, &run.run_id, "error_sink", NodeKind::Sink);
    let spans = SpanFactory::noop();

    let edge = recorder.register_edge(&run.run_id,
                                      &shaky.node_id,
                                      &error_sink.node_id,
                                      &cauce_core::contracts::error_edge_label(0),
                                      cauce_core::RoutingMode::Divert)
                       .unwrap();
    let mut edge_map = std::collections::HashMap::new();
    edge_map.insert((shaky.node_id.clone(), cauce_core::contracts::error_edge_label(0)),
                    edge.edge_id);

    let mut steps = vec![
        PipelineStep::Transform(Box::new(
            FnTransform::new("shaky", &shaky.node_id, |_row| {
                Err(PluginCallError::retryable("transient upstream error"))
            }).routing_errors_to("error_sink"),
        )),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    // No retry manager: the retryable failure degrades to a declared error
    // result and routes via on_error.
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .edge_map(edge_map)
        .build();

    let results = processor.process_row(0, json!({"value": 1}), &mut steps, &ctx).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, RowOutcome::Routed);
    assert_eq!(results[0].sink_name.as_deref(), Some("error_sink"));

    let errors = recorder.get_transform_errors_for_token(results[0].token_id()).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].destination, "error_sink");
}

#[test]
fn no_retry_manager_and_no_on_error_raises() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let shaky = register_node(&recorder, &run.run_id, "shaky", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(FnTransform::new("shaky", &shaky.node_id, |_row| {
            Err(PluginCallError::retryable("transient upstream error"))
        }))),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    // Quieting the failure into a bogus ROUTED with no sink is forbidden:
    // without on_error the row raises and the run fails.
    let err = processor.process_row(0, json!({"value": 1}), &mut steps, &ctx)
                       .expect_err("must raise without retry manager or on_error");
    assert!(matches!(err, EngineError::PluginFailure { retryable: true, .. }), "got {err:?}");
}
