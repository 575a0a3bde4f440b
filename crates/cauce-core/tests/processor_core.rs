//! Core RowProcessor behavior: linear processing, token identity, error
//! handling with and without on_error.

mod common;

use serde_json::json;

use cauce_core::contracts::{NodeKind, PipelineStep, PluginContext, RowOutcome, TransformResult};
use cauce_core::processor::RowProcessor;
use cauce_core::spans::SpanFactory;
use cauce_core::EngineError;

use common::{begin_run, recorder, register_node, FnTransform};

#[test]
fn process_through_transforms_records_states() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let t1 = register_node(&recorder, &run.run_id, "double", NodeKind::Transform);
    let t2 = register_node(&recorder, &run.run_id, "add_one", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(FnTransform::new("double", &t1.node_id, |row| {
            Ok(TransformResult::success(json!({"value": row["value"].as_i64().unwrap() * 2})))
        }))),
        PipelineStep::Transform(Box::new(FnTransform::new("add_one", &t2.node_id, |row| {
            Ok(TransformResult::success(json!({"value": row["value"].as_i64().unwrap() + 1})))
        }))),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let results = processor.process_row(0, json!({"value": 10}), &mut steps, &ctx)
                           .expect("row processes");

    assert_eq!(results.len(), 1, "single result - no forks");
    let result = &results[0];
    assert_eq!(result.final_data(), &json!({"value": 21}));
    assert_eq!(result.outcome, RowOutcome::Completed);

    // One node_state per transform, completed, with both hashes recorded.
    let states = recorder.get_node_states_for_token(result.token_id()).unwrap();
    assert_eq!(states.len(), 2, "one node_state per transform");
    for state in &states {
        assert!(!state.input_hash.is_empty());
        assert!(state.output_hash.is_some());
        assert_eq!(state.status.as_str(), "completed");
    }
    // Source is step 0, transforms start at 1.
    let step_indices: Vec<usize> = states.iter().map(|s| s.step_index).collect();
    assert_eq!(step_indices, vec![1, 2]);
}

#[test]
fn process_no_transforms_passes_through() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let spans = SpanFactory::noop();

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let results = processor.process_row(0, json!({"passthrough": true}), &mut [], &ctx)
                           .expect("row processes");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].final_data(), &json!({"passthrough": true}));
    assert_eq!(results[0].outcome, RowOutcome::Completed);
    assert!(!results[0].token_id().is_empty());
    assert!(!results[0].row_id().is_empty());
}

#[test]
fn transform_error_without_on_error_is_a_plugin_bug() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let validator = register_node(&recorder, &run.run_id, "validator", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(FnTransform::new("validator",
                                                          &validator.node_id,
                                                          |_row| {
            Ok(TransformResult::error(json!({"message": "negative values not allowed"})))
        }))),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let err = processor.process_row(0, json!({"value": -5}), &mut steps, &ctx)
                       .expect_err("error result without on_error must raise");
    match err {
        EngineError::ContractViolation(message) => {
            assert!(message.contains("no on_error configured"), "got: {message}");
        }
        other => panic!("expected contract violation, got {other:?}"),
    }
}

#[test]
fn transform_error_with_discard_quarantines() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let validator = register_node(&recorder, &run.run_id, "validator", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(
            FnTransform::new("validator", &validator.node_id, |row| {
                if row["value"].as_i64().unwrap_or(0) < 0 {
                    Ok(TransformResult::error(json!({
                        "message": "negative values not allowed",
                    })))
                } else {
                    Ok(TransformResult::success(row.clone()))
                }
            }).discarding(),
        )),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let results = processor.process_row(0, json!({"value": -5}), &mut steps, &ctx)
                           .expect("discard never raises");
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.outcome, RowOutcome::Quarantined);
    // Original data preserved on the quarantined token.
    assert_eq!(result.final_data(), &json!({"value": -5}));

    let outcome = recorder.get_token_outcome(result.token_id()).unwrap().expect("recorded");
    assert_eq!(outcome.outcome, RowOutcome::Quarantined);
    assert!(outcome.error_hash.is_some(), "error hash recorded for quarantined rows");
    assert!(outcome.is_terminal());

    let states = recorder.get_node_states_for_token(result.token_id()).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status.as_str(), "failed");

    let errors = recorder.get_transform_errors_for_token(result.token_id()).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].destination, "discard");
    assert_eq!(errors[0].node_id, validator.node_id, "keyed by node_id, not plugin name");
}

#[test]
fn transform_error_with_sink_routes() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let validator = register_node(&recorder, &run.run_id, "validator", NodeKind::Transform);
    let error_sink = register_node(&recorder, &run.run_id, "error_sink", NodeKind::Sink);
    let spans = SpanFactory::noop();

    // DIVERT edge for attempt 0 must exist or routing is fatal.
    let edge = recorder.register_edge(&run.run_id,
                                      &validator.node_id,
                                      &error_sink.node_id,
                                      &cauce_core::contracts::error_edge_label(0),
                                      cauce_core::RoutingMode::Divert)
                       .unwrap();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(
            FnTransform::new("validator", &validator.node_id, |_row| {
                Ok(TransformResult::error(json!({"reason": "validation_failed"})))
            }).routing_errors_to("error_sink"),
        )),
    ];

    let mut edge_map = std::collections::HashMap::new();
    edge_map.insert((validator.node_id.clone(), cauce_core::contracts::error_edge_label(0)),
                    edge.edge_id.clone());

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .edge_map(edge_map)
        .build();

    let results = processor.process_row(0, json!({"value": -5}), &mut steps, &ctx)
                           .expect("routed errors never raise");
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.outcome, RowOutcome::Routed);
    assert_eq!(result.sink_name.as_deref(), Some("error_sink"));

    let outcome = recorder.get_token_outcome(result.token_id()).unwrap().expect("recorded");
    assert_eq!(outcome.outcome, RowOutcome::Routed);
    assert_eq!(outcome.sink_name.as_deref(), Some("error_sink"));

    // The DIVERT routing event is on the failed state.
    let states = recorder.get_node_states_for_token(result.token_id()).unwrap();
    let events = recorder.get_routing_events(&states[0].state_id).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].edge_id, edge.edge_id);
    assert_eq!(events[0].mode.as_str(), "divert");
}

#[test]
fn missing_divert_edge_is_fatal() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let validator = register_node(&recorder, &run.run_id, "validator", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(
            FnTransform::new("validator", &validator.node_id, |_row| {
                Ok(TransformResult::error(json!({"reason": "bad"})))
            }).routing_errors_to("error_sink"),
        )),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    // No edge map at all: the DIVERT edge is unregistered.
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let err = processor.process_row(0, json!({"value": 1}), &mut steps, &ctx)
                       .expect_err("missing DIVERT edge is an invariant violation");
    assert!(matches!(err, EngineError::InvariantViolation(_)), "got {err:?}");
}

#[test]
fn expanding_transform_creates_child_tokens() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let splitter = register_node(&recorder, &run.run_id, "splitter", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(
            FnTransform::new("splitter", &splitter.node_id, |row| {
                let items = row["items"].as_array().cloned().unwrap_or_default();
                Ok(TransformResult::success_multi(
                    items.into_iter().map(|item| json!({"item": item})).collect(),
                ))
            }).creating_tokens(),
        )),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let results = processor.process_row(0, json!({"items": [1, 2, 3]}), &mut steps, &ctx)
                           .expect("expansion processes");

    // One result per terminal token: the EXPANDED parent plus 3 completed
    // children.
    assert_eq!(results.len(), 4);
    let expanded: Vec<_> =
        results.iter().filter(|r| r.outcome == RowOutcome::Expanded).collect();
    assert_eq!(expanded.len(), 1);
    let completed_children: Vec<_> =
        results.iter().filter(|r| r.outcome == RowOutcome::Completed).collect();
    assert_eq!(completed_children.len(), 3);

    let rows = recorder.get_rows(&run.run_id).unwrap();
    let tokens = recorder.get_tokens(&rows[0].row_id).unwrap();
    assert_eq!(tokens.len(), 4, "parent + 3 children share the row");

    let parent = tokens.iter().find(|t| t.expand_group_id.is_none()).expect("parent");
    let parent_outcome = recorder.get_token_outcome(&parent.token_id).unwrap().unwrap();
    assert_eq!(parent_outcome.outcome, RowOutcome::Expanded);

    // Children share the expand group with the parent outcome.
    for child in tokens.iter().filter(|t| t.expand_group_id.is_some()) {
        assert_eq!(child.expand_group_id, parent_outcome.expand_group_id);
        let parents = recorder.get_token_parents(&child.token_id).unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].token_id, parent.token_id);
    }
}

#[test]
fn multi_row_output_without_creates_tokens_is_fatal() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let bad = register_node(&recorder, &run.run_id, "bad_multi", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut steps = vec![
        PipelineStep::Transform(Box::new(FnTransform::new("bad_multi", &bad.node_id, |_row| {
            Ok(TransformResult::success_multi(vec![json!({"a": 1}), json!({"a": 2})]))
        }))),
    ];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let err = processor.process_row(0, json!({}), &mut steps, &ctx)
                       .expect_err("multi output without creates_tokens must raise");
    assert!(matches!(err, EngineError::ContractViolation(_)), "got {err:?}");
}
