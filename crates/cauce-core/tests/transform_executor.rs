//! TransformExecutor audit surface: node_state open/close pairs, hashes,
//! attempts, context_after, and the three error tiers.

mod common;

use std::collections::HashMap;

use serde_json::json;

use cauce_core::contracts::{NodeKind, PluginContext, TransformResult};
use cauce_core::executors::{TransformExecutor, TransformOutcome};
use cauce_core::spans::SpanFactory;
use cauce_core::tokens::{TokenInfo, TokenManager};
use cauce_core::EngineError;

use common::{begin_run, recorder, register_node, FnTransform};

fn seeded_token(recorder: &cauce_core::Recorder<cauce_core::MemoryStore>,
                run_id: &str,
                node_id: &str,
                data: serde_json::Value)
                -> TokenInfo {
    let manager = TokenManager::new(recorder);
    manager.create_initial_token(&run_id.to_string(), &node_id.to_string(), 0, data)
           .expect("token created")
}

#[test]
fn success_updates_token_and_audits_hashes() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let node = register_node(&recorder, &run.run_id, "double", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut transform = FnTransform::new("double", &node.node_id, |row| {
        Ok(TransformResult::success(json!({"value": row["value"].as_i64().unwrap() * 2})))
    });

    let token = seeded_token(&recorder, &run.run_id, &node.node_id, json!({"value": 21}));
    let ctx = PluginContext::new(&run.run_id, json!({}));
    let executor = TransformExecutor::new(&recorder, &spans, &run.run_id, HashMap::new());

    let execution = executor.execute_transform(&mut transform, &token, &ctx, 1, 0).unwrap();
    match execution.outcome {
        TransformOutcome::Success { token: updated } => {
            assert_eq!(updated.row_data, json!({"value": 42}));
            assert_eq!(updated.token_id, token.token_id, "identity preserved");
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert!(!execution.input_hash.is_empty());

    let states = recorder.get_node_states_for_token(&token.token_id).unwrap();
    assert_eq!(states.len(), 1);
    let state = &states[0];
    assert_eq!(state.status.as_str(), "completed");
    assert_eq!(state.step_index, 1);
    assert_eq!(state.attempt, 0);
    assert!(state.output_hash.is_some());
    assert!(state.duration_ms.is_some());
    // Input and output hashes differ: the row changed.
    assert_ne!(state.output_hash.as_deref(), Some(state.input_hash.as_str()));
}

#[test]
fn context_after_lands_in_the_node_state() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let node = register_node(&recorder, &run.run_id, "llm_call", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut transform = FnTransform::new("llm_call", &node.node_id, |row| {
        Ok(TransformResult::success_with_context(
            row.clone(),
            json!({"prompt_tokens": 120, "completion_tokens": 48}),
        ))
    });

    let token = seeded_token(&recorder, &run.run_id, &node.node_id, json!({"text": "hi"}));
    let ctx = PluginContext::new(&run.run_id, json!({}));
    let executor = TransformExecutor::new(&recorder, &spans, &run.run_id, HashMap::new());

    executor.execute_transform(&mut transform, &token, &ctx, 1, 0).unwrap();

    let states = recorder.get_node_states_for_token(&token.token_id).unwrap();
    let context_after = states[0].context_after_json.as_ref().expect("context recorded");
    assert_eq!(context_after["prompt_tokens"], json!(120));
}

#[test]
fn attempt_number_is_recorded_per_state() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let node = register_node(&recorder, &run.run_id, "steady", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut transform = FnTransform::new("steady", &node.node_id, |row| {
        Ok(TransformResult::success(row.clone()))
    });
    let token = seeded_token(&recorder, &run.run_id, &node.node_id, json!({"v": 1}));
    let ctx = PluginContext::new(&run.run_id, json!({}));
    let executor = TransformExecutor::new(&recorder, &spans, &run.run_id, HashMap::new());

    executor.execute_transform(&mut transform, &token, &ctx, 1, 0).unwrap();
    executor.execute_transform(&mut transform, &token, &ctx, 1, 1).unwrap();

    let states = recorder.get_node_states_for_token(&token.token_id).unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].attempt, 0);
    assert_eq!(states[1].attempt, 1);
}

#[test]
fn duplicate_attempt_is_an_invariant_violation() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let node = register_node(&recorder, &run.run_id, "steady", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut transform = FnTransform::new("steady", &node.node_id, |row| {
        Ok(TransformResult::success(row.clone()))
    });
    let token = seeded_token(&recorder, &run.run_id, &node.node_id, json!({"v": 1}));
    let ctx = PluginContext::new(&run.run_id, json!({}));
    let executor = TransformExecutor::new(&recorder, &spans, &run.run_id, HashMap::new());

    executor.execute_transform(&mut transform, &token, &ctx, 1, 0).unwrap();
    let err = executor.execute_transform(&mut transform, &token, &ctx, 1, 0)
                      .expect_err("same (token, node, attempt) twice must fail");
    assert!(matches!(err, EngineError::InvariantViolation(_)), "got {err:?}");
}

#[test]
fn declared_error_with_discard_keeps_the_reason() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let node = register_node(&recorder, &run.run_id, "validator", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut transform = FnTransform::new("validator", &node.node_id, |_row| {
        Ok(TransformResult::error(json!({"reason": "validation_failed", "value": -5})))
    }).discarding();

    let token = seeded_token(&recorder, &run.run_id, &node.node_id, json!({"value": -5}));
    let ctx = PluginContext::new(&run.run_id, json!({}));
    let executor = TransformExecutor::new(&recorder, &spans, &run.run_id, HashMap::new());

    let execution = executor.execute_transform(&mut transform, &token, &ctx, 1, 0).unwrap();
    match execution.outcome {
        TransformOutcome::ErrorDiscarded { reason } => {
            assert_eq!(reason["reason"], json!("validation_failed"));
        }
        other => panic!("expected discard, got {other:?}"),
    }

    // failed state + transform_error with destination discard, no routing
    // event (discard has no edge).
    let states = recorder.get_node_states_for_token(&token.token_id).unwrap();
    assert_eq!(states[0].status.as_str(), "failed");
    let events = recorder.get_routing_events(&states[0].state_id).unwrap();
    assert!(events.is_empty());
    let errors = recorder.get_transform_errors_for_token(&token.token_id).unwrap();
    assert_eq!(errors[0].destination, "discard");
    assert!(!errors[0].error_hash.is_empty());
}

#[test]
fn plugin_exception_closes_state_failed_and_propagates() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let node = register_node(&recorder, &run.run_id, "broken", NodeKind::Transform);
    let spans = SpanFactory::noop();

    let mut transform = FnTransform::new("broken", &node.node_id, |_row| {
        Err(cauce_core::PluginCallError::fatal("kaboom"))
    });
    let token = seeded_token(&recorder, &run.run_id, &node.node_id, json!({"v": 1}));
    let ctx = PluginContext::new(&run.run_id, json!({}));
    let executor = TransformExecutor::new(&recorder, &spans, &run.run_id, HashMap::new());

    let err = executor.execute_transform(&mut transform, &token, &ctx, 1, 0)
                      .expect_err("exceptions propagate");
    assert!(matches!(err, EngineError::PluginFailure { .. }));

    let states = recorder.get_node_states_for_token(&token.token_id).unwrap();
    assert_eq!(states[0].status.as_str(), "failed");
    let error_json = states[0].error_json.as_ref().expect("error payload kept");
    assert_eq!(error_json["message"], json!("kaboom"));
}
