//! Recorder-level invariants: single terminal outcome, payload mirroring,
//! and lineage assembly.

mod common;

use serde_json::json;

use cauce_core::contracts::{NodeKind, RowOutcome};
use cauce_core::recorder::{MemoryPayloadStore, MemoryStore, OutcomeDetail, Recorder};
use cauce_core::tokens::TokenManager;
use cauce_core::EngineError;

use common::{begin_run, recorder, register_node};

#[test]
fn second_terminal_outcome_write_is_an_invariant_violation() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let manager = TokenManager::new(&recorder);
    let token = manager.create_initial_token(&run.run_id, &source.node_id, 0, json!({"v": 1}))
                       .unwrap();

    recorder.record_terminal_outcome(&token.token_id,
                                     RowOutcome::Completed,
                                     OutcomeDetail::sink("default"))
            .expect("first write succeeds");

    let err = recorder.record_terminal_outcome(&token.token_id,
                                               RowOutcome::Failed,
                                               OutcomeDetail::default())
                      .expect_err("second write must be rejected");
    assert!(matches!(err, EngineError::InvariantViolation(_)), "got {err:?}");

    // The first outcome is untouched.
    let outcome = recorder.get_token_outcome(&token.token_id).unwrap().unwrap();
    assert_eq!(outcome.outcome, RowOutcome::Completed);
    assert_eq!(outcome.sink_name.as_deref(), Some("default"));
}

#[test]
fn payload_store_keeps_payloads_by_hash() {
    let payloads = Box::new(MemoryPayloadStore::new());
    let recorder = Recorder::new(MemoryStore::new()).with_payload_store(payloads);
    let run = recorder.begin_run(json!({}), "v1").unwrap();
    let source = recorder.register_node(&run.run_id,
                                        "source",
                                        NodeKind::Source,
                                        "1.0",
                                        json!({}),
                                        &cauce_core::SchemaConfig::dynamic())
                         .unwrap();

    let row = recorder.create_row(&run.run_id,
                                  &source.node_id,
                                  0,
                                  json!({"text": "hola"}),
                                  None)
                      .unwrap();

    // The hash is the audit anchor; the payload is retrievable by it even
    // if the inline copy were purged.
    let payload = recorder.get_payload(&row.data_hash).expect("payload mirrored");
    assert_eq!(payload, json!({"text": "hola"}));
}

#[test]
fn explain_assembles_the_full_trace() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let node = register_node(&recorder, &run.run_id, "step", NodeKind::Transform);
    let manager = TokenManager::new(&recorder);

    let token = manager.create_initial_token(&run.run_id, &source.node_id, 0, json!({"v": 1}))
                       .unwrap();
    let state = recorder.begin_node_state(&token.token_id, &node.node_id, 1, 0, &json!({"v": 1}))
                        .unwrap();
    recorder.complete_node_state(&state.state_id,
                                 cauce_core::NodeStateStatus::Completed,
                                 Some(&json!({"v": 2})),
                                 Some(3),
                                 None,
                                 None)
            .unwrap();
    recorder.record_terminal_outcome(&token.token_id,
                                     RowOutcome::Completed,
                                     OutcomeDetail::sink("default"))
            .unwrap();

    let lineage = recorder.explain(&run.run_id, &token.token_id).unwrap();
    assert_eq!(lineage.row.row_id, token.row_id);
    assert_eq!(lineage.node_states.len(), 1);
    assert_eq!(lineage.node_states[0].state_id, state.state_id);
    assert!(lineage.parents.is_empty());
    assert_eq!(lineage.outcome.unwrap().outcome, RowOutcome::Completed);

    // A token from another run is not explainable under this run.
    let other_run = begin_run(&recorder);
    assert!(recorder.explain(&other_run.run_id, &token.token_id).is_err());
}
