//! Aggregation batching through the processor: transform-mode token
//! identity, passthrough identity preservation, and contract violations.

mod common;

use std::collections::HashMap;

use serde_json::json;

use cauce_core::contracts::{
    AggregationMode, AggregationSettings, NodeKind, PipelineStep, PluginContext, RowOutcome,
    TransformResult, TriggerConfig,
};
use cauce_core::processor::RowProcessor;
use cauce_core::spans::SpanFactory;
use cauce_core::EngineError;

use common::{begin_run, recorder, register_node, FnTransform};

fn aggregation(name: &str, count: usize, mode: AggregationMode) -> AggregationSettings {
    AggregationSettings { name: name.to_string(),
                          trigger: TriggerConfig::by_count(count),
                          mode }
}

fn sum_transform(node_id: &str) -> FnTransform {
    FnTransform::new("summer", node_id, |row| Ok(TransformResult::success(row.clone())))
        .creating_tokens()
        .batch_aware(|rows| {
            let total: i64 = rows.iter()
                                 .filter_map(|r| r["value"].as_i64())
                                 .sum();
            Ok(TransformResult::success(json!({"total": total})))
        })
}

#[test]
fn transform_mode_consumes_all_members_and_creates_new_token() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let agg = register_node(&recorder, &run.run_id, "summer", NodeKind::Aggregation);
    let spans = SpanFactory::noop();

    let mut settings = HashMap::new();
    settings.insert(agg.node_id.clone(),
                    aggregation("batch_sum", 3, AggregationMode::Transform));

    let mut steps = vec![PipelineStep::Transform(Box::new(sum_transform(&agg.node_id)))];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .aggregation_settings(settings)
        .build();

    let mut all_results = Vec::new();
    let mut input_token_ids = Vec::new();
    for i in 0..3 {
        let results = processor.process_row(i,
                                            json!({"value": (i as i64 + 1) * 10}),
                                            &mut steps,
                                            &ctx)
                               .unwrap();
        for result in &results {
            if result.outcome == RowOutcome::ConsumedInBatch {
                input_token_ids.push(result.token_id().to_string());
            }
        }
        all_results.extend(results);
    }

    // 3 consumed inputs + 1 completed output in the flushing call.
    assert_eq!(input_token_ids.len(), 3);
    let completed: Vec<_> = all_results.iter()
                                       .filter(|r| r.outcome == RowOutcome::Completed)
                                       .collect();
    assert_eq!(completed.len(), 1);
    let output = completed[0];
    assert_eq!(output.final_data(), &json!({"total": 60}));

    // The output token is a NEW identity, never one of the inputs.
    assert!(!input_token_ids.contains(&output.token_id().to_string()),
            "batch output must not reuse an input token_id");

    // ALL members are CONSUMED_IN_BATCH, including the triggering one.
    for token_id in &input_token_ids {
        let outcome = recorder.get_token_outcome(token_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::ConsumedInBatch,
                   "member {token_id} must be consumed in batch");
    }

    // All inputs appear as batch members in buffer order.
    let states = recorder.get_node_states_for_token(&input_token_ids[0]).unwrap();
    assert!(!states.is_empty());
    // Find the batch via its members: batch ordinal order equals input order.
    let rows = recorder.get_rows(&run.run_id).unwrap();
    assert_eq!(rows.len(), 3);
}

#[test]
fn passthrough_mode_preserves_token_identity() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let agg = register_node(&recorder, &run.run_id, "enricher", NodeKind::Aggregation);
    let spans = SpanFactory::noop();

    let mut settings = HashMap::new();
    settings.insert(agg.node_id.clone(),
                    aggregation("batch_enrich", 3, AggregationMode::Passthrough));

    // N in, N out, same order, each row annotated with the batch size.
    let transform = FnTransform::new("enricher", &agg.node_id, |row| {
        Ok(TransformResult::success(row.clone()))
    }).batch_aware(|rows| {
        let n = rows.len();
        Ok(TransformResult::success_multi(
            rows.iter()
                .map(|r| {
                    let mut out = r.as_object().cloned().unwrap();
                    out.insert("batch_size".into(), json!(n));
                    serde_json::Value::Object(out)
                })
                .collect(),
        ))
    });
    let mut steps = vec![PipelineStep::Transform(Box::new(transform))];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .aggregation_settings(settings)
        .build();

    let mut buffered_ids = Vec::new();
    let r0 = processor.process_row(0, json!({"value": 1}), &mut steps, &ctx).unwrap();
    let r1 = processor.process_row(1, json!({"value": 2}), &mut steps, &ctx).unwrap();
    for result in r0.iter().chain(r1.iter()) {
        assert_eq!(result.outcome, RowOutcome::Buffered);
        buffered_ids.push(result.token_id().to_string());
        // Parked tokens have no terminal outcome yet.
        assert!(recorder.get_token_outcome(result.token_id()).unwrap().is_none());
    }

    // Third row triggers the flush; all three come out COMPLETED.
    let r2 = processor.process_row(2, json!({"value": 3}), &mut steps, &ctx).unwrap();
    let completed: Vec<_> =
        r2.iter().filter(|r| r.outcome == RowOutcome::Completed).collect();
    assert_eq!(completed.len(), 3);

    // The BUFFERED token_ids reappear as the COMPLETED tokens, in order.
    let completed_ids: Vec<String> =
        completed.iter().map(|r| r.token_id().to_string()).collect();
    assert_eq!(&completed_ids[..2], &buffered_ids[..]);
    for result in &completed {
        assert_eq!(result.final_data()["batch_size"], json!(3));
    }
}

#[test]
fn passthrough_row_count_mismatch_is_fatal() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let agg = register_node(&recorder, &run.run_id, "bad", NodeKind::Aggregation);
    let spans = SpanFactory::noop();

    let mut settings = HashMap::new();
    settings.insert(agg.node_id.clone(),
                    aggregation("bad_passthrough", 3, AggregationMode::Passthrough));

    // Returns 1 row for 3 inputs: a contract violation.
    let transform = FnTransform::new("bad", &agg.node_id, |row| {
        Ok(TransformResult::success(row.clone()))
    }).batch_aware(|rows| Ok(TransformResult::success(rows[0].clone())));
    let mut steps = vec![PipelineStep::Transform(Box::new(transform))];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .aggregation_settings(settings)
        .build();

    processor.process_row(0, json!({"value": 1}), &mut steps, &ctx).unwrap();
    processor.process_row(1, json!({"value": 2}), &mut steps, &ctx).unwrap();
    let err = processor.process_row(2, json!({"value": 3}), &mut steps, &ctx)
                       .expect_err("count mismatch must fail the flush");
    match err {
        EngineError::ContractViolation(message) => {
            assert!(message.contains("same number of output rows"), "got: {message}");
        }
        other => panic!("expected contract violation, got {other:?}"),
    }
}

#[test]
fn batch_aware_without_settings_runs_single_row_mode() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let t = register_node(&recorder, &run.run_id, "summer", NodeKind::Transform);
    let spans = SpanFactory::noop();

    // Batch-aware plugin, but no AggregationSettings registered for the
    // node: the processor drives it row by row.
    let mut steps = vec![PipelineStep::Transform(Box::new(sum_transform(&t.node_id)))];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor =
        RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id).build();

    let results = processor.process_row(0, json!({"value": 7}), &mut steps, &ctx).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, RowOutcome::Completed);
    assert_eq!(results[0].final_data(), &json!({"value": 7}));
}

#[test]
fn count_of_one_makes_each_row_its_own_batch() {
    let recorder = recorder();
    let run = begin_run(&recorder);
    let source = register_node(&recorder, &run.run_id, "source", NodeKind::Source);
    let agg = register_node(&recorder, &run.run_id, "summer", NodeKind::Aggregation);
    let spans = SpanFactory::noop();

    let mut settings = HashMap::new();
    settings.insert(agg.node_id.clone(),
                    aggregation("unit_batches", 1, AggregationMode::Transform));
    let mut steps = vec![PipelineStep::Transform(Box::new(sum_transform(&agg.node_id)))];

    let ctx = PluginContext::new(&run.run_id, json!({}));
    let mut processor = RowProcessor::builder(&recorder, &spans, &run.run_id, &source.node_id)
        .aggregation_settings(settings)
        .build();

    for i in 0..2 {
        let results = processor.process_row(i, json!({"value": 5}), &mut steps, &ctx).unwrap();
        let consumed = results.iter()
                              .filter(|r| r.outcome == RowOutcome::ConsumedInBatch)
                              .count();
        let completed = results.iter()
                               .filter(|r| r.outcome == RowOutcome::Completed)
                               .count();
        assert_eq!(consumed, 1, "each row is its own batch");
        assert_eq!(completed, 1, "each batch flushes immediately");
    }
}
