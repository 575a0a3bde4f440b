//! End-to-end scenarios through the orchestrator with the bundled adapters:
//! fork lineage, aggregation batching, and error routing to a named sink.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use cauce_adapters::{BatchSum, CollectSink, RangeValidator, Scale, StaticSource};
use cauce_core::{
    AggregationMode, AggregationSettings, CoalescePolicy, CoalesceSettings, ExecutionGraph,
    GateSettings, MergeStrategy, NodeKind, Orchestrator, PipelineConfig, PipelineStep, Recorder,
    RoutingMode, RowOutcome, RunStatus, SpanFactory, TriggerConfig,
};
use cauce_core::recorder::MemoryStore;

#[test]
fn fork_to_two_branches_yields_three_outcomes() {
    // Source -> fork gate (path_a, path_b): parent FORKED, both children
    // COMPLETED with the untouched row data.
    let recorder = Recorder::new(MemoryStore::new());
    let spans = SpanFactory::noop();

    let sink = CollectSink::new("default");
    let delivered = sink.handle();
    let mut sinks: BTreeMap<String, Box<dyn cauce_core::SinkPlugin>> = BTreeMap::new();
    sinks.insert("default".to_string(), Box::new(sink));

    let mut builder = ExecutionGraph::builder();
    builder.add_node("source", NodeKind::Source, "static");
    builder.add_node("fork_gate", NodeKind::Gate, "fork_gate");
    builder.add_node("sink_default", NodeKind::Sink, "default");
    builder.add_edge("source", "fork_gate", "continue", RoutingMode::Move);
    builder.add_edge("fork_gate", "sink_default", "path_a", RoutingMode::Copy);
    builder.add_edge("fork_gate", "sink_default", "path_b", RoutingMode::Copy);
    builder.register_sink("default", "sink_default");
    builder.register_config_gate("fork_gate", "fork_gate");
    builder.set_output_sink("default");

    let gate = GateSettings { name: "fork_gate".to_string(),
                              condition: "True".to_string(),
                              routes: [("true".to_string(), "fork".to_string()),
                                       ("false".to_string(), "continue".to_string())]
                                  .into_iter()
                                  .collect(),
                              fork_to: vec!["path_a".to_string(), "path_b".to_string()] };
    let graph = builder.finish(std::slice::from_ref(&gate)).expect("valid graph");

    let config = PipelineConfig { source: Box::new(StaticSource::new(vec![
                                      json!({"value": 42}),
                                  ])),
                                  steps: Vec::new(),
                                  sinks,
                                  config_gates: vec![gate],
                                  aggregations: HashMap::new(),
                                  coalesce: Vec::new(),
                                  retry: None };

    let mut orchestrator = Orchestrator::new(&recorder, &spans);
    let summary = orchestrator.run(config, &graph).expect("run completes");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_forked, 1);
    assert_eq!(summary.rows_succeeded, 2);
    assert_eq!(delivered.lock().unwrap().len(), 2);

    // 3 terminal outcomes: parent FORKED sharing its group id with both
    // children's token records.
    let tokens = recorder.get_tokens_for_run(&summary.run_id).unwrap();
    assert_eq!(tokens.len(), 3);
    let parent = tokens.iter().find(|t| t.branch_name.is_none()).unwrap();
    let parent_outcome = recorder.get_token_outcome(&parent.token_id).unwrap().unwrap();
    assert_eq!(parent_outcome.outcome, RowOutcome::Forked);
    let group = parent_outcome.fork_group_id.clone().unwrap();

    for child in tokens.iter().filter(|t| t.branch_name.is_some()) {
        assert_eq!(child.fork_group_id.as_deref(), Some(group.as_str()));
        let outcome = recorder.get_token_outcome(&child.token_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::Completed);
    }
}

#[test]
fn fork_then_coalesce_merges_into_single_delivery() {
    // Fork to two branches and require_all-coalesce them back: the sink
    // receives exactly one merged row.
    let recorder = Recorder::new(MemoryStore::new());
    let spans = SpanFactory::noop();

    let sink = CollectSink::new("default");
    let delivered = sink.handle();
    let mut sinks: BTreeMap<String, Box<dyn cauce_core::SinkPlugin>> = BTreeMap::new();
    sinks.insert("default".to_string(), Box::new(sink));

    let mut builder = ExecutionGraph::builder();
    builder.add_node("source", NodeKind::Source, "static");
    builder.add_node("fork_gate", NodeKind::Gate, "fork_gate");
    builder.add_node("merge_results", NodeKind::Coalesce, "merge_results");
    builder.add_node("sink_default", NodeKind::Sink, "default");
    builder.add_edge("source", "fork_gate", "continue", RoutingMode::Move);
    builder.add_edge("fork_gate", "merge_results", "path_a", RoutingMode::Copy);
    builder.add_edge("fork_gate", "merge_results", "path_b", RoutingMode::Copy);
    builder.add_edge("merge_results", "sink_default", "continue", RoutingMode::Move);
    builder.register_sink("default", "sink_default");
    builder.register_config_gate("fork_gate", "fork_gate");
    builder.set_output_sink("default");

    let gate = GateSettings { name: "fork_gate".to_string(),
                              condition: "True".to_string(),
                              routes: [("true".to_string(), "fork".to_string()),
                                       ("false".to_string(), "continue".to_string())]
                                  .into_iter()
                                  .collect(),
                              fork_to: vec!["path_a".to_string(), "path_b".to_string()] };
    let graph = builder.finish(std::slice::from_ref(&gate)).expect("valid graph");

    let coalesce = CoalesceSettings { name: "merge_results".to_string(),
                                      branches: vec!["path_a".to_string(),
                                                     "path_b".to_string()],
                                      policy: CoalescePolicy::RequireAll,
                                      merge: MergeStrategy::Union,
                                      timeout_seconds: None,
                                      quorum_count: None,
                                      primary_branch: None,
                                      select_branch: None };

    let config = PipelineConfig { source: Box::new(StaticSource::new(vec![
                                      json!({"text": "ACME earnings"}),
                                  ])),
                                  steps: Vec::new(),
                                  sinks,
                                  config_gates: vec![gate],
                                  aggregations: HashMap::new(),
                                  coalesce: vec![coalesce],
                                  retry: None };

    let mut orchestrator = Orchestrator::new(&recorder, &spans);
    let summary = orchestrator.run(config, &graph).expect("run completes");

    assert_eq!(summary.status, RunStatus::Completed);
    let rows = delivered.lock().unwrap();
    assert_eq!(rows.len(), 1, "exactly one merged row reaches the sink");
    assert_eq!(rows[0]["text"], json!("ACME earnings"));
    drop(rows);

    // parent FORKED + 2 COALESCED + merged COMPLETED = 4 tokens.
    let tokens = recorder.get_tokens_for_run(&summary.run_id).unwrap();
    assert_eq!(tokens.len(), 4);
    let coalesced = tokens.iter()
                          .filter(|t| {
                              recorder.get_token_outcome(&t.token_id)
                                      .unwrap()
                                      .map(|o| o.outcome == RowOutcome::Coalesced)
                                      .unwrap_or(false)
                          })
                          .count();
    assert_eq!(coalesced, 2);
}

#[test]
fn aggregation_count_batches_and_sums() {
    // S4-shaped: count=3 transform-mode aggregation over 10/20/30 produces
    // a single {"total": 60} delivery and consumes all inputs.
    let recorder = Recorder::new(MemoryStore::new());
    let spans = SpanFactory::noop();

    let sink = CollectSink::new("default");
    let delivered = sink.handle();
    let mut sinks: BTreeMap<String, Box<dyn cauce_core::SinkPlugin>> = BTreeMap::new();
    sinks.insert("default".to_string(), Box::new(sink));

    let mut builder = ExecutionGraph::builder();
    builder.add_node("source", NodeKind::Source, "static");
    builder.add_node("transform_0", NodeKind::Aggregation, "batch_sum");
    builder.add_node("sink_default", NodeKind::Sink, "default");
    builder.add_edge("source", "transform_0", "continue", RoutingMode::Move);
    builder.add_edge("transform_0", "sink_default", "continue", RoutingMode::Move);
    builder.register_sink("default", "sink_default");
    builder.push_transform_id("transform_0");
    builder.set_output_sink("default");
    let graph = builder.finish(&[]).expect("valid graph");

    let mut aggregations = HashMap::new();
    aggregations.insert("batch_sum".to_string(),
                        AggregationSettings { name: "batch_sum".to_string(),
                                              trigger: TriggerConfig::by_count(3),
                                              mode: AggregationMode::Transform });

    let config = PipelineConfig { source: Box::new(StaticSource::new(vec![
                                      json!({"value": 10}),
                                      json!({"value": 20}),
                                      json!({"value": 30}),
                                  ])),
                                  steps: vec![PipelineStep::Transform(Box::new(
                                      BatchSum::new("value"),
                                  ))],
                                  sinks,
                                  config_gates: Vec::new(),
                                  aggregations,
                                  coalesce: Vec::new(),
                                  retry: None };

    let mut orchestrator = Orchestrator::new(&recorder, &spans);
    let summary = orchestrator.run(config, &graph).expect("run completes");

    assert_eq!(summary.status, RunStatus::Completed);
    let rows = delivered.lock().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["total"], json!(60));
    drop(rows);

    // The three inputs are CONSUMED_IN_BATCH and appear as batch members.
    let tokens = recorder.get_tokens_for_run(&summary.run_id).unwrap();
    assert_eq!(tokens.len(), 4, "3 inputs + 1 batch output");
    let consumed: Vec<_> =
        tokens.iter()
              .filter(|t| {
                  recorder.get_token_outcome(&t.token_id)
                          .unwrap()
                          .map(|o| o.outcome == RowOutcome::ConsumedInBatch)
                          .unwrap_or(false)
              })
              .collect();
    assert_eq!(consumed.len(), 3);
}

#[test]
fn error_routing_delivers_rejects_to_named_sink() {
    // scale(x2) then validate >= 0 routing failures to "rejects": good rows
    // land in default, bad ones in rejects, with ROUTED outcomes.
    let recorder = Recorder::new(MemoryStore::new());
    let spans = SpanFactory::noop();

    let ok_sink = CollectSink::new("default");
    let ok_rows = ok_sink.handle();
    let reject_sink = CollectSink::new("rejects");
    let reject_rows = reject_sink.handle();
    let mut sinks: BTreeMap<String, Box<dyn cauce_core::SinkPlugin>> = BTreeMap::new();
    sinks.insert("default".to_string(), Box::new(ok_sink));
    sinks.insert("rejects".to_string(), Box::new(reject_sink));

    let mut builder = ExecutionGraph::builder();
    builder.add_node("source", NodeKind::Source, "static");
    builder.add_node("transform_0", NodeKind::Transform, "scale");
    builder.add_node("transform_1", NodeKind::Transform, "range_validator");
    builder.add_node("sink_default", NodeKind::Sink, "default");
    builder.add_node("sink_rejects", NodeKind::Sink, "rejects");
    builder.add_edge("source", "transform_0", "continue", RoutingMode::Move);
    builder.add_edge("transform_0", "transform_1", "continue", RoutingMode::Move);
    builder.add_edge("transform_1", "sink_default", "continue", RoutingMode::Move);
    builder.register_sink("default", "sink_default");
    builder.register_sink("rejects", "sink_rejects");
    builder.push_transform_id("transform_0");
    builder.push_transform_id("transform_1");
    builder.set_output_sink("default");
    let graph = builder.finish(&[]).expect("valid graph");

    let config = PipelineConfig { source: Box::new(StaticSource::new(vec![
                                      json!({"value": 4}),
                                      json!({"value": -2}),
                                      json!({"value": 1}),
                                  ])),
                                  steps: vec![
                                      PipelineStep::Transform(Box::new(Scale::new("value",
                                                                                  2.0))),
                                      PipelineStep::Transform(Box::new(
                                          RangeValidator::new("value", 0.0)
                                              .routing_to("rejects"),
                                      )),
                                  ],
                                  sinks,
                                  config_gates: Vec::new(),
                                  aggregations: HashMap::new(),
                                  coalesce: Vec::new(),
                                  retry: None };

    let mut orchestrator = Orchestrator::new(&recorder, &spans);
    let summary = orchestrator.run(config, &graph).expect("run completes");

    assert_eq!(summary.rows_succeeded, 2);
    assert_eq!(summary.rows_routed, 1);
    assert_eq!(ok_rows.lock().unwrap().len(), 2);
    assert_eq!(reject_rows.lock().unwrap().len(), 1);
    assert_eq!(reject_rows.lock().unwrap()[0]["value"], json!(-4));

    // The routed token's trail: transform_error + ROUTED outcome + artifact
    // in the rejects sink.
    let tokens = recorder.get_tokens_for_run(&summary.run_id).unwrap();
    let routed: Vec<_> = tokens.iter()
                               .filter(|t| {
                                   recorder.get_token_outcome(&t.token_id)
                                           .unwrap()
                                           .map(|o| o.outcome == RowOutcome::Routed)
                                           .unwrap_or(false)
                               })
                               .collect();
    assert_eq!(routed.len(), 1);
    let errors = recorder.get_transform_errors_for_token(&routed[0].token_id).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].destination, "rejects");
}
