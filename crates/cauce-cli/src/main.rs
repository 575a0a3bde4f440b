//! cauce-cli: demo mínima del runtime contra el ledger en memoria.
//!
//! Corre un pipeline lineal (scale → validate → sink), imprime el resumen
//! del run y el lineage de un token para mostrar el producto primario: el
//! audit trail consultable. Para el ledger Postgres, ver el binario raíz.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use cauce_adapters::{CollectSink, RangeValidator, Scale, StaticSource};
use cauce_core::{
    ExecutionGraph, MemoryStore, NodeKind, Orchestrator, PipelineConfig, PipelineStep, Recorder,
    RoutingMode, SpanFactory,
};

fn main() {
    println!("cauce demo");
    println!("==========");

    let recorder = Recorder::new(MemoryStore::new());
    let spans = SpanFactory::noop();

    let source = StaticSource::new(vec![
        json!({"value": 10}),
        json!({"value": -3}),
        json!({"value": 20}),
    ]);
    let collect = CollectSink::new("default");
    let collected = collect.handle();
    let quarantine = CollectSink::new("rejects");

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
    let graph = match builder.finish(&[]) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("invalid pipeline: {e}");
            std::process::exit(2);
        }
    };

    let mut sinks: BTreeMap<String, Box<dyn cauce_core::SinkPlugin>> = BTreeMap::new();
    sinks.insert("default".to_string(), Box::new(collect));
    sinks.insert("rejects".to_string(), Box::new(quarantine));

    let config = PipelineConfig {
        source: Box::new(source),
        steps: vec![
            PipelineStep::Transform(Box::new(Scale::new("value", 2.0))),
            PipelineStep::Transform(Box::new(RangeValidator::new("value", 0.0).routing_to("rejects"))),
        ],
        sinks,
        config_gates: Vec::new(),
        aggregations: HashMap::new(),
        coalesce: Vec::new(),
        retry: None,
    };

    let mut orchestrator = Orchestrator::new(&recorder, &spans);
    match orchestrator.run(config, &graph) {
        Ok(summary) => {
            println!("run {} -> {:?}", summary.run_id, summary.status);
            println!("  processed:   {}", summary.rows_processed);
            println!("  succeeded:   {}", summary.rows_succeeded);
            println!("  routed:      {}", summary.rows_routed);
            println!("  quarantined: {}", summary.rows_quarantined);
            println!("  artifacts:   {}", summary.artifacts);
            println!("  delivered:   {:?}", collected.lock().unwrap());

            // El producto primario: explicar qué le pasó a un token.
            if let Ok(rows) = recorder.get_rows(&summary.run_id) {
                if let Some(row) = rows.first() {
                    if let Ok(tokens) = recorder.get_tokens(&row.row_id) {
                        if let Some(token) = tokens.first() {
                            match recorder.explain(&summary.run_id, &token.token_id) {
                                Ok(lineage) => println!(
                                    "lineage of token {}: {} node states, outcome {:?}",
                                    token.token_id,
                                    lineage.node_states.len(),
                                    lineage.outcome.map(|o| o.outcome)
                                ),
                                Err(e) => eprintln!("explain failed: {e}"),
                            }
                        }
                    }
                }
            }
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(1);
        }
    }
}
