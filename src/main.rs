//! Binario raíz: demo del runtime con ledger en memoria o Postgres.
//!
//! Con la feature `pg_demo` y `DATABASE_URL` definida, el mismo pipeline
//! corre contra el ledger Postgres (migraciones incluidas) y el lineage se
//! consulta desde la base. Sin la feature, usa el backend en memoria.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use cauce_adapters::{BatchSum, CollectSink, Scale, StaticSource};
use cauce_core::{
    AggregationMode, AggregationSettings, ExecutionGraph, NodeKind, Orchestrator,
    PipelineConfig, PipelineStep, Recorder, RoutingMode, SpanFactory, TriggerConfig,
};

fn demo_config() -> (PipelineConfig, ExecutionGraph, std::sync::Arc<std::sync::Mutex<Vec<serde_json::Value>>>) {
    let source = StaticSource::new(vec![
        json!({"value": 10}),
        json!({"value": 20}),
        json!({"value": 30}),
    ]);
    let collect = CollectSink::new("default");
    let handle = collect.handle();

    let mut builder = ExecutionGraph::builder();
    builder.add_node("source", NodeKind::Source, "static");
    builder.add_node("transform_0", NodeKind::Transform, "scale");
    builder.add_node("transform_1", NodeKind::Aggregation, "batch_sum");
    builder.add_node("sink_default", NodeKind::Sink, "default");
    builder.add_edge("source", "transform_0", "continue", RoutingMode::Move);
    builder.add_edge("transform_0", "transform_1", "continue", RoutingMode::Move);
    builder.add_edge("transform_1", "sink_default", "continue", RoutingMode::Move);
    builder.register_sink("default", "sink_default");
    builder.push_transform_id("transform_0");
    builder.push_transform_id("transform_1");
    builder.set_output_sink("default");
    let graph = builder.finish(&[]).expect("demo graph is valid");

    let mut sinks: BTreeMap<String, Box<dyn cauce_core::SinkPlugin>> = BTreeMap::new();
    sinks.insert("default".to_string(), Box::new(collect));

    let mut aggregations = HashMap::new();
    aggregations.insert("batch_sum".to_string(),
                        AggregationSettings { name: "batch_sum".to_string(),
                                              trigger: TriggerConfig::by_count(3),
                                              mode: AggregationMode::Transform });

    let config = PipelineConfig { source: Box::new(source),
                                  steps: vec![
                                      PipelineStep::Transform(Box::new(Scale::new("value", 2.0))),
                                      PipelineStep::Transform(Box::new(BatchSum::new("value"))),
                                  ],
                                  sinks,
                                  config_gates: Vec::new(),
                                  aggregations,
                                  coalesce: Vec::new(),
                                  retry: None };
    (config, graph, handle)
}

fn report<S: cauce_core::AuditStore>(recorder: &Recorder<S>, summary: &cauce_core::RunSummary) {
    println!("run {} -> {:?}", summary.run_id, summary.status);
    println!("  processed: {}  succeeded: {}  artifacts: {}",
             summary.rows_processed, summary.rows_succeeded, summary.artifacts);
    if let Ok(tokens) = recorder.get_tokens_for_run(&summary.run_id) {
        println!("  tokens created: {}", tokens.len());
        for token in tokens {
            if let Ok(Some(outcome)) = recorder.get_token_outcome(&token.token_id) {
                println!("    {} -> {}", token.token_id, outcome.outcome.as_str());
            }
        }
    }
}

#[cfg(feature = "pg_demo")]
fn run_demo() {
    use cauce_persistence::PgStore;

    let store = PgStore::from_env().expect("DATABASE_URL debe apuntar a un Postgres accesible");
    let recorder = Recorder::new(store);
    let spans = SpanFactory::noop();
    let (config, graph, handle) = demo_config();
    let mut orchestrator = Orchestrator::new(&recorder, &spans);
    match orchestrator.run(config, &graph) {
        Ok(summary) => {
            report(&recorder, &summary);
            println!("  delivered: {:?}", handle.lock().unwrap());
        }
        Err(e) => eprintln!("run failed: {e}"),
    }
}

#[cfg(not(feature = "pg_demo"))]
fn run_demo() {
    use cauce_core::MemoryStore;

    let recorder = Recorder::new(MemoryStore::new());
    let spans = SpanFactory::noop();
    let (config, graph, handle) = demo_config();
    let mut orchestrator = Orchestrator::new(&recorder, &spans);
    match orchestrator.run(config, &graph) {
        Ok(summary) => {
            report(&recorder, &summary);
            println!("  delivered: {:?}", handle.lock().unwrap());
        }
        Err(e) => eprintln!("run failed: {e}"),
    }
}

fn main() {
    dotenvy::dotenv().ok();
    run_demo();
}
