//! Orquestador: conduce el source, el procesador y los sinks.
//!
//! Responsabilidades:
//! - registrar el grafo en el ledger y ligar plugins a sus node_id físicos;
//! - validación preflight de rutas (el run nunca arranca con un DAG roto);
//! - por cada fila: procesar, agrupar resultados por sink destino, escribir
//!   el cohort y SOLO ENTONCES escribir los COMPLETED (artifact primero);
//! - flush de fin de source, barrido de timeouts de coalesce, checkpoint
//!   tras cada escritura durable;
//! - ciclo de vida de plugins (on_start / on_complete / close) y transición
//!   del run a su estado terminal exactamente una vez;
//! - emitir exactamente un `PhaseError` por run fallido, atribuido a la fase
//!   (SOURCE | PROCESS | SINK) que levantó el primer error fatal.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::checkpoint::CheckpointManager;
use crate::clock::Clock;
use crate::contracts::{
    error_edge_label, CoalesceSettings, EdgeId, ErrorDisposition, GateSettings, NodeId,
    NodeKind, PipelineStep, PluginContext, RetrySettings, RoutingMode, RowOutcome, RowResult,
    RunStatus, SinkPlugin, SourcePlugin, SourceRow,
};
use crate::dag::ExecutionGraph;
use crate::errors::EngineError;
use crate::events::{EventBus, PhaseError, PipelineEvent, PipelinePhase};
use crate::executors::SinkExecutor;
use crate::hashing::hash_value;
use crate::processor::RowProcessor;
use crate::recorder::{AuditStore, OutcomeDetail, Recorder};
use crate::spans::SpanFactory;

/// Configuración de un pipeline: instancias de plugin + settings.
pub struct PipelineConfig {
    pub source: Box<dyn SourcePlugin>,
    pub steps: Vec<PipelineStep>,
    pub sinks: BTreeMap<String, Box<dyn SinkPlugin>>,
    pub config_gates: Vec<GateSettings>,
    /// Settings de agregación por NOMBRE de transform (el orquestador los
    /// reclava por node_id físico al registrar).
    pub aggregations: HashMap<String, crate::contracts::AggregationSettings>,
    pub coalesce: Vec<CoalesceSettings>,
    pub retry: Option<RetrySettings>,
}

/// Señal de cancelación a nivel de run, chequeada entre filas.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Resumen contable del run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub rows_processed: usize,
    pub rows_succeeded: usize,
    pub rows_routed: usize,
    pub rows_quarantined: usize,
    pub rows_failed: usize,
    pub rows_forked: usize,
    pub artifacts: usize,
}

pub struct Orchestrator<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    spans: &'a SpanFactory,
    events: EventBus,
    cancel: CancelToken,
    checkpoints: Option<CheckpointManager>,
    clock: Option<Arc<dyn Clock>>,
    canonical_version: String,
    phase_error_emitted: Cell<bool>,
}

impl<'a, S: AuditStore> Orchestrator<'a, S> {
    pub fn new(recorder: &'a Recorder<S>, spans: &'a SpanFactory) -> Self {
        Self { recorder,
               spans,
               events: EventBus::new(),
               cancel: CancelToken::new(),
               checkpoints: None,
               clock: None,
               canonical_version: "v1".to_string(),
               phase_error_emitted: Cell::new(false) }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Ejecuta el pipeline completo. Un error en cualquier fase deja el run
    /// FAILED con su PhaseError; el lineage parcial escrito sobrevive.
    pub fn run(&mut self,
               mut config: PipelineConfig,
               graph: &ExecutionGraph)
               -> Result<RunSummary, EngineError> {
        let config_snapshot = json!({
            "engine_version": crate::constants::ENGINE_VERSION,
            "source": config.source.name(),
            "steps": config.steps.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            "sinks": config.sinks.keys().cloned().collect::<Vec<_>>(),
            "output_sink": graph.output_sink(),
        });
        let run = self.recorder.begin_run(config_snapshot, &self.canonical_version)?;
        self.events.emit(&PipelineEvent::RunStarted { run_id: run.run_id.clone() });
        self.phase_error_emitted.set(false);

        let result = self.run_phases(&run.run_id, &mut config, graph);
        if let Err(err) = &result {
            // Red de seguridad: todo run fallido lleva exactamente UN
            // PhaseError; los caminos sin atribución propia caen en PROCESS.
            self.emit_phase_error(PipelinePhase::Process, err);
        }

        let (status, failed) = match &result {
            Ok(_) => (RunStatus::Completed, false),
            Err(_) => (RunStatus::Failed, true),
        };
        self.recorder.complete_run(&run.run_id, status)?;
        self.events.emit(&PipelineEvent::RunCompleted { run_id: run.run_id.clone(), failed });

        // Cierre de plugins pase lo que pase: los recursos no se filtran.
        config.source.close();
        for sink in config.sinks.values_mut() {
            sink.close();
        }

        result.map(|mut summary| {
            summary.run_id = run.run_id;
            summary.status = status;
            summary
        })
    }

    fn emit_phase_error(&self, phase: PipelinePhase, error: &EngineError) {
        if self.phase_error_emitted.replace(true) {
            return;
        }
        log::error!("pipeline {phase} phase failed ({:?}): {error}",
                    crate::errors::classify_error(error));
        self.events.emit(&PipelineEvent::PhaseError(PhaseError {
            phase,
            error: error.to_string(),
        }));
    }

    fn run_phases(&mut self,
                  run_id: &str,
                  config: &mut PipelineConfig,
                  graph: &ExecutionGraph)
                  -> Result<RunSummary, EngineError> {
        // Registro del grafo + binding. Errores acá son de configuración y
        // se atribuyen a PROCESS (el run ya existe y debe quedar FAILED).
        let binding = match self.register_graph(run_id, config, graph) {
            Ok(binding) => binding,
            Err(err) => {
                self.emit_phase_error(PipelinePhase::Process, &err);
                return Err(err);
            }
        };

        let ctx = PluginContext::new(run_id, Value::Null);

        // -- fase SOURCE ---------------------------------------------------
        let source_rows = match self.load_source(config, &ctx) {
            Ok(rows) => rows,
            Err(err) => {
                self.emit_phase_error(PipelinePhase::Source, &err);
                return Err(err);
            }
        };

        // -- fases PROCESS / SINK por fila ---------------------------------
        let mut processor = self.build_processor(run_id, config, graph, &binding);
        if let Some(checkpoints) = &self.checkpoints {
            if let Some(state) = checkpoints.load()? {
                processor.aggregation_mut().restore_from_checkpoint(&state)?;
            }
        }

        let mut summary = RunSummary::default();
        let sink_executor = SinkExecutor::new(self.recorder, self.spans, run_id);
        let sink_step = config.steps.len() + config.config_gates.len() + 1;

        for (row_index, source_row) in source_rows.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                let err = EngineError::Cancelled;
                processor.aggregation_mut().fail_open_batches("run_cancelled")?;
                self.emit_phase_error(PipelinePhase::Process, &err);
                return Err(err);
            }

            summary.rows_processed += 1;
            let results = match source_row {
                SourceRow::Invalid { reason } => {
                    self.quarantine_invalid_row(run_id, &binding, row_index, &reason)?;
                    summary.rows_quarantined += 1;
                    continue;
                }
                SourceRow::Valid(data) => {
                    match processor.process_row(row_index, data, &mut config.steps, &ctx) {
                        Ok(results) => results,
                        Err(err) => {
                            self.emit_phase_error(PipelinePhase::Process, &err);
                            return Err(err);
                        }
                    }
                }
            };

            self.deliver_results(&results,
                                 config,
                                 graph,
                                 &sink_executor,
                                 sink_step,
                                 &ctx,
                                 &mut summary)?;
            self.checkpoint_after_write(run_id, &processor)?;
        }

        // -- fin de source: flush de agregaciones y timeouts de coalesce ---
        let tail_results = match self.drain_tail(&mut processor, config, &ctx) {
            Ok(results) => results,
            Err(err) => {
                self.emit_phase_error(PipelinePhase::Process, &err);
                return Err(err);
            }
        };
        self.deliver_results(&tail_results,
                             config,
                             graph,
                             &sink_executor,
                             sink_step,
                             &ctx,
                             &mut summary)?;
        self.checkpoint_after_write(run_id, &processor)?;

        // -- cierre ordenado de plugins -------------------------------------
        if let Err(err) = self.complete_plugins(config, &ctx) {
            self.emit_phase_error(PipelinePhase::Sink, &err);
            return Err(err);
        }

        summary.artifacts = self.recorder.get_artifacts(run_id)?.len();
        Ok(summary)
    }

    fn load_source(&self,
                   config: &mut PipelineConfig,
                   ctx: &PluginContext)
                   -> Result<Vec<SourceRow>, EngineError> {
        let _span = self.spans.start("phase:source");
        config.source
              .on_start(ctx)
              .map_err(|e| EngineError::PluginFailure { node_id: "source".to_string(),
                                                        message: e.message,
                                                        retryable: e.retryable })?;
        let rows = config.source
                         .load(ctx)
                         .map_err(|e| EngineError::PluginFailure {
                             node_id: "source".to_string(),
                             message: e.message,
                             retryable: e.retryable,
                         })?;
        log::debug!("source yielded {} rows", rows.len());
        Ok(rows)
    }

    fn drain_tail(&self,
                  processor: &mut RowProcessor<'a, S>,
                  config: &mut PipelineConfig,
                  ctx: &PluginContext)
                  -> Result<Vec<RowResult>, EngineError> {
        let mut results = processor.flush_open_aggregations(&mut config.steps, ctx)?;
        results.extend(processor.sweep_coalesce_timeouts(&mut config.steps, ctx)?);
        Ok(results)
    }

    /// Entrega un lote de resultados a sus sinks, por cohort de fila:
    /// COMPLETED → sink de salida del DAG; ROUTED → su sink nombrado. El
    /// COMPLETED de cada token se escribe DESPUÉS del artifact de su cohort.
    #[allow(clippy::too_many_arguments)]
    fn deliver_results(&self,
                       results: &[RowResult],
                       config: &mut PipelineConfig,
                       graph: &ExecutionGraph,
                       sink_executor: &SinkExecutor<'a, S>,
                       sink_step: usize,
                       ctx: &PluginContext,
                       summary: &mut RunSummary)
                       -> Result<(), EngineError> {
        let mut cohorts: BTreeMap<String, Vec<&RowResult>> = BTreeMap::new();
        for result in results {
            match result.outcome {
                RowOutcome::Completed => {
                    cohorts.entry(graph.output_sink().to_string()).or_default().push(result);
                    summary.rows_succeeded += 1;
                }
                RowOutcome::Routed => {
                    summary.rows_routed += 1;
                    if let Some(sink) = &result.sink_name {
                        if sink != "discard" {
                            cohorts.entry(sink.clone()).or_default().push(result);
                        }
                    }
                }
                RowOutcome::Quarantined => summary.rows_quarantined += 1,
                RowOutcome::Failed => summary.rows_failed += 1,
                RowOutcome::Forked => summary.rows_forked += 1,
                // Buffered / ConsumedInBatch / demás: informativos, sin
                // entrega a sink en este cohort.
                _ => {}
            }
        }

        for (sink_name, cohort) in cohorts {
            let Some(sink) = config.sinks.get_mut(&sink_name) else {
                return Err(EngineError::RouteValidation(format!(
                    "results routed to unknown sink {sink_name:?}"
                )));
            };
            let tokens: Vec<crate::tokens::TokenInfo> =
                cohort.iter().map(|r| r.token.clone()).collect();
            let write = sink_executor.write(sink.as_mut(), &tokens, ctx, sink_step);
            let _artifact = match write {
                Ok(artifact) => artifact,
                Err(err) => {
                    self.emit_phase_error(PipelinePhase::Sink, &err);
                    return Err(err);
                }
            };
            debug_assert!(_artifact.is_some(), "non-empty cohort produces an artifact");

            // Artifact registrado: ahora sí los COMPLETED del cohort.
            for result in cohort {
                if result.outcome == RowOutcome::Completed {
                    self.recorder.record_terminal_outcome(result.token_id(),
                                                          RowOutcome::Completed,
                                                          OutcomeDetail::sink(
                                                              sink_name.clone(),
                                                          ))?;
                }
            }
        }
        Ok(())
    }

    fn checkpoint_after_write(&self,
                              run_id: &str,
                              processor: &RowProcessor<'a, S>)
                              -> Result<(), EngineError> {
        if let Some(checkpoints) = &self.checkpoints {
            // Frontera durable: el sink ya escribió este cohort.
            checkpoints.save(run_id, &processor.aggregation().get_checkpoint_state())?;
        }
        Ok(())
    }

    fn complete_plugins(&self,
                        config: &mut PipelineConfig,
                        ctx: &PluginContext)
                        -> Result<(), EngineError> {
        config.source
              .on_complete(ctx)
              .map_err(|e| EngineError::PluginFailure { node_id: "source".to_string(),
                                                        message: e.message,
                                                        retryable: false })?;
        for (name, sink) in config.sinks.iter_mut() {
            sink.on_complete(ctx)
                .map_err(|e| EngineError::PluginFailure { node_id: name.clone(),
                                                          message: e.message,
                                                          retryable: false })?;
        }
        Ok(())
    }

    fn quarantine_invalid_row(&self,
                              run_id: &str,
                              binding: &GraphBinding,
                              row_index: usize,
                              reason: &Value)
                              -> Result<(), EngineError> {
        // Las filas inválidas también dejan traza: fila + token + outcome
        // QUARANTINED con el hash de la razón. `explain` es total sobre todo
        // lo que el source emitió.
        let row = self.recorder.create_row(run_id,
                                           &binding.source_node_id,
                                           row_index,
                                           json!({ "invalid_reason": reason }),
                                           None)?;
        let token = self.recorder
                        .create_token(&row.row_id, None, None, None, None, None, &[])?;
        self.recorder.record_terminal_outcome(&token.token_id,
                                              RowOutcome::Quarantined,
                                              OutcomeDetail::error(hash_value(reason)))?;
        Ok(())
    }

    // -- registro del grafo -------------------------------------------------

    fn register_graph(&self,
                      run_id: &str,
                      config: &mut PipelineConfig,
                      graph: &ExecutionGraph)
                      -> Result<GraphBinding, EngineError> {
        let mut logical_to_physical: HashMap<String, NodeId> = HashMap::new();
        let mut source_node_id = String::new();

        for node in graph.nodes() {
            let schema = crate::contracts::SchemaConfig::dynamic();
            let record = self.recorder.register_node(run_id,
                                                     &node.plugin_name,
                                                     node.kind,
                                                     "1.0",
                                                     Value::Null,
                                                     &schema)?;
            if node.kind == NodeKind::Source {
                source_node_id = record.node_id.clone();
            }
            logical_to_physical.insert(node.node_id.clone(), record.node_id);
        }

        // Binding de plugins a sus node_id físicos, por posición de paso.
        for (i, step) in config.steps.iter_mut().enumerate() {
            let logical = graph.transform_ids()
                               .get(i)
                               .ok_or_else(|| EngineError::RouteValidation(format!(
                                   "graph has no transform id for step {i}"
                               )))?;
            let physical = logical_to_physical[logical].clone();
            match step {
                PipelineStep::Transform(t) => t.bind_node_id(physical),
                PipelineStep::Gate(g) => g.bind_node_id(physical),
            }
        }
        for (sink_name, sink) in config.sinks.iter_mut() {
            if let Some(logical) = graph.sink_ids().get(sink_name) {
                sink.bind_node_id(logical_to_physical[logical].clone());
            }
        }

        // Edges físicos + mapas de lookup por node_id físico.
        let mut edge_map: HashMap<(NodeId, String), EdgeId> = HashMap::new();
        for edge in graph.edges() {
            let from = logical_to_physical[&edge.from].clone();
            let to = logical_to_physical[&edge.to].clone();
            let record = self.recorder
                             .register_edge(run_id, &from, &to, &edge.label, edge.mode)?;
            edge_map.insert((from, edge.label.clone()), record.edge_id);
        }

        // Edges DIVERT de on_error por transform que los declare.
        for step in &config.steps {
            let PipelineStep::Transform(t) = step else { continue };
            let Some(ErrorDisposition::Sink(sink_name)) = t.on_error() else { continue };
            let Some(node_id) = t.node_id().map(str::to_string) else { continue };
            let sink_logical = graph.sink_ids().get(&sink_name).ok_or_else(|| {
                EngineError::RouteValidation(format!(
                    "transform {} routes errors to unknown sink {sink_name:?}",
                    t.name()
                ))
            })?;
            let sink_physical = logical_to_physical[sink_logical].clone();
            let max_attempts = config.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1);
            for attempt in 0..max_attempts.max(1) {
                let label = error_edge_label(attempt);
                let record = self.recorder.register_edge(run_id,
                                                         &node_id,
                                                         &sink_physical,
                                                         &label,
                                                         RoutingMode::Divert)?;
                edge_map.insert((node_id.clone(), label), record.edge_id);
            }
        }

        let mut route_resolution: HashMap<(NodeId, String), String> = HashMap::new();
        let mut config_gate_ids: HashMap<String, NodeId> = HashMap::new();
        for gate in &config.config_gates {
            let logical = graph.config_gate_id(&gate.name).ok_or_else(|| {
                EngineError::RouteValidation(format!(
                    "config gate {} has no node in the graph", gate.name
                ))
            })?;
            let physical = logical_to_physical[logical].clone();
            for (label, target) in &gate.routes {
                if target != "continue" && target != "fork" {
                    route_resolution.insert((physical.clone(), label.clone()), target.clone());
                }
            }
            config_gate_ids.insert(gate.name.clone(), physical);
        }

        // Los mapas lógicos del grafo también valen con ids físicos.
        for edge in graph.edges() {
            let from_physical = logical_to_physical[&edge.from].clone();
            if let Some(sink) = graph.route_resolution(&edge.from, &edge.label) {
                route_resolution.insert((from_physical, edge.label.clone()),
                                        sink.to_string());
            }
        }

        if source_node_id.is_empty() {
            return Err(EngineError::RouteValidation(
                "graph registered no source node".to_string(),
            ));
        }

        Ok(GraphBinding { source_node_id,
                          edge_map,
                          route_resolution,
                          config_gate_ids,
                          logical_to_physical })
    }

    fn build_processor(&self,
                       run_id: &str,
                       config: &PipelineConfig,
                       graph: &ExecutionGraph,
                       binding: &GraphBinding)
                       -> RowProcessor<'a, S> {
        // Settings de agregación reclavados por node_id físico.
        let mut aggregation_settings = HashMap::new();
        for step in &config.steps {
            if let Some(node_id) = step.node_id() {
                if let Some(settings) = config.aggregations.get(step.name()) {
                    aggregation_settings.insert(node_id.to_string(), settings.clone());
                }
            }
        }

        let mut builder = RowProcessor::builder(self.recorder,
                                                self.spans,
                                                run_id,
                                                &binding.source_node_id)
                                       .edge_map(binding.edge_map.clone())
                                       .route_resolution(binding.route_resolution.clone())
                                       .config_gates(config.config_gates.clone(),
                                                     binding.config_gate_ids.clone())
                                       .aggregation_settings(aggregation_settings);
        for settings in &config.coalesce {
            // Nodo del coalesce: si el grafo tiene uno registrado con su
            // nombre, se usa; si no, el coalesce ancla en el source (los
            // node_states del merge necesitan un nodo real).
            let node_id = binding.logical_to_physical
                                 .get(&settings.name)
                                 .cloned()
                                 .unwrap_or_else(|| binding.source_node_id.clone());
            builder = builder.coalesce(settings.clone(), node_id, None);
        }
        if let Some(retry) = &config.retry {
            builder = builder.retry(retry.clone());
        }
        if let Some(clock) = &self.clock {
            builder = builder.clock(Arc::clone(clock));
        }
        builder.build()
    }
}

struct GraphBinding {
    source_node_id: NodeId,
    edge_map: HashMap<(NodeId, String), EdgeId>,
    route_resolution: HashMap<(NodeId, String), String>,
    config_gate_ids: HashMap<String, NodeId>,
    logical_to_physical: HashMap<String, NodeId>,
}
