//! RowProcessor: la máquina de estados por fila.
//!
//! Consume una fila del source por vez y conduce su(s) token(s) por una work
//! queue FIFO de pasos del pipeline: transforms y gates plugin en orden,
//! config gates después del último paso, puntos de coalesce intercalados por
//! rama. Emite un `RowResult` por token terminal.
//!
//! Garantías:
//! - exactamente un outcome terminal por token (el ledger lo refuerza con
//!   insert condicional; acá nadie escribe dos veces);
//! - la queue está acotada por `MAX_WORK_QUEUE_ITERATIONS`: superarla es
//!   violación de invariante, no un hang silencioso;
//! - los reintentos dejan un node_state por intento (0, 1, 2, ...).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::coalesce::CoalesceExecutor;
use crate::constants::MAX_WORK_QUEUE_ITERATIONS;
use crate::contracts::{
    error_edge_label, AggregationSettings, CoalesceName, CoalesceSettings, EdgeId,
    ErrorDisposition, GateSettings, NodeId, PipelineStep, PluginContext, RetrySettings,
    RoutingMode, RowOutcome, RowResult,
};
use crate::errors::EngineError;
use crate::executors::{
    AggregationExecutor, GateExecutor, TransformExecutor, TransformOutcome,
};
use crate::hashing::hash_value;
use crate::recorder::{AuditStore, OutcomeDetail, Recorder};
use crate::retry::RetryManager;
use crate::spans::SpanFactory;
use crate::tokens::{TokenInfo, TokenManager};

/// Ítem de la work queue: un token listo para ejecutar desde `start_step`
/// (índice interno 0-based sobre pasos + config gates).
#[derive(Debug)]
struct WorkItem {
    token: TokenInfo,
    start_step: usize,
}

/// Builder del procesador (las piezas opcionales son muchas).
pub struct RowProcessorBuilder<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    spans: &'a SpanFactory,
    run_id: String,
    source_node_id: NodeId,
    edge_map: HashMap<(NodeId, String), EdgeId>,
    route_resolution: HashMap<(NodeId, String), String>,
    config_gates: Vec<GateSettings>,
    config_gate_ids: HashMap<String, NodeId>,
    aggregation_settings: HashMap<NodeId, AggregationSettings>,
    coalesce: Vec<(CoalesceSettings, NodeId, Option<usize>)>,
    retry: Option<RetrySettings>,
    clock: Arc<dyn Clock>,
}

impl<'a, S: AuditStore> RowProcessorBuilder<'a, S> {
    pub fn edge_map(mut self, edge_map: HashMap<(NodeId, String), EdgeId>) -> Self {
        self.edge_map = edge_map;
        self
    }

    pub fn route_resolution(mut self,
                            route_resolution: HashMap<(NodeId, String), String>)
                            -> Self {
        self.route_resolution = route_resolution;
        self
    }

    pub fn config_gates(mut self,
                        gates: Vec<GateSettings>,
                        gate_ids: HashMap<String, NodeId>)
                        -> Self {
        self.config_gates = gates;
        self.config_gate_ids = gate_ids;
        self
    }

    pub fn aggregation_settings(mut self,
                                settings: HashMap<NodeId, AggregationSettings>)
                                -> Self {
        self.aggregation_settings = settings;
        self
    }

    /// Registra un punto de coalesce. `entry_step` es el índice interno del
    /// paso ante el cual las ramas se retienen; None = después de todos.
    pub fn coalesce(mut self,
                    settings: CoalesceSettings,
                    node_id: impl Into<String>,
                    entry_step: Option<usize>)
                    -> Self {
        self.coalesce.push((settings, node_id.into(), entry_step));
        self
    }

    pub fn retry(mut self, settings: RetrySettings) -> Self {
        self.retry = Some(settings);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> RowProcessor<'a, S> {
        let aggregation = AggregationExecutor::new(self.recorder,
                                                   self.spans,
                                                   &self.run_id,
                                                   self.aggregation_settings,
                                                   Arc::clone(&self.clock));
        let mut coalesce_executor = CoalesceExecutor::new(self.recorder,
                                                          self.spans,
                                                          TokenManager::new(self.recorder),
                                                          Arc::clone(&self.clock));
        let mut coalesce_entry_steps = HashMap::new();
        for (settings, node_id, entry_step) in self.coalesce {
            if let Some(step) = entry_step {
                coalesce_entry_steps.insert(settings.name.clone(), step);
            }
            coalesce_executor.register_coalesce(settings, node_id);
        }
        RowProcessor { token_manager: TokenManager::new(self.recorder),
                       transform_executor: TransformExecutor::new(self.recorder,
                                                                  self.spans,
                                                                  &self.run_id,
                                                                  self.edge_map.clone()),
                       gate_executor: GateExecutor::new(self.recorder,
                                                        self.spans,
                                                        self.edge_map.clone(),
                                                        self.route_resolution),
                       aggregation,
                       coalesce: coalesce_executor,
                       coalesce_entry_steps,
                       retry_manager: self.retry.map(RetryManager::new),
                       recorder: self.recorder,
                       run_id: self.run_id,
                       source_node_id: self.source_node_id,
                       config_gates: self.config_gates,
                       config_gate_ids: self.config_gate_ids,
                       edge_map: self.edge_map }
    }
}

pub struct RowProcessor<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    run_id: String,
    source_node_id: NodeId,
    token_manager: TokenManager<'a, S>,
    transform_executor: TransformExecutor<'a, S>,
    gate_executor: GateExecutor<'a, S>,
    aggregation: AggregationExecutor<'a, S>,
    coalesce: CoalesceExecutor<'a, S>,
    coalesce_entry_steps: HashMap<CoalesceName, usize>,
    retry_manager: Option<RetryManager>,
    config_gates: Vec<GateSettings>,
    config_gate_ids: HashMap<String, NodeId>,
    edge_map: HashMap<(NodeId, String), EdgeId>,
}

enum StepDisposition {
    /// El token sigue al próximo paso con (posiblemente) datos nuevos.
    Advance(TokenInfo),
    /// El token terminó acá con un resultado.
    Terminal(RowResult),
    /// El token fue consumido (fork, expand, buffer); los sucesores ya
    /// están en la queue o vendrán con un flush posterior.
    Consumed,
}

impl<'a, S: AuditStore> RowProcessor<'a, S> {
    pub fn builder(recorder: &'a Recorder<S>,
                   spans: &'a SpanFactory,
                   run_id: &str,
                   source_node_id: &str)
                   -> RowProcessorBuilder<'a, S> {
        RowProcessorBuilder { recorder,
                              spans,
                              run_id: run_id.to_string(),
                              source_node_id: source_node_id.to_string(),
                              edge_map: HashMap::new(),
                              route_resolution: HashMap::new(),
                              config_gates: Vec::new(),
                              config_gate_ids: HashMap::new(),
                              aggregation_settings: HashMap::new(),
                              coalesce: Vec::new(),
                              retry: None,
                              clock: Arc::new(SystemClock::new()) }
    }

    pub fn aggregation(&self) -> &AggregationExecutor<'a, S> {
        &self.aggregation
    }

    pub fn aggregation_mut(&mut self) -> &mut AggregationExecutor<'a, S> {
        &mut self.aggregation
    }

    pub fn coalesce_executor_mut(&mut self) -> &mut CoalesceExecutor<'a, S> {
        &mut self.coalesce
    }

    /// Procesa una fila del source de punta a punta. Devuelve un RowResult
    /// por token que alcanzó un desenlace durante esta fila (los buffereados
    /// reaparecen al flushear).
    pub fn process_row(&mut self,
                       row_index: usize,
                       row_data: Value,
                       steps: &mut [PipelineStep],
                       ctx: &PluginContext)
                       -> Result<Vec<RowResult>, EngineError> {
        let mut results = Vec::new();

        // Muestreo de timeouts de agregación en cada llegada: un buffer con
        // timeout vencido flushea ANTES de admitir la fila nueva.
        self.flush_timed_out_aggregations(steps, ctx, &mut results)?;

        let token = self.token_manager.create_initial_token(&self.run_id,
                                                            &self.source_node_id,
                                                            row_index,
                                                            row_data)?;
        let mut queue = VecDeque::new();
        queue.push_back(WorkItem { token, start_step: 0 });
        self.run_queue(queue, steps, ctx, &mut results)?;
        Ok(results)
    }

    fn total_steps(&self, steps: &[PipelineStep]) -> usize {
        steps.len() + self.config_gates.len()
    }

    fn run_queue(&mut self,
                 mut queue: VecDeque<WorkItem>,
                 steps: &mut [PipelineStep],
                 ctx: &PluginContext,
                 results: &mut Vec<RowResult>)
                 -> Result<(), EngineError> {
        let total = self.total_steps(steps);
        let mut iterations = 0usize;

        while let Some(item) = queue.pop_front() {
            iterations += 1;
            if iterations > MAX_WORK_QUEUE_ITERATIONS {
                return Err(EngineError::InvariantViolation(format!(
                    "work queue exceeded {MAX_WORK_QUEUE_ITERATIONS} iterations for one \
                     source row; aborting a trapped loop"
                )));
            }

            let mut step = item.start_step;
            // `in_flight` queda None cuando el token terminó acá (terminal,
            // fork, buffer o coalesce); Some cuando alcanzó el final.
            let mut in_flight = Some(item.token);

            while step < total {
                let token = in_flight.take().expect("token present while stepping");
                if self.coalesce_entry_here(&token, step, total) {
                    self.submit_to_coalesce(&mut queue, results, token, step)?;
                    break;
                }

                let disposition = self.execute_step(&mut queue,
                                                    results,
                                                    steps,
                                                    ctx,
                                                    token,
                                                    step)?;
                match disposition {
                    StepDisposition::Advance(updated) => {
                        in_flight = Some(updated);
                        step += 1;
                    }
                    StepDisposition::Terminal(result) => {
                        results.push(result);
                        break;
                    }
                    StepDisposition::Consumed => break,
                }
            }

            if let Some(token) = in_flight.take() {
                if self.coalesce_entry_here(&token, total, total) {
                    self.submit_to_coalesce(&mut queue, results, token, total)?;
                } else {
                    // Completó el último paso sin rutear ni forkear: va al
                    // sink de salida del DAG (el orquestador resuelve cuál y
                    // escribe el COMPLETED tras el artifact).
                    results.push(RowResult::new(token, RowOutcome::Completed, None));
                }
            }
        }
        Ok(())
    }

    /// ¿Hay un punto de coalesce para la rama de este token en este paso?
    fn coalesce_entry_here(&self, token: &TokenInfo, step: usize, total: usize) -> bool {
        let Some(branch) = token.branch_name.as_deref() else {
            return false;
        };
        let Some(name) = self.coalesce.coalesce_for_branch(branch) else {
            return false;
        };
        let entry = self.coalesce_entry_steps.get(name).copied().unwrap_or(total);
        entry.min(total) == step
    }

    fn submit_to_coalesce(&mut self,
                          queue: &mut VecDeque<WorkItem>,
                          results: &mut Vec<RowResult>,
                          token: TokenInfo,
                          step: usize)
                          -> Result<(), EngineError> {
        let branch = token.branch_name.clone().unwrap_or_default();
        let name = self.coalesce
                       .coalesce_for_branch(&branch)
                       .expect("checked by coalesce_entry_here")
                       .to_string();
        let outcome = self.coalesce.accept(token, &name, step + 1)?;
        self.handle_coalesce_outcome(queue, results, outcome, step)
    }

    fn handle_coalesce_outcome(&mut self,
                               queue: &mut VecDeque<WorkItem>,
                               results: &mut Vec<RowResult>,
                               outcome: crate::coalesce::CoalesceOutcome,
                               step: usize)
                               -> Result<(), EngineError> {
        if outcome.held {
            return Ok(());
        }
        if let Some(reason) = outcome.failure_reason {
            // Exactamente un outcome terminal por token afectado; el
            // executor no escribió nada para estos.
            let error_hash = hash_value(&serde_json::json!({ "reason": reason }));
            for token in outcome.consumed_tokens {
                self.recorder.record_terminal_outcome(&token.token_id,
                                                      RowOutcome::Failed,
                                                      OutcomeDetail::error(error_hash.clone()))?;
                results.push(RowResult::new(token, RowOutcome::Failed, None));
            }
            return Ok(());
        }
        if let Some(merged) = outcome.merged_token {
            // Los COALESCED de los consumidos ya los escribió el executor;
            // no hay RowResult para ellos. El fusionado sigue pipeline abajo.
            queue.push_back(WorkItem { token: merged, start_step: step });
        }
        Ok(())
    }

    fn execute_step(&mut self,
                    queue: &mut VecDeque<WorkItem>,
                    results: &mut Vec<RowResult>,
                    steps: &mut [PipelineStep],
                    ctx: &PluginContext,
                    token: TokenInfo,
                    step: usize)
                    -> Result<StepDisposition, EngineError> {
        let audit_step = step + 1; // el source es el paso 0 del audit trail
        if step < steps.len() {
            match &mut steps[step] {
                PipelineStep::Gate(gate) => {
                    self.run_plugin_gate(queue, gate.as_mut(), token, ctx, audit_step)
                }
                PipelineStep::Transform(transform) => {
                    let node_id = transform.node_id().map(str::to_string);
                    let is_aggregation = transform.is_batch_aware()
                        && node_id.as_deref()
                                  .map(|id| self.aggregation.is_aggregation_node(id))
                                  .unwrap_or(false);
                    if is_aggregation {
                        self.run_aggregation_step(queue,
                                                  results,
                                                  transform.as_mut(),
                                                  token,
                                                  ctx,
                                                  step)
                    } else {
                        self.run_transform_step(queue, transform.as_mut(), token, ctx, audit_step)
                    }
                }
            }
        } else {
            let gate_index = step - steps.len();
            let settings = self.config_gates[gate_index].clone();
            let node_id = self.config_gate_ids
                              .get(&settings.name)
                              .cloned()
                              .ok_or_else(|| EngineError::RouteValidation(format!(
                                  "config gate {} has no node registered", settings.name
                              )))?;
            self.run_config_gate(queue, &settings, &node_id, token, audit_step)
        }
    }

    fn run_plugin_gate(&mut self,
                       queue: &mut VecDeque<WorkItem>,
                       gate: &mut dyn crate::contracts::GatePlugin,
                       token: TokenInfo,
                       ctx: &PluginContext,
                       audit_step: usize)
                       -> Result<StepDisposition, EngineError> {
        let execution = self.gate_executor.execute_gate(gate,
                                                        &token,
                                                        ctx,
                                                        audit_step,
                                                        Some(&self.token_manager))?;
        self.settle_gate_execution(queue, execution, audit_step)
    }

    fn run_config_gate(&mut self,
                       queue: &mut VecDeque<WorkItem>,
                       settings: &GateSettings,
                       node_id: &str,
                       token: TokenInfo,
                       audit_step: usize)
                       -> Result<StepDisposition, EngineError> {
        let execution = self.gate_executor.execute_config_gate(settings,
                                                               node_id,
                                                               &token,
                                                               audit_step,
                                                               Some(&self.token_manager))?;
        self.settle_gate_execution(queue, execution, audit_step)
    }

    fn settle_gate_execution(&mut self,
                             queue: &mut VecDeque<WorkItem>,
                             execution: crate::executors::GateExecution,
                             audit_step: usize)
                             -> Result<StepDisposition, EngineError> {
        match execution.action_kind {
            "continue" => Ok(StepDisposition::Advance(execution.updated_token)),
            "route" => {
                let sink_name = execution.sink_name.clone();
                self.recorder.record_terminal_outcome(
                    &execution.updated_token.token_id,
                    RowOutcome::Routed,
                    OutcomeDetail { sink_name: sink_name.clone(), ..Default::default() },
                )?;
                Ok(StepDisposition::Terminal(RowResult::new(execution.updated_token,
                                                            RowOutcome::Routed,
                                                            sink_name)))
            }
            "fork_to_paths" => {
                let fork_group_id = execution.fork_group_id.clone().unwrap_or_default();
                // FORKED del padre con el MISMO fork_group_id de los hijos.
                self.recorder.record_terminal_outcome(
                    &execution.updated_token.token_id,
                    RowOutcome::Forked,
                    OutcomeDetail::fork_group(fork_group_id),
                )?;
                for child in execution.child_tokens {
                    queue.push_back(WorkItem { token: child, start_step: audit_step });
                }
                // Un RowResult por token terminal: el padre también informa.
                Ok(StepDisposition::Terminal(RowResult::new(execution.updated_token,
                                                            RowOutcome::Forked,
                                                            None)))
            }
            other => Err(EngineError::InvariantViolation(format!(
                "unknown gate action kind {other:?}"
            ))),
        }
    }

    fn run_transform_step(&mut self,
                          queue: &mut VecDeque<WorkItem>,
                          transform: &mut dyn crate::contracts::TransformPlugin,
                          token: TokenInfo,
                          ctx: &PluginContext,
                          audit_step: usize)
                          -> Result<StepDisposition, EngineError> {
        let executor = &self.transform_executor;
        let attempt_result = match &self.retry_manager {
            Some(retry) => retry.execute(|attempt| {
                executor.execute_transform(transform, &token, ctx, audit_step, attempt)
            }),
            None => executor.execute_transform(transform, &token, ctx, audit_step, 0),
        };

        let execution = match attempt_result {
            Ok(execution) => execution,
            Err(EngineError::MaxRetriesExceeded { attempts, last_error }) => {
                // Reintentos agotados: FAILED, el run sigue con otras filas.
                let error_hash = hash_value(&serde_json::json!({
                    "error": last_error,
                    "attempts": attempts,
                }));
                self.recorder.record_terminal_outcome(&token.token_id,
                                                      RowOutcome::Failed,
                                                      OutcomeDetail::error(error_hash))?;
                return Ok(StepDisposition::Terminal(RowResult::new(token,
                                                                   RowOutcome::Failed,
                                                                   None)));
            }
            Err(EngineError::PluginFailure { node_id, message, retryable: true })
                if self.retry_manager.is_none() =>
            {
                // Sin RetryManager, un fallo reintentable se degrada a error
                // de datos declarado. Con on_error rutea; sin on_error el
                // run falla (silenciarlo como ROUTED sin sink está
                // prohibido).
                return self.settle_unretried_failure(transform, token, node_id, message);
            }
            Err(other) => return Err(other),
        };

        match execution.outcome {
            TransformOutcome::Success { token: updated } => {
                Ok(StepDisposition::Advance(updated))
            }
            TransformOutcome::Multi { rows } => {
                let (children, expand_group_id) =
                    self.token_manager.expand_token(&token, &rows)?;
                self.recorder.record_terminal_outcome(
                    &token.token_id,
                    RowOutcome::Expanded,
                    OutcomeDetail::expand_group(expand_group_id),
                )?;
                for child in children {
                    queue.push_back(WorkItem { token: child, start_step: audit_step });
                }
                Ok(StepDisposition::Terminal(RowResult::new(token,
                                                            RowOutcome::Expanded,
                                                            None)))
            }
            TransformOutcome::ErrorDiscarded { reason } => {
                let error_hash = hash_value(&reason);
                self.recorder.record_terminal_outcome(&token.token_id,
                                                      RowOutcome::Quarantined,
                                                      OutcomeDetail::error(error_hash))?;
                Ok(StepDisposition::Terminal(RowResult::new(token,
                                                            RowOutcome::Quarantined,
                                                            None)))
            }
            TransformOutcome::ErrorRouted { sink_name, reason } => {
                let error_hash = hash_value(&reason);
                self.recorder.record_terminal_outcome(
                    &token.token_id,
                    RowOutcome::Routed,
                    OutcomeDetail { sink_name: Some(sink_name.clone()),
                                    error_hash: Some(error_hash),
                                    ..Default::default() },
                )?;
                Ok(StepDisposition::Terminal(RowResult::new(token,
                                                            RowOutcome::Routed,
                                                            Some(sink_name))))
            }
        }
    }

    fn settle_unretried_failure(&mut self,
                                transform: &mut dyn crate::contracts::TransformPlugin,
                                token: TokenInfo,
                                node_id: String,
                                message: String)
                                -> Result<StepDisposition, EngineError> {
        let reason = serde_json::json!({
            "reason": "retryable_failure_without_retry_manager",
            "error": message,
        });
        let disposition = match transform.on_error() {
            Some(d) => d,
            None => {
                return Err(EngineError::PluginFailure { node_id,
                                                        message,
                                                        retryable: true });
            }
        };
        self.recorder.record_transform_error(&self.run_id,
                                             &node_id,
                                             &token.token_id,
                                             &token.row_id,
                                             reason.clone(),
                                             disposition.destination())?;
        let error_hash = hash_value(&reason);
        match disposition {
            ErrorDisposition::Discard => {
                self.recorder.record_terminal_outcome(&token.token_id,
                                                      RowOutcome::Quarantined,
                                                      OutcomeDetail::error(error_hash))?;
                Ok(StepDisposition::Terminal(RowResult::new(token,
                                                            RowOutcome::Quarantined,
                                                            None)))
            }
            ErrorDisposition::Sink(sink_name) => {
                // El último node_state failed ya existe; el ruteo va por el
                // edge DIVERT del intento 0.
                let label = error_edge_label(0);
                let key = (node_id.clone(), label.clone());
                if let Some(edge_id) = self.edge_map.get(&key) {
                    let states = self.recorder.get_node_states_for_token(&token.token_id)?;
                    if let Some(last_state) = states.last() {
                        self.recorder.record_routing_event(&last_state.state_id,
                                                           edge_id,
                                                           RoutingMode::Divert,
                                                           Some(&reason),
                                                           None)?;
                    }
                }
                self.recorder.record_terminal_outcome(
                    &token.token_id,
                    RowOutcome::Routed,
                    OutcomeDetail { sink_name: Some(sink_name.clone()),
                                    error_hash: Some(error_hash),
                                    ..Default::default() },
                )?;
                Ok(StepDisposition::Terminal(RowResult::new(token,
                                                            RowOutcome::Routed,
                                                            Some(sink_name))))
            }
        }
    }

    fn run_aggregation_step(&mut self,
                            queue: &mut VecDeque<WorkItem>,
                            results: &mut Vec<RowResult>,
                            transform: &mut dyn crate::contracts::TransformPlugin,
                            token: TokenInfo,
                            ctx: &PluginContext,
                            step: usize)
                            -> Result<StepDisposition, EngineError> {
        let node_id = transform.node_id()
                               .expect("aggregation step has node_id (checked by caller)")
                               .to_string();
        let decision = self.aggregation.buffer_row(&node_id, token.clone())?;

        match decision.row_outcome {
            // El input ya es terminal (CONSUMED_IN_BATCH); se informa al
            // caller con su RowResult.
            RowOutcome::ConsumedInBatch => {
                results.push(RowResult::new(token, RowOutcome::ConsumedInBatch, None));
            }
            // Retenido en el buffer: resultado informativo, sin outcome
            // terminal todavía. Si el flush dispara acá mismo, el token
            // reaparece como COMPLETED en esta misma tanda.
            RowOutcome::Buffered if !decision.should_flush => {
                results.push(RowResult::new(token, RowOutcome::Buffered, None));
            }
            _ => {}
        }

        if let Some(trigger_reason) = decision.trigger_reason {
            self.flush_aggregation_node(queue, transform, &node_id, ctx, step, trigger_reason)?;
        }
        Ok(StepDisposition::Consumed)
    }

    fn flush_aggregation_node(&mut self,
                              queue: &mut VecDeque<WorkItem>,
                              transform: &mut dyn crate::contracts::TransformPlugin,
                              node_id: &str,
                              ctx: &PluginContext,
                              step: usize,
                              trigger_reason: &str)
                              -> Result<(), EngineError> {
        let flush = self.aggregation.execute_flush(node_id,
                                                   transform,
                                                   ctx,
                                                   step + 1,
                                                   trigger_reason,
                                                   &self.token_manager)?;
        for output in flush.outputs {
            queue.push_back(WorkItem { token: output, start_step: step + 1 });
        }
        Ok(())
    }

    /// Flush de fin de source: todo buffer abierto dispara con razón
    /// `end_of_source` y sus salidas recorren el resto del pipeline.
    pub fn flush_open_aggregations(&mut self,
                                   steps: &mut [PipelineStep],
                                   ctx: &PluginContext)
                                   -> Result<Vec<RowResult>, EngineError> {
        let mut results = Vec::new();
        for node_id in self.aggregation.nodes_with_buffered_rows() {
            let Some(step) = Self::step_index_for_node(steps, &node_id) else {
                return Err(EngineError::InvariantViolation(format!(
                    "buffered aggregation node {node_id} is not a pipeline step"
                )));
            };
            let mut queue = VecDeque::new();
            {
                let PipelineStep::Transform(transform) = &mut steps[step] else {
                    return Err(EngineError::InvariantViolation(format!(
                        "aggregation node {node_id} is not a transform step"
                    )));
                };
                let flush = self.aggregation.execute_flush(&node_id,
                                                           transform.as_mut(),
                                                           ctx,
                                                           step + 1,
                                                           "end_of_source",
                                                           &self.token_manager)?;
                for output in flush.outputs {
                    queue.push_back(WorkItem { token: output, start_step: step + 1 });
                }
            }
            self.run_queue(queue, steps, ctx, &mut results)?;
        }
        Ok(results)
    }

    /// Barrido de timeouts de coalesce (lo invoca el orquestador al final
    /// del source y ante esperas). Los tokens fusionados siguen pipeline
    /// abajo desde su punto de entrada.
    pub fn sweep_coalesce_timeouts(&mut self,
                                   steps: &mut [PipelineStep],
                                   ctx: &PluginContext)
                                   -> Result<Vec<RowResult>, EngineError> {
        let total = self.total_steps(steps);
        let mut results = Vec::new();
        for name in self.coalesce.registered_names() {
            let entry = self.coalesce_entry_steps
                            .get(&name)
                            .copied()
                            .unwrap_or(total)
                            .min(total);
            let outcomes = self.coalesce.check_timeouts(&name, entry + 1)?;
            let mut queue = VecDeque::new();
            for outcome in outcomes {
                self.handle_coalesce_outcome(&mut queue, &mut results, outcome, entry)?;
            }
            self.run_queue(queue, steps, ctx, &mut results)?;
        }
        Ok(results)
    }

    fn flush_timed_out_aggregations(&mut self,
                                    steps: &mut [PipelineStep],
                                    ctx: &PluginContext,
                                    results: &mut Vec<RowResult>)
                                    -> Result<(), EngineError> {
        let timed_out: Vec<NodeId> = self.aggregation
                                         .node_ids()
                                         .into_iter()
                                         .filter(|id| self.aggregation.timed_out(id))
                                         .collect();
        for node_id in timed_out {
            let Some(step) = Self::step_index_for_node(steps, &node_id) else {
                continue;
            };
            let mut queue = VecDeque::new();
            {
                let PipelineStep::Transform(transform) = &mut steps[step] else {
                    continue;
                };
                let flush = self.aggregation.execute_flush(&node_id,
                                                           transform.as_mut(),
                                                           ctx,
                                                           step + 1,
                                                           "timeout",
                                                           &self.token_manager)?;
                for output in flush.outputs {
                    queue.push_back(WorkItem { token: output, start_step: step + 1 });
                }
            }
            self.run_queue(queue, steps, ctx, results)?;
        }
        Ok(())
    }

    fn step_index_for_node(steps: &[PipelineStep], node_id: &str) -> Option<usize> {
        steps.iter().position(|s| s.node_id() == Some(node_id))
    }
}
