//! Executor de agregación: buffer por nodo, triggers y flush.
//!
//! La agregación es estructural, no un tipo de plugin: un transform
//! batch-aware con `AggregationSettings` registrados para su node_id es
//! conducido por este executor.
//!
//! Identidad de tokens:
//! - modo transform: cada input queda CONSUMED_IN_BATCH al bufferear y las
//!   salidas del flush son tokens NUEVOS;
//! - modo passthrough: N entran, N salen, MISMOS token_ids, mismo orden.
//!
//! Los timeouts se muestrean también en reposo (en cada llegada de fila y en
//! el flush de fin de source): "el timeout idle nunca dispara" es un modo de
//! falla conocido y corregido.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::clock::Clock;
use crate::contracts::{
    AggregationMode, AggregationSettings, BatchStatus, NodeId, NodeStateStatus, PluginContext,
    RowOutcome, TransformPlugin, TransformResult,
};
use crate::errors::EngineError;
use crate::hashing::to_canonical_json;
use crate::recorder::{AuditStore, OutcomeDetail, Recorder};
use crate::spans::SpanFactory;
use crate::tokens::{TokenInfo, TokenManager};

/// Resultado de bufferear una fila.
#[derive(Debug, Clone, Copy)]
pub struct BufferDecision {
    pub should_flush: bool,
    /// Cuál trigger disparó ("count" | "size" | "timeout"), si alguno.
    pub trigger_reason: Option<&'static str>,
    /// Outcome a nivel de RowResult para el token buffereado.
    pub row_outcome: RowOutcome,
}

/// Resultado de un flush: tokens de salida que siguen pipeline abajo.
pub struct FlushResult {
    pub outputs: Vec<TokenInfo>,
    pub mode: AggregationMode,
    pub batch_id: String,
}

/// Contadores del trigger de un buffer abierto.
#[derive(Debug, Default)]
struct TriggerState {
    batch_count: usize,
    bytes: usize,
    first_buffered_at: Option<f64>,
}

#[derive(Default)]
struct NodeBuffer {
    rows: Vec<Value>,
    tokens: Vec<TokenInfo>,
    batch_id: Option<String>,
    trigger: TriggerState,
}

pub struct AggregationExecutor<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    spans: &'a SpanFactory,
    run_id: String,
    settings: HashMap<NodeId, AggregationSettings>,
    buffers: HashMap<NodeId, NodeBuffer>,
    clock: Arc<dyn Clock>,
}

impl<'a, S: AuditStore> AggregationExecutor<'a, S> {
    pub fn new(recorder: &'a Recorder<S>,
               spans: &'a SpanFactory,
               run_id: &str,
               settings: HashMap<NodeId, AggregationSettings>,
               clock: Arc<dyn Clock>)
               -> Self {
        Self { recorder,
               spans,
               run_id: run_id.to_string(),
               settings,
               buffers: HashMap::new(),
               clock }
    }

    pub fn is_aggregation_node(&self, node_id: &str) -> bool {
        self.settings.contains_key(node_id)
    }

    pub fn mode(&self, node_id: &str) -> Option<AggregationMode> {
        self.settings.get(node_id).map(|s| s.mode)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.settings.keys().cloned().collect()
    }

    /// Nodos con buffer no vacío (candidatos al flush de fin de source).
    pub fn nodes_with_buffered_rows(&self) -> Vec<NodeId> {
        self.buffers
            .iter()
            .filter(|(_, b)| !b.rows.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Bufferea un token en el nodo. Abre el Batch en la primera fila,
    /// agrega el BatchMember y actualiza los contadores del trigger.
    pub fn buffer_row(&mut self,
                      node_id: &str,
                      token: TokenInfo)
                      -> Result<BufferDecision, EngineError> {
        let settings = self.settings
                           .get(node_id)
                           .ok_or_else(|| EngineError::ContractViolation(format!(
                               "node {node_id} has no aggregation settings"
                           )))?
                           .clone();

        let now = self.clock.now();
        let buffer = self.buffers.entry(node_id.to_string()).or_default();

        if buffer.batch_id.is_none() {
            let batch = self.recorder.create_batch(&self.run_id, node_id)?;
            buffer.batch_id = Some(batch.batch_id);
            buffer.trigger.first_buffered_at = Some(now);
        }
        let batch_id = buffer.batch_id.clone().expect("batch_id just ensured");

        let ordinal = buffer.rows.len();
        self.recorder.add_batch_member(&batch_id, &token.token_id, ordinal)?;

        buffer.trigger.batch_count += 1;
        buffer.trigger.bytes += to_canonical_json(&token.row_data).len();

        let row_outcome = match settings.mode {
            AggregationMode::Transform => {
                // Terminal inmediato: el input muere en el batch.
                self.recorder.record_terminal_outcome(&token.token_id,
                                                      RowOutcome::ConsumedInBatch,
                                                      OutcomeDetail::default())?;
                RowOutcome::ConsumedInBatch
            }
            AggregationMode::Passthrough => RowOutcome::Buffered,
        };

        buffer.rows.push(token.row_data.clone());
        buffer.tokens.push(token);

        let trigger_reason = Self::trigger_fires(&settings, &buffer.trigger, now);
        Ok(BufferDecision { should_flush: trigger_reason.is_some(),
                            trigger_reason,
                            row_outcome })
    }

    fn trigger_fires(settings: &AggregationSettings,
                     trigger: &TriggerState,
                     now: f64)
                     -> Option<&'static str> {
        if let Some(count) = settings.trigger.count {
            if trigger.batch_count >= count {
                return Some("count");
            }
        }
        if let Some(size) = settings.trigger.size_bytes {
            if trigger.bytes >= size {
                return Some("size");
            }
        }
        if let Some(timeout) = settings.trigger.timeout_seconds {
            if let Some(first) = trigger.first_buffered_at {
                if now - first >= timeout {
                    return Some("timeout");
                }
            }
        }
        None
    }

    /// ¿Dispara el trigger del nodo con el estado actual del buffer?
    pub fn should_flush(&self, node_id: &str) -> bool {
        match (self.settings.get(node_id), self.buffers.get(node_id)) {
            (Some(settings), Some(buffer)) if !buffer.rows.is_empty() => {
                Self::trigger_fires(settings, &buffer.trigger, self.clock.now()).is_some()
            }
            _ => false,
        }
    }

    /// Muestreo de timeout en reposo: true si el buffer abierto del nodo
    /// superó su timeout aunque no llegara ninguna fila nueva.
    pub fn timed_out(&self, node_id: &str) -> bool {
        match (self.settings.get(node_id), self.buffers.get(node_id)) {
            (Some(settings), Some(buffer)) if !buffer.rows.is_empty() => {
                match (settings.trigger.timeout_seconds, buffer.trigger.first_buffered_at) {
                    (Some(timeout), Some(first)) => self.clock.now() - first >= timeout,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Ejecuta el flush del nodo: node_state contra el batch, process_batch
    /// del plugin, outcomes e identidades según el modo.
    pub fn execute_flush(&mut self,
                         node_id: &str,
                         transform: &mut dyn TransformPlugin,
                         ctx: &PluginContext,
                         step_in_pipeline: usize,
                         trigger_reason: &str,
                         token_manager: &TokenManager<'a, S>)
                         -> Result<FlushResult, EngineError> {
        let settings = self.settings
                           .get(node_id)
                           .ok_or_else(|| EngineError::ContractViolation(format!(
                               "node {node_id} has no aggregation settings"
                           )))?
                           .clone();
        let buffer = self.buffers.remove(node_id).unwrap_or_default();
        if buffer.rows.is_empty() {
            return Ok(FlushResult { outputs: Vec::new(),
                                    mode: settings.mode,
                                    batch_id: String::new() });
        }
        let batch_id = buffer.batch_id.clone().expect("non-empty buffer has a batch");

        let _span = self.spans.start(format!("aggregation:{}", settings.name));
        log::debug!("flush node={node_id} batch={batch_id} rows={} trigger={trigger_reason}",
                    buffer.rows.len());
        self.recorder.mark_batch_flushing(&batch_id)?;

        // El node_state del flush se ancla al primer token buffereado; el
        // input auditado es el array completo del batch.
        let anchor = &buffer.tokens[0];
        let input = Value::Array(buffer.rows.clone());
        let state = self.recorder.begin_node_state(&anchor.token_id,
                                                   node_id,
                                                   step_in_pipeline,
                                                   0,
                                                   &input)?;
        let started = Instant::now();
        let state_ctx = ctx.for_state(&state.state_id);

        let result = transform.process_batch(&buffer.rows, &state_ctx);
        let duration_ms = started.elapsed().as_millis() as u64;

        let output_rows: Vec<Value> = match result {
            Ok(TransformResult::Success { row, .. }) => vec![row],
            Ok(TransformResult::SuccessMulti { rows }) => rows,
            Ok(TransformResult::Error { reason }) => {
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Failed,
                                                  None,
                                                  Some(duration_ms),
                                                  Some(reason.clone()),
                                                  None)?;
                self.recorder.complete_batch(&batch_id, BatchStatus::Failed, trigger_reason)?;
                return Err(EngineError::ContractViolation(format!(
                    "aggregation {} returned a data error for a whole batch: {reason}",
                    settings.name
                )));
            }
            Err(call_error) => {
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Failed,
                                                  None,
                                                  Some(duration_ms),
                                                  Some(call_error.to_json()),
                                                  None)?;
                self.recorder.complete_batch(&batch_id, BatchStatus::Failed, trigger_reason)?;
                return Err(EngineError::PluginFailure { node_id: node_id.to_string(),
                                                        message: call_error.message,
                                                        retryable: call_error.retryable });
            }
        };

        let outputs = match settings.mode {
            AggregationMode::Transform => {
                if !transform.creates_tokens() {
                    self.recorder.complete_node_state(&state.state_id,
                                                      NodeStateStatus::Failed,
                                                      None,
                                                      Some(duration_ms),
                                                      Some(json!({
                                                          "message": "transform-mode aggregation \
                                                                      without creates_tokens",
                                                      })),
                                                      None)?;
                    self.recorder.complete_batch(&batch_id, BatchStatus::Failed, trigger_reason)?;
                    return Err(EngineError::ContractViolation(format!(
                        "aggregation {} is in transform mode but its plugin does not declare \
                         creates_tokens",
                        settings.name
                    )));
                }
                let mut outputs = Vec::with_capacity(output_rows.len());
                for row in &output_rows {
                    outputs.push(token_manager.create_batch_output_token(&anchor.row_id,
                                                                         row.clone())?);
                }
                outputs
            }
            AggregationMode::Passthrough => {
                if output_rows.len() != buffer.tokens.len() {
                    self.recorder.complete_node_state(&state.state_id,
                                                      NodeStateStatus::Failed,
                                                      None,
                                                      Some(duration_ms),
                                                      Some(json!({
                                                          "expected": buffer.tokens.len(),
                                                          "got": output_rows.len(),
                                                      })),
                                                      None)?;
                    self.recorder.complete_batch(&batch_id, BatchStatus::Failed, trigger_reason)?;
                    return Err(EngineError::ContractViolation(format!(
                        "passthrough aggregation {} must return the same number of output rows \
                         as buffered inputs ({} != {})",
                        settings.name,
                        output_rows.len(),
                        buffer.tokens.len()
                    )));
                }
                // Identidad preservada: mismo token, misma posición.
                buffer.tokens
                      .iter()
                      .zip(output_rows.iter())
                      .map(|(token, row)| token.with_data(row.clone()))
                      .collect()
            }
        };

        let output_value = Value::Array(output_rows);
        self.recorder.complete_node_state(&state.state_id,
                                          NodeStateStatus::Completed,
                                          Some(&output_value),
                                          Some(duration_ms),
                                          None,
                                          None)?;
        self.recorder.complete_batch(&batch_id, BatchStatus::Completed, trigger_reason)?;

        Ok(FlushResult { outputs, mode: settings.mode, batch_id })
    }

    /// Cancela todos los buffers abiertos: batches FAILED con la razón dada
    /// y outcome terminal BUFFERED para los tokens aún estacionados en modo
    /// passthrough (en modo transform ya son CONSUMED_IN_BATCH).
    pub fn fail_open_batches(&mut self, reason: &str) -> Result<(), EngineError> {
        let node_ids: Vec<String> = self.buffers.keys().cloned().collect();
        for node_id in node_ids {
            let buffer = self.buffers.remove(&node_id).unwrap_or_default();
            let Some(batch_id) = buffer.batch_id else { continue };
            self.recorder.complete_batch(&batch_id, BatchStatus::Failed, reason)?;
            if self.mode(&node_id) == Some(AggregationMode::Passthrough) {
                for token in &buffer.tokens {
                    self.recorder.record_terminal_outcome(&token.token_id,
                                                          RowOutcome::Buffered,
                                                          OutcomeDetail::default())?;
                }
            }
        }
        Ok(())
    }

    // -- introspección (tests y checkpoint) -------------------------------

    pub fn get_buffered_rows(&self, node_id: &str) -> Vec<Value> {
        self.buffers.get(node_id).map(|b| b.rows.clone()).unwrap_or_default()
    }

    pub fn get_buffered_tokens(&self, node_id: &str) -> Vec<TokenInfo> {
        self.buffers.get(node_id).map(|b| b.tokens.clone()).unwrap_or_default()
    }

    pub fn get_batch_id(&self, node_id: &str) -> Option<String> {
        self.buffers.get(node_id).and_then(|b| b.batch_id.clone())
    }

    pub fn buffered_count(&self, node_id: &str) -> usize {
        self.buffers.get(node_id).map(|b| b.trigger.batch_count).unwrap_or(0)
    }

    /// Estado serializable de los buffers no vacíos:
    /// `{ node_id: { rows, token_ids, batch_id, buffered_for_seconds } }`.
    ///
    /// `buffered_for_seconds` es el estado del contador de timeout: cuánto
    /// lleva abierto el batch. Se guarda como delta (no como instante) porque
    /// el origen del reloj no sobrevive a un reinicio de proceso.
    pub fn get_checkpoint_state(&self) -> Value {
        let now = self.clock.now();
        let mut state = serde_json::Map::new();
        for (node_id, buffer) in &self.buffers {
            if buffer.rows.is_empty() {
                continue;
            }
            let token_ids: Vec<Value> = buffer.tokens
                                              .iter()
                                              .map(|t| Value::String(t.token_id.clone()))
                                              .collect();
            let buffered_for_seconds = buffer.trigger
                                             .first_buffered_at
                                             .map(|first| now - first)
                                             .unwrap_or(0.0);
            state.insert(node_id.clone(),
                         json!({
                             "rows": buffer.rows,
                             "token_ids": token_ids,
                             "batch_id": buffer.batch_id,
                             "buffered_for_seconds": buffered_for_seconds,
                         }));
        }
        Value::Object(state)
    }

    /// Rehidrata buffers desde un estado de checkpoint. Los contadores del
    /// trigger reflejan lo restaurado: un batch casi lleno dispara con la
    /// próxima fila, y la ventana de timeout retoma donde iba (el próximo
    /// muestreo dispara cuando hubiera disparado sin el reinicio).
    pub fn restore_from_checkpoint(&mut self, state: &Value) -> Result<(), EngineError> {
        let map = state.as_object().ok_or_else(|| EngineError::InvariantViolation(
            "checkpoint aggregation state must be an object".to_string(),
        ))?;
        for (node_id, entry) in map {
            if !self.settings.contains_key(node_id) {
                log::warn!("checkpoint has buffer for unknown aggregation node {node_id}; \
                            skipping");
                continue;
            }
            let rows: Vec<Value> = entry.get("rows")
                                        .and_then(Value::as_array)
                                        .cloned()
                                        .unwrap_or_default();
            let token_ids: Vec<String> =
                entry.get("token_ids")
                     .and_then(Value::as_array)
                     .map(|ids| {
                         ids.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                     })
                     .unwrap_or_default();
            if rows.len() != token_ids.len() {
                return Err(EngineError::InvariantViolation(format!(
                    "checkpoint buffer for {node_id} has {} rows but {} token_ids",
                    rows.len(),
                    token_ids.len()
                )));
            }
            let batch_id = entry.get("batch_id")
                                .and_then(Value::as_str)
                                .map(str::to_string);
            let buffered_for_seconds = entry.get("buffered_for_seconds")
                                            .and_then(Value::as_f64)
                                            .unwrap_or(0.0);

            let mut tokens = Vec::with_capacity(token_ids.len());
            for (token_id, row) in token_ids.iter().zip(rows.iter()) {
                let record = self.recorder.get_token(token_id)?;
                let mut token = TokenInfo::new(record.token_id, record.row_id, row.clone());
                token.branch_name = record.branch_name;
                tokens.push(token);
            }

            let bytes = rows.iter().map(|r| to_canonical_json(r).len()).sum();
            // Retrotrae el ancla del timeout por el delta guardado: lo ya
            // esperado antes del reinicio cuenta contra la misma ventana.
            let buffer = NodeBuffer { trigger: TriggerState {
                                          batch_count: rows.len(),
                                          bytes,
                                          first_buffered_at: Some(
                                              self.clock.now() - buffered_for_seconds,
                                          ),
                                      },
                                      rows,
                                      tokens,
                                      batch_id };
            self.buffers.insert(node_id.clone(), buffer);
        }
        Ok(())
    }
}
