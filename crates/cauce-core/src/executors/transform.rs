//! Executor de transforms.
//!
//! Tres niveles de confianza:
//! - `TransformResult::Error` es un error de DATOS: se registra como
//!   transform_error y se rutea según `on_error` (discard o sink vía edge
//!   DIVERT). Nunca es un fallo del run.
//! - `Err(PluginCallError)` es un fallo EXTERNO: el node_state se cierra
//!   failed y el error sube (el RetryManager decide).
//! - Violaciones de contrato (SuccessMulti sin `creates_tokens`, Error sin
//!   `on_error`) suben como tales y tumban el run.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;

use crate::contracts::{
    error_edge_label, EdgeId, ErrorDisposition, NodeId, NodeStateStatus, PluginContext,
    RoutingMode, TransformPlugin, TransformResult,
};
use crate::errors::EngineError;
use crate::recorder::{AuditStore, Recorder};
use crate::spans::SpanFactory;
use crate::tokens::TokenInfo;

/// Desenlace de un intento de transform, ya auditado.
#[derive(Debug)]
pub enum TransformOutcome {
    /// Fila transformada; misma identidad de token.
    Success { token: TokenInfo },
    /// Varias filas de salida: el caller expande tokens.
    Multi { rows: Vec<Value> },
    /// Error de datos con on_error = discard → cuarentena.
    ErrorDiscarded { reason: Value },
    /// Error de datos ruteado a un sink por edge DIVERT.
    ErrorRouted { sink_name: String, reason: Value },
}

#[derive(Debug)]
pub struct TransformExecution {
    pub outcome: TransformOutcome,
    pub state_id: String,
    pub input_hash: String,
    pub duration_ms: u64,
}

pub struct TransformExecutor<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    spans: &'a SpanFactory,
    run_id: String,
    edge_map: HashMap<(NodeId, String), EdgeId>,
}

impl<'a, S: AuditStore> TransformExecutor<'a, S> {
    pub fn new(recorder: &'a Recorder<S>,
               spans: &'a SpanFactory,
               run_id: &str,
               edge_map: HashMap<(NodeId, String), EdgeId>)
               -> Self {
        Self { recorder, spans, run_id: run_id.to_string(), edge_map }
    }

    /// Ejecuta un intento del transform sobre el token. `attempt` numera los
    /// reintentos (0-based); cada intento deja su propio node_state.
    pub fn execute_transform(&self,
                             transform: &mut dyn TransformPlugin,
                             token: &TokenInfo,
                             ctx: &PluginContext,
                             step_in_pipeline: usize,
                             attempt: u32)
                             -> Result<TransformExecution, EngineError> {
        let node_id = transform.node_id()
                               .ok_or_else(|| EngineError::ContractViolation(format!(
                                   "transform {} has no node_id bound", transform.name()
                               )))?
                               .to_string();

        let _span = self.spans.start(format!("transform:{}", transform.name()));
        let state = self.recorder.begin_node_state(&token.token_id,
                                                   &node_id,
                                                   step_in_pipeline,
                                                   attempt,
                                                   &token.row_data)?;
        let started = Instant::now();
        let state_ctx = ctx.for_state(&state.state_id);

        let result = transform.process(&token.row_data, &state_ctx);
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(TransformResult::Success { row, context_after }) => {
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Completed,
                                                  Some(&row),
                                                  Some(duration_ms),
                                                  None,
                                                  context_after)?;
                Ok(TransformExecution { outcome: TransformOutcome::Success {
                                            token: token.with_data(row),
                                        },
                                        state_id: state.state_id,
                                        input_hash: state.input_hash,
                                        duration_ms })
            }
            Ok(TransformResult::SuccessMulti { rows }) => {
                if !transform.creates_tokens() {
                    let err = EngineError::ContractViolation(format!(
                        "transform {} returned multiple rows without creates_tokens",
                        transform.name()
                    ));
                    self.recorder.complete_node_state(&state.state_id,
                                                      NodeStateStatus::Failed,
                                                      None,
                                                      Some(duration_ms),
                                                      Some(serde_json::json!({
                                                          "message": err.to_string(),
                                                      })),
                                                      None)?;
                    return Err(err);
                }
                let output = Value::Array(rows.clone());
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Completed,
                                                  Some(&output),
                                                  Some(duration_ms),
                                                  None,
                                                  None)?;
                Ok(TransformExecution { outcome: TransformOutcome::Multi { rows },
                                        state_id: state.state_id,
                                        input_hash: state.input_hash,
                                        duration_ms })
            }
            Ok(TransformResult::Error { reason }) => self.handle_data_error(transform,
                                                                            token,
                                                                            &node_id,
                                                                            state.state_id,
                                                                            state.input_hash,
                                                                            reason,
                                                                            duration_ms,
                                                                            attempt),
            Err(call_error) => {
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Failed,
                                                  None,
                                                  Some(duration_ms),
                                                  Some(call_error.to_json()),
                                                  None)?;
                Err(EngineError::PluginFailure { node_id,
                                                 message: call_error.message,
                                                 retryable: call_error.retryable })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_data_error(&self,
                         transform: &mut dyn TransformPlugin,
                         token: &TokenInfo,
                         node_id: &str,
                         state_id: String,
                         input_hash: String,
                         reason: Value,
                         duration_ms: u64,
                         attempt: u32)
                         -> Result<TransformExecution, EngineError> {
        self.recorder.complete_node_state(&state_id,
                                          NodeStateStatus::Failed,
                                          None,
                                          Some(duration_ms),
                                          Some(reason.clone()),
                                          None)?;

        let disposition = match transform.on_error() {
            Some(d) => d,
            None => {
                // Devolver Error sin on_error es un bug del plugin.
                return Err(EngineError::ContractViolation(format!(
                    "transform {} returned an error result but has no on_error configured",
                    transform.name()
                )));
            }
        };

        self.recorder.record_transform_error(&self.run_id,
                                             node_id,
                                             &token.token_id,
                                             &token.row_id,
                                             reason.clone(),
                                             disposition.destination())?;

        match disposition {
            ErrorDisposition::Discard => {
                Ok(TransformExecution { outcome: TransformOutcome::ErrorDiscarded { reason },
                                        state_id,
                                        input_hash,
                                        duration_ms })
            }
            ErrorDisposition::Sink(sink_name) => {
                let label = error_edge_label(attempt);
                let key = (node_id.to_string(), label.clone());
                let edge_id = self.edge_map.get(&key).ok_or_else(|| {
                    // Sin edge DIVERT registrado el audit trail quedaría
                    // incompleto: violación de invariante, no un warning.
                    EngineError::InvariantViolation(format!(
                        "transform {} routes errors to {sink_name:?} but no DIVERT edge \
                         is registered for ({node_id}, {label})",
                        transform.name()
                    ))
                })?;
                self.recorder.record_routing_event(&state_id,
                                                   edge_id,
                                                   RoutingMode::Divert,
                                                   Some(&reason),
                                                   None)?;
                Ok(TransformExecution { outcome: TransformOutcome::ErrorRouted {
                                            sink_name: sink_name.clone(),
                                            reason,
                                        },
                                        state_id,
                                        input_hash,
                                        duration_ms })
            }
        }
    }
}
