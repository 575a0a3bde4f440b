//! Executor de sinks: escritura batcheada con registro de artifacts.
//!
//! Orden de los hechos (invariante artifact-before-outcome): primero el
//! sink escribe, después se registra el artifact, y recién entonces el
//! orquestador escribe los COMPLETED de los tokens entregados. Si el sink
//! levanta, TODOS los node_states del cohort se cierran failed y no hay
//! artifact.

use std::time::Instant;

use serde_json::Value;

use crate::contracts::{NodeStateStatus, PluginContext, SinkPlugin};
use crate::errors::EngineError;
use crate::recorder::{ArtifactRecord, AuditStore, Recorder};
use crate::spans::SpanFactory;
use crate::tokens::TokenInfo;

pub struct SinkExecutor<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    spans: &'a SpanFactory,
    run_id: String,
}

impl<'a, S: AuditStore> SinkExecutor<'a, S> {
    pub fn new(recorder: &'a Recorder<S>,
               spans: &'a SpanFactory,
               run_id: &str)
               -> Self {
        Self { recorder, spans, run_id: run_id.to_string() }
    }

    /// Escribe un cohort de tokens al sink. Devuelve el artifact registrado,
    /// o None si el cohort está vacío (sin efectos).
    pub fn write(&self,
                 sink: &mut dyn SinkPlugin,
                 tokens: &[TokenInfo],
                 ctx: &PluginContext,
                 step_in_pipeline: usize)
                 -> Result<Option<ArtifactRecord>, EngineError> {
        if tokens.is_empty() {
            return Ok(None);
        }
        let node_id = sink.node_id()
                          .ok_or_else(|| EngineError::ContractViolation(format!(
                              "sink {} has no node_id bound", sink.name()
                          )))?
                          .to_string();

        let _span = self.spans.start(format!("sink:{}", sink.name()));

        // Un node_state por token de entrada, todos contra el nodo sink.
        let mut state_ids = Vec::with_capacity(tokens.len());
        for token in tokens {
            let state = self.recorder.begin_node_state(&token.token_id,
                                                       &node_id,
                                                       step_in_pipeline,
                                                       0,
                                                       &token.row_data)?;
            state_ids.push(state.state_id);
        }

        let rows: Vec<Value> = tokens.iter().map(|t| t.row_data.clone()).collect();
        let started = Instant::now();
        let state_ctx = ctx.for_state(&state_ids[0]);

        match sink.write(&rows, &state_ctx) {
            Ok(descriptor) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                // Artifact ligado al primer state del cohort.
                let artifact = self.recorder.record_artifact(&self.run_id,
                                                             &node_id,
                                                             &state_ids[0],
                                                             &descriptor)?;
                for (state_id, token) in state_ids.iter().zip(tokens.iter()) {
                    self.recorder.complete_node_state(state_id,
                                                      NodeStateStatus::Completed,
                                                      Some(&token.row_data),
                                                      Some(duration_ms),
                                                      None,
                                                      None)?;
                }
                log::debug!("sink {} wrote {} rows -> {}",
                            sink.name(),
                            rows.len(),
                            artifact.path_or_uri);
                Ok(Some(artifact))
            }
            Err(call_error) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                // El cohort completo falla; el artifact no se registra.
                for state_id in &state_ids {
                    self.recorder.complete_node_state(state_id,
                                                      NodeStateStatus::Failed,
                                                      None,
                                                      Some(duration_ms),
                                                      Some(call_error.to_json()),
                                                      None)?;
                }
                Err(EngineError::PluginFailure { node_id,
                                                 message: call_error.message,
                                                 retryable: call_error.retryable })
            }
        }
    }
}
