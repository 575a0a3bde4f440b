//! Executor de gates (plugin y config) con superficie de auditoría idéntica.
//!
//! Un gate decide: continuar, rutear a sink(s) o forkear. Toda decisión deja
//! eventos de ruteo; una etiqueta resuelta sin edge o sin ruta es fatal
//! ("audit trail would be incomplete" nunca se permite en silencio).

use std::collections::HashMap;
use std::time::Instant;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::contracts::{
    EdgeId, GatePlugin, GateSettings, NodeId, NodeStateStatus, PluginContext, RoutingAction,
    RoutingMode,
};
use crate::errors::EngineError;
use crate::expr;
use crate::recorder::{AuditStore, Recorder};
use crate::spans::SpanFactory;
use crate::tokens::{TokenInfo, TokenManager};

/// Desenlace auditado de un gate.
#[derive(Debug)]
pub struct GateExecution {
    /// "continue" | "route" | "fork_to_paths" (estable para logs/tests).
    pub action_kind: &'static str,
    pub updated_token: TokenInfo,
    /// Sink de destino cuando la acción es route (el primero si hay varios).
    pub sink_name: Option<String>,
    /// Todos los sinks ruteados (route multi-etiqueta).
    pub routed_sinks: Vec<String>,
    pub child_tokens: Vec<TokenInfo>,
    pub fork_group_id: Option<String>,
    pub state_id: String,
}

pub struct GateExecutor<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    spans: &'a SpanFactory,
    edge_map: HashMap<(NodeId, String), EdgeId>,
    route_resolution: HashMap<(NodeId, String), String>,
}

impl<'a, S: AuditStore> GateExecutor<'a, S> {
    pub fn new(recorder: &'a Recorder<S>,
               spans: &'a SpanFactory,
               edge_map: HashMap<(NodeId, String), EdgeId>,
               route_resolution: HashMap<(NodeId, String), String>)
               -> Self {
        Self { recorder, spans, edge_map, route_resolution }
    }

    fn edge_for(&self, node_id: &str, label: &str) -> Result<&EdgeId, EngineError> {
        self.edge_map
            .get(&(node_id.to_string(), label.to_string()))
            .ok_or_else(|| EngineError::MissingEdge { node_id: node_id.to_string(),
                                                      label: label.to_string() })
    }

    /// Gate plugin: evalúa `evaluate(row, ctx)` y audita la acción.
    pub fn execute_gate(&self,
                        gate: &mut dyn GatePlugin,
                        token: &TokenInfo,
                        ctx: &PluginContext,
                        step_in_pipeline: usize,
                        token_manager: Option<&TokenManager<'a, S>>)
                        -> Result<GateExecution, EngineError> {
        let node_id = gate.node_id()
                          .ok_or_else(|| EngineError::ContractViolation(format!(
                              "gate {} has no node_id bound", gate.name()
                          )))?
                          .to_string();

        let _span = self.spans.start(format!("gate:{}", gate.name()));
        let state = self.recorder.begin_node_state(&token.token_id,
                                                   &node_id,
                                                   step_in_pipeline,
                                                   0,
                                                   &token.row_data)?;
        let started = Instant::now();
        let state_ctx = ctx.for_state(&state.state_id);

        let result = match gate.evaluate(&token.row_data, &state_ctx) {
            Ok(r) => r,
            Err(call_error) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Failed,
                                                  None,
                                                  Some(duration_ms),
                                                  Some(call_error.to_json()),
                                                  None)?;
                return Err(EngineError::PluginFailure { node_id,
                                                        message: call_error.message,
                                                        retryable: call_error.retryable });
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.recorder.complete_node_state(&state.state_id,
                                          NodeStateStatus::Completed,
                                          Some(&result.row),
                                          Some(duration_ms),
                                          None,
                                          None)?;
        let updated_token = token.with_data(result.row);

        self.apply_action(&node_id,
                          &state.state_id,
                          updated_token,
                          &result.action,
                          token_manager)
    }

    /// Gate de configuración: evalúa la condición del lenguaje de expresiones
    /// contra la fila y resuelve por la tabla `routes`.
    pub fn execute_config_gate(&self,
                               settings: &GateSettings,
                               node_id: &str,
                               token: &TokenInfo,
                               step_in_pipeline: usize,
                               token_manager: Option<&TokenManager<'a, S>>)
                               -> Result<GateExecution, EngineError> {
        let _span = self.spans.start(format!("config_gate:{}", settings.name));
        let state = self.recorder.begin_node_state(&token.token_id,
                                                   node_id,
                                                   step_in_pipeline,
                                                   0,
                                                   &token.row_data)?;
        let started = Instant::now();

        let label = match expr::evaluate_to_label(&settings.condition, &token.row_data) {
            Ok(label) => label,
            Err(expr_error) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Failed,
                                                  None,
                                                  Some(duration_ms),
                                                  Some(json!({
                                                      "condition": settings.condition,
                                                      "error": expr_error.to_string(),
                                                  })),
                                                  None)?;
                return Err(EngineError::Expression(expr_error));
            }
        };

        let target = match settings.routes.get(&label) {
            Some(target) => target.clone(),
            None => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.recorder.complete_node_state(&state.state_id,
                                                  NodeStateStatus::Failed,
                                                  None,
                                                  Some(duration_ms),
                                                  Some(json!({
                                                      "condition": settings.condition,
                                                      "label": label,
                                                      "error": "label not present in routes",
                                                  })),
                                                  None)?;
                return Err(EngineError::MissingRoute { gate: settings.name.clone(), label });
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.recorder.complete_node_state(&state.state_id,
                                          NodeStateStatus::Completed,
                                          Some(&token.row_data),
                                          Some(duration_ms),
                                          None,
                                          None)?;

        // La razón auditable incluye la condición evaluada y su etiqueta.
        let reason = json!({
            "condition": settings.condition,
            "label": label,
            "target": target,
        });

        let action = match target.as_str() {
            "continue" => RoutingAction::Continue,
            "fork" => RoutingAction::ForkToPaths { branches: settings.fork_to.clone(),
                                                   reason: Some(reason) },
            _sink => RoutingAction::Route { labels: vec![label.clone()],
                                            reason: Some(reason) },
        };
        // Para rutas a sink de config gates la resolución es directa: el
        // target de la tabla ES el nombre del sink.
        if let RoutingAction::Route { ref labels, ref reason } = action {
            return self.route_to_sinks(node_id,
                                       &state.state_id,
                                       token.clone(),
                                       labels,
                                       reason.as_ref(),
                                       Some(target.clone()));
        }

        self.apply_action(node_id, &state.state_id, token.clone(), &action, token_manager)
    }

    fn apply_action(&self,
                    node_id: &str,
                    state_id: &str,
                    updated_token: TokenInfo,
                    action: &RoutingAction,
                    token_manager: Option<&TokenManager<'a, S>>)
                    -> Result<GateExecution, EngineError> {
        match action {
            RoutingAction::Continue => {
                // AUD: el paso por "continue" también queda en el trail si el
                // edge está registrado.
                if let Some(edge_id) =
                    self.edge_map.get(&(node_id.to_string(), "continue".to_string()))
                {
                    self.recorder.record_routing_event(state_id,
                                                       edge_id,
                                                       RoutingMode::Move,
                                                       None,
                                                       None)?;
                } else {
                    log::debug!("gate {node_id}: continue without registered edge");
                }
                Ok(GateExecution { action_kind: "continue",
                                   updated_token,
                                   sink_name: None,
                                   routed_sinks: Vec::new(),
                                   child_tokens: Vec::new(),
                                   fork_group_id: None,
                                   state_id: state_id.to_string() })
            }
            RoutingAction::Route { labels, reason } => self.route_to_sinks(node_id,
                                                                           state_id,
                                                                           updated_token,
                                                                           labels,
                                                                           reason.as_ref(),
                                                                           None),
            RoutingAction::ForkToPaths { branches, reason } => {
                let manager = token_manager.ok_or_else(|| EngineError::ContractViolation(
                    format!("gate at node {node_id} forked but no token manager was supplied; \
                             fork lineage cannot be recorded"),
                ))?;
                // Los edges de fork deben existir y ser COPY antes de crear
                // nada: fallar a mitad dejaría hijos sin routing events.
                let mut edge_ids = Vec::with_capacity(branches.len());
                for branch in branches {
                    edge_ids.push(self.edge_for(node_id, branch)?.clone());
                }
                let (children, fork_group_id) = manager.fork_token(&updated_token, branches)?;
                let routing_group_id = Uuid::new_v4().to_string();
                for edge_id in &edge_ids {
                    self.recorder.record_routing_event(state_id,
                                                       edge_id,
                                                       RoutingMode::Copy,
                                                       reason.as_ref(),
                                                       Some(routing_group_id.clone()))?;
                }
                Ok(GateExecution { action_kind: "fork_to_paths",
                                   updated_token,
                                   sink_name: None,
                                   routed_sinks: Vec::new(),
                                   child_tokens: children,
                                   fork_group_id: Some(fork_group_id),
                                   state_id: state_id.to_string() })
            }
        }
    }

    fn route_to_sinks(&self,
                      node_id: &str,
                      state_id: &str,
                      updated_token: TokenInfo,
                      labels: &[String],
                      reason: Option<&Value>,
                      direct_sink: Option<String>)
                      -> Result<GateExecution, EngineError> {
        let mut routed_sinks = Vec::with_capacity(labels.len());
        for label in labels {
            let sink_name = match &direct_sink {
                Some(sink) => sink.clone(),
                None => self.route_resolution
                            .get(&(node_id.to_string(), label.clone()))
                            .cloned()
                            .ok_or_else(|| EngineError::MissingEdge {
                                node_id: node_id.to_string(),
                                label: label.clone(),
                            })?,
            };
            let edge_id = self.edge_for(node_id, label)?;
            self.recorder.record_routing_event(state_id,
                                               edge_id,
                                               RoutingMode::Move,
                                               reason,
                                               None)?;
            routed_sinks.push(sink_name);
        }
        Ok(GateExecution { action_kind: "route",
                           sink_name: routed_sinks.first().cloned(),
                           updated_token,
                           routed_sinks,
                           child_tokens: Vec::new(),
                           fork_group_id: None,
                           state_id: state_id.to_string() })
    }
}
