//! Gates plugin incluidos.

use serde_json::{json, Value};

use cauce_core::contracts::{
    GatePlugin, GateResult, NodeId, PluginCallError, PluginContext, RoutingAction,
};

/// Rutea por umbral: por encima va a la etiqueta `above`, si no continúa.
pub struct ThresholdGate {
    name: String,
    node_id: Option<NodeId>,
    field: String,
    threshold: f64,
    above_label: String,
}

impl ThresholdGate {
    pub fn new(field: impl Into<String>, threshold: f64, above_label: impl Into<String>) -> Self {
        Self { name: "threshold_gate".to_string(),
               node_id: None,
               field: field.into(),
               threshold,
               above_label: above_label.into() }
    }
}

impl GatePlugin for ThresholdGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn evaluate(&mut self,
                row: &Value,
                _ctx: &PluginContext)
                -> Result<GateResult, PluginCallError> {
        let value = row.get(&self.field).and_then(Value::as_f64).unwrap_or(0.0);
        if value > self.threshold {
            return Ok(GateResult { row: row.clone(),
                                   action: RoutingAction::route(
                                       self.above_label.clone(),
                                       Some(json!({
                                           "threshold_exceeded": true,
                                           "value": value,
                                       })),
                                   ) });
        }
        Ok(GateResult { row: row.clone(), action: RoutingAction::continue_() })
    }
}

/// Forkea cada fila a un conjunto fijo de ramas paralelas.
pub struct SplitterGate {
    name: String,
    node_id: Option<NodeId>,
    branches: Vec<String>,
}

impl SplitterGate {
    pub fn new(branches: Vec<String>) -> Self {
        Self { name: "splitter".to_string(), node_id: None, branches }
    }
}

impl GatePlugin for SplitterGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn evaluate(&mut self,
                row: &Value,
                _ctx: &PluginContext)
                -> Result<GateResult, PluginCallError> {
        Ok(GateResult { row: row.clone(),
                        action: RoutingAction::fork_to_paths(
                            self.branches.clone(),
                            Some(json!({ "split": "parallel" })),
                        ) })
    }
}
