//! Transforms incluidos.
//!
//! Cubren las formas de contrato que el runtime distingue: passthrough
//! simple, error de datos con on_error, batch-aware (agregación) y
//! multi-fila (expansión de tokens).

use serde_json::{json, Map, Value};

use cauce_core::contracts::{
    ErrorDisposition, NodeId, PluginCallError, PluginContext, TransformPlugin, TransformResult,
};

/// Multiplica un campo numérico por un factor.
pub struct Scale {
    name: String,
    node_id: Option<NodeId>,
    field: String,
    factor: f64,
    offset: f64,
}

impl Scale {
    pub fn new(field: impl Into<String>, factor: f64) -> Self {
        Self { name: "scale".to_string(),
               node_id: None,
               field: field.into(),
               factor,
               offset: 0.0 }
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl TransformPlugin for Scale {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn process(&mut self,
               row: &Value,
               _ctx: &PluginContext)
               -> Result<TransformResult, PluginCallError> {
        let current = row.get(&self.field).and_then(Value::as_f64).unwrap_or(0.0);
        let mut out = row.as_object().cloned().unwrap_or_default();
        let scaled = current * self.factor + self.offset;
        // Enteros se mantienen enteros si el resultado lo permite.
        let value = if scaled.fract() == 0.0 {
            json!(scaled as i64)
        } else {
            json!(scaled)
        };
        out.insert(self.field.clone(), value);
        Ok(TransformResult::success(Value::Object(out)))
    }
}

/// Agrega campos constantes a cada fila.
pub struct FieldEnricher {
    name: String,
    node_id: Option<NodeId>,
    fields: Map<String, Value>,
}

impl FieldEnricher {
    pub fn new(name: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self { name: name.into(), node_id: None, fields }
    }
}

impl TransformPlugin for FieldEnricher {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn process(&mut self,
               row: &Value,
               _ctx: &PluginContext)
               -> Result<TransformResult, PluginCallError> {
        let mut out = row.as_object().cloned().unwrap_or_default();
        for (k, v) in &self.fields {
            out.insert(k.clone(), v.clone());
        }
        Ok(TransformResult::success(Value::Object(out)))
    }
}

/// Valida que un campo numérico esté en rango; fuera de rango devuelve un
/// error de datos (ruteado según `on_error`).
pub struct RangeValidator {
    name: String,
    node_id: Option<NodeId>,
    field: String,
    min: f64,
    on_error: Option<ErrorDisposition>,
}

impl RangeValidator {
    pub fn new(field: impl Into<String>, min: f64) -> Self {
        Self { name: "range_validator".to_string(),
               node_id: None,
               field: field.into(),
               min,
               on_error: None }
    }

    pub fn discarding(mut self) -> Self {
        self.on_error = Some(ErrorDisposition::Discard);
        self
    }

    pub fn routing_to(mut self, sink: impl Into<String>) -> Self {
        self.on_error = Some(ErrorDisposition::Sink(sink.into()));
        self
    }
}

impl TransformPlugin for RangeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn on_error(&self) -> Option<ErrorDisposition> {
        self.on_error.clone()
    }

    fn process(&mut self,
               row: &Value,
               _ctx: &PluginContext)
               -> Result<TransformResult, PluginCallError> {
        let value = row.get(&self.field).and_then(Value::as_f64).unwrap_or(f64::MIN);
        if value < self.min {
            return Ok(TransformResult::error(json!({
                "reason": "validation_failed",
                "field": self.field,
                "value": value,
                "min": self.min,
            })));
        }
        Ok(TransformResult::success(row.clone()))
    }
}

/// Agregación batch-aware en modo transform: suma un campo del batch y
/// emite una única fila `{total, count}` como token NUEVO.
pub struct BatchSum {
    name: String,
    node_id: Option<NodeId>,
    field: String,
}

impl BatchSum {
    pub fn new(field: impl Into<String>) -> Self {
        Self { name: "batch_sum".to_string(), node_id: None, field: field.into() }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl TransformPlugin for BatchSum {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn creates_tokens(&self) -> bool {
        true
    }

    fn process(&mut self,
               row: &Value,
               _ctx: &PluginContext)
               -> Result<TransformResult, PluginCallError> {
        // Modo fila única (sin AggregationSettings registrados): identidad.
        Ok(TransformResult::success(row.clone()))
    }

    fn process_batch(&mut self,
                     rows: &[Value],
                     _ctx: &PluginContext)
                     -> Result<TransformResult, PluginCallError> {
        let total: f64 = rows.iter()
                             .filter_map(|r| r.get(&self.field).and_then(Value::as_f64))
                             .sum();
        let value = if total.fract() == 0.0 { json!(total as i64) } else { json!(total) };
        Ok(TransformResult::success(json!({
            "total": value,
            "count": rows.len(),
        })))
    }
}

/// Transform multi-fila: parte un array en una fila por elemento (expansión
/// de tokens; declara `creates_tokens`).
pub struct SplitRows {
    name: String,
    node_id: Option<NodeId>,
    field: String,
}

impl SplitRows {
    pub fn new(field: impl Into<String>) -> Self {
        Self { name: "split_rows".to_string(), node_id: None, field: field.into() }
    }
}

impl TransformPlugin for SplitRows {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn creates_tokens(&self) -> bool {
        true
    }

    fn process(&mut self,
               row: &Value,
               _ctx: &PluginContext)
               -> Result<TransformResult, PluginCallError> {
        let items = row.get(&self.field).and_then(Value::as_array).cloned().unwrap_or_default();
        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            let mut out = row.as_object().cloned().unwrap_or_default();
            out.remove(&self.field);
            out.insert("item".to_string(), item);
            rows.push(Value::Object(out));
        }
        Ok(TransformResult::success_multi(rows))
    }
}
