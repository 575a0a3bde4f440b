//! Shared helpers for engine integration tests: an in-memory recorder plus
//! closure-backed plugin stubs so each test can declare its pipeline inline.
#![allow(dead_code)] // each test binary uses a different subset

use serde_json::Value;

use cauce_core::contracts::{
    ErrorDisposition, GatePlugin, GateResult, NodeId, NodeKind, PluginCallError, PluginContext,
    SchemaConfig, SinkPlugin, SourcePlugin, SourceRow, TransformPlugin, TransformResult,
    ArtifactDescriptor,
};
use cauce_core::recorder::{MemoryStore, NodeRecord, Recorder, RunRecord};

pub fn recorder() -> Recorder<MemoryStore> {
    Recorder::new(MemoryStore::new())
}

pub fn begin_run(recorder: &Recorder<MemoryStore>) -> RunRecord {
    recorder.begin_run(serde_json::json!({}), "v1").expect("begin_run")
}

pub fn register_node(recorder: &Recorder<MemoryStore>,
                     run_id: &str,
                     plugin_name: &str,
                     kind: NodeKind)
                     -> NodeRecord {
    recorder.register_node(run_id,
                           plugin_name,
                           kind,
                           "1.0",
                           serde_json::json!({}),
                           &SchemaConfig::dynamic())
            .expect("register_node")
}

type ProcessFn = Box<dyn FnMut(&Value) -> Result<TransformResult, PluginCallError>>;
type BatchFn = Box<dyn FnMut(&[Value]) -> Result<TransformResult, PluginCallError>>;

/// Transform stub driven by closures; capabilities are plain fields.
pub struct FnTransform {
    name: String,
    node_id: Option<NodeId>,
    on_error: Option<ErrorDisposition>,
    creates_tokens: bool,
    batch_aware: bool,
    process: ProcessFn,
    process_batch: Option<BatchFn>,
}

impl FnTransform {
    pub fn new(name: &str,
               node_id: &str,
               process: impl FnMut(&Value) -> Result<TransformResult, PluginCallError> + 'static)
               -> Self {
        Self { name: name.to_string(),
               node_id: Some(node_id.to_string()),
               on_error: None,
               creates_tokens: false,
               batch_aware: false,
               process: Box::new(process),
               process_batch: None }
    }

    pub fn discarding(mut self) -> Self {
        self.on_error = Some(ErrorDisposition::Discard);
        self
    }

    pub fn routing_errors_to(mut self, sink: &str) -> Self {
        self.on_error = Some(ErrorDisposition::Sink(sink.to_string()));
        self
    }

    pub fn creating_tokens(mut self) -> Self {
        self.creates_tokens = true;
        self
    }

    pub fn batch_aware(mut self,
                       f: impl FnMut(&[Value]) -> Result<TransformResult, PluginCallError>
                           + 'static)
                       -> Self {
        self.batch_aware = true;
        self.process_batch = Some(Box::new(f));
        self
    }
}

impl TransformPlugin for FnTransform {
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
        self.batch_aware
    }

    fn creates_tokens(&self) -> bool {
        self.creates_tokens
    }

    fn on_error(&self) -> Option<ErrorDisposition> {
        self.on_error.clone()
    }

    fn process(&mut self,
               row: &Value,
               _ctx: &PluginContext)
               -> Result<TransformResult, PluginCallError> {
        (self.process)(row)
    }

    fn process_batch(&mut self,
                     rows: &[Value],
                     _ctx: &PluginContext)
                     -> Result<TransformResult, PluginCallError> {
        match &mut self.process_batch {
            Some(f) => f(rows),
            None => Err(PluginCallError::fatal(format!(
                "transform {} has no batch closure", self.name
            ))),
        }
    }
}

type EvaluateFn = Box<dyn FnMut(&Value) -> Result<GateResult, PluginCallError>>;

pub struct FnGate {
    name: String,
    node_id: Option<NodeId>,
    evaluate: EvaluateFn,
}

impl FnGate {
    pub fn new(name: &str,
               node_id: &str,
               evaluate: impl FnMut(&Value) -> Result<GateResult, PluginCallError> + 'static)
               -> Self {
        Self { name: name.to_string(),
               node_id: Some(node_id.to_string()),
               evaluate: Box::new(evaluate) }
    }
}

impl GatePlugin for FnGate {
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
        (self.evaluate)(row)
    }
}

/// List-backed source for orchestrator tests.
pub struct ListSource {
    rows: Vec<SourceRow>,
}

impl ListSource {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows: rows.into_iter().map(SourceRow::valid).collect() }
    }

    pub fn with_rows(rows: Vec<SourceRow>) -> Self {
        Self { rows }
    }
}

impl SourcePlugin for ListSource {
    fn name(&self) -> &str {
        "list_source"
    }

    fn load(&mut self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginCallError> {
        Ok(std::mem::take(&mut self.rows))
    }
}

/// Source that fails on load, for SOURCE-phase attribution tests.
pub struct ExplodingSource;

impl SourcePlugin for ExplodingSource {
    fn name(&self) -> &str {
        "exploding_source"
    }

    fn load(&mut self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginCallError> {
        Err(PluginCallError::fatal("source exploded"))
    }
}

/// Collecting sink with a shared handle for post-run assertions.
pub struct TestSink {
    name: String,
    node_id: Option<NodeId>,
    rows: std::sync::Arc<std::sync::Mutex<Vec<Value>>>,
    fail: bool,
}

impl TestSink {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(),
               node_id: None,
               rows: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
               fail: false }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<Value>>> {
        std::sync::Arc::clone(&self.rows)
    }
}

impl SinkPlugin for TestSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn write(&mut self,
             rows: &[Value],
             _ctx: &PluginContext)
             -> Result<ArtifactDescriptor, PluginCallError> {
        if self.fail {
            return Err(PluginCallError::fatal("sink exploded"));
        }
        self.rows.lock().unwrap().extend(rows.iter().cloned());
        Ok(ArtifactDescriptor::for_uri(format!("memory://{}", self.name),
                                       rows.len() as u64,
                                       "test",
                                       "memory"))
    }
}
