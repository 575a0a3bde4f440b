//! Sinks incluidos: colección en memoria y JSONL a disco.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use sha2::{Digest, Sha256};

use cauce_core::contracts::{
    ArtifactDescriptor, NodeId, PluginCallError, PluginContext, SinkPlugin,
};
use cauce_core::hashing::hash_value;

/// Sink que acumula filas en memoria. El handle compartido permite a los
/// tests inspeccionar lo entregado después del run.
pub struct CollectSink {
    name: String,
    node_id: Option<NodeId>,
    rows: Arc<Mutex<Vec<Value>>>,
}

impl CollectSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(),
               node_id: None,
               rows: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Handle a las filas recibidas (vivo aun después de mover el sink).
    pub fn handle(&self) -> Arc<Mutex<Vec<Value>>> {
        Arc::clone(&self.rows)
    }
}

impl SinkPlugin for CollectSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn bind_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn write(&mut self,
             rows: &[Value],
             _ctx: &PluginContext)
             -> Result<ArtifactDescriptor, PluginCallError> {
        let mut collected = self.rows.lock().expect("collect sink poisoned");
        collected.extend(rows.iter().cloned());
        let content_hash = hash_value(&Value::Array(rows.to_vec()));
        Ok(ArtifactDescriptor::for_uri(format!("memory://{}", self.name),
                                       rows.len() as u64,
                                       content_hash,
                                       "memory"))
    }
}

/// Sink JSONL: apendea una línea por fila y devuelve el descriptor con el
/// sha256 del contenido agregado en esta escritura.
pub struct JsonlSink {
    name: String,
    node_id: Option<NodeId>,
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), node_id: None, path: path.into() }
    }
}

impl SinkPlugin for JsonlSink {
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
        let mut buffer = String::new();
        for row in rows {
            buffer.push_str(&serde_json::to_string(row).map_err(|e| {
                PluginCallError::fatal(format!("serializing row: {e}"))
            })?);
            buffer.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PluginCallError::retryable(format!(
                "opening {}: {e}", self.path.display()
            )))?;
        file.write_all(buffer.as_bytes())
            .map_err(|e| PluginCallError::retryable(format!(
                "writing {}: {e}", self.path.display()
            )))?;

        let mut hasher = Sha256::new();
        hasher.update(buffer.as_bytes());
        let content_hash = format!("{:x}", hasher.finalize());

        Ok(ArtifactDescriptor::for_file(&self.path.to_string_lossy(),
                                        buffer.len() as u64,
                                        content_hash))
    }
}
