//! Contexto tipado entregado a cada llamada de plugin.
//!
//! Sustituye cualquier estado ambiente global: todo lo que un plugin necesita
//! del runtime viaja acá. El `state_id` identifica el node_state en curso,
//! útil para caches propias del plugin (p.ej. clientes LLM).

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct PluginContext {
    pub run_id: String,
    pub config: Value,
    pub state_id: Option<String>,
}

impl PluginContext {
    pub fn new(run_id: impl Into<String>, config: Value) -> Self {
        Self { run_id: run_id.into(), config, state_id: None }
    }

    /// Copia del contexto anotada con el node_state actual.
    pub fn for_state(&self, state_id: &str) -> Self {
        Self { run_id: self.run_id.clone(),
               config: self.config.clone(),
               state_id: Some(state_id.to_string()) }
    }
}
