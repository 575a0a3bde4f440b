//! Sources incluidos: estático (en memoria) y JSONL.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;

use cauce_core::contracts::{PluginCallError, PluginContext, SourcePlugin, SourceRow};

/// Source acotado sobre un Vec de filas ya materializadas. Ideal para tests
/// y demos; las filas inválidas se declaran explícitamente.
pub struct StaticSource {
    name: String,
    rows: Vec<SourceRow>,
}

impl StaticSource {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { name: "static".to_string(),
               rows: rows.into_iter().map(SourceRow::valid).collect() }
    }

    pub fn with_rows(rows: Vec<SourceRow>) -> Self {
        Self { name: "static".to_string(), rows }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl SourcePlugin for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginCallError> {
        Ok(std::mem::take(&mut self.rows))
    }
}

/// Source JSONL: una fila por línea. Las líneas que no parsean se emiten
/// como inválidas con la razón, no se pierden en silencio.
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourcePlugin for JsonlSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn load(&mut self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginCallError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            PluginCallError::retryable(format!("reading {}: {e}", self.path.display()))
        })?;
        let mut rows = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => rows.push(SourceRow::valid(value)),
                Err(e) => rows.push(SourceRow::invalid(serde_json::json!({
                    "reason": "invalid_json",
                    "line": line_no + 1,
                    "error": e.to_string(),
                }))),
            }
        }
        Ok(rows)
    }
}
