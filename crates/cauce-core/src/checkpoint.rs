//! Checkpoint de estado de agregación en fronteras durables.
//!
//! Un checkpoint representa SALIDA DURABLE: se guarda después de que el sink
//! escribió, nunca durante el loop principal. Si el sink falla, no hay
//! checkpoint para ese cohort y las filas no escritas se reprocesan al
//! reanudar.
//!
//! El archivo es JSON versionado (escritura atómica vía tmp + rename); una
//! versión desconocida al cargar es un error duro.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::{json, Value};

use crate::constants::CHECKPOINT_STATE_VERSION;
use crate::contracts::CheckpointSettings;
use crate::errors::EngineError;

pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(settings: CheckpointSettings) -> Self {
        Self { path: settings.path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Persiste el estado de buffers de agregación bajo el sobre versionado.
    pub fn save(&self, run_id: &str, aggregation_state: &Value) -> Result<(), EngineError> {
        let envelope = json!({
            "version": CHECKPOINT_STATE_VERSION,
            "run_id": run_id,
            "saved_at": Utc::now().to_rfc3339(),
            "aggregations": aggregation_state,
        });
        let serialized = serde_json::to_string_pretty(&envelope)
            .map_err(|e| EngineError::InvariantViolation(format!(
                "checkpoint state is not serializable: {e}"
            )))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized).map_err(|e| EngineError::InvariantViolation(format!(
            "checkpoint write failed: {e}"
        )))?;
        fs::rename(&tmp, &self.path).map_err(|e| EngineError::InvariantViolation(format!(
            "checkpoint rename failed: {e}"
        )))?;
        log::debug!("checkpoint saved at {}", self.path.display());
        Ok(())
    }

    /// Carga el estado de agregaciones, si existe un checkpoint.
    pub fn load(&self) -> Result<Option<Value>, EngineError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| EngineError::InvariantViolation(format!(
                "checkpoint read failed: {e}"
            )))?;
        let envelope: Value = serde_json::from_str(&raw)
            .map_err(|e| EngineError::InvariantViolation(format!(
                "checkpoint is not valid JSON: {e}"
            )))?;
        let version = envelope.get("version").and_then(Value::as_u64);
        if version != Some(CHECKPOINT_STATE_VERSION as u64) {
            return Err(EngineError::InvariantViolation(format!(
                "unknown checkpoint version {version:?} (expected {CHECKPOINT_STATE_VERSION})"
            )));
        }
        Ok(envelope.get("aggregations").cloned())
    }
}
