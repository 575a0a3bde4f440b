//! Settings deserializables que parametrizan el runtime.
//!
//! Quién parsea YAML/archivos es un colaborador externo; acá sólo se definen
//! las formas tipadas que el motor consume.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Disparadores de flush de una agregación. Cualquiera que se cumpla primero
/// dispara; el fin de source siempre dispara.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub size_bytes: Option<usize>,
}

impl TriggerConfig {
    pub fn by_count(count: usize) -> Self {
        Self { count: Some(count), ..Default::default() }
    }
}

/// Modo de salida de una agregación.
///
/// - `Transform`: los inputs terminan CONSUMED_IN_BATCH y las salidas son
///   tokens NUEVOS (el plugin declara `creates_tokens = true`).
/// - `Passthrough`: N entran, N salen, MISMOS token_ids, en el mismo orden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    Transform,
    Passthrough,
}

/// Configuración estructural de agregación adjunta a un node_id. La
/// agregación no es un tipo de plugin: es un transform batch-aware más esto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    pub name: String,
    pub trigger: TriggerConfig,
    pub mode: AggregationMode,
}

/// Gate dirigido por configuración: una condición del lenguaje de expresiones
/// y una tabla `routes` de etiqueta → destino ("continue", "fork" o nombre
/// de sink).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    pub name: String,
    pub condition: String,
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub fork_to: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    RequireAll,
    BestEffort,
    Quorum,
    First,
}

impl CoalescePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoalescePolicy::RequireAll => "require_all",
            CoalescePolicy::BestEffort => "best_effort",
            CoalescePolicy::Quorum => "quorum",
            CoalescePolicy::First => "first",
        }
    }
}

/// Estrategia de merge al coalescer ramas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Superposición de campos en orden de llegada.
    Union,
    /// Un objeto `{ branch_name: fila }` por rama llegada.
    Nested,
    /// Union, pero los campos de la rama primaria pisan al resto.
    PreferPrimary,
    /// Sólo la fila de la rama seleccionada; si no llegó, el grupo falla.
    Select,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceSettings {
    pub name: String,
    pub branches: Vec<String>,
    pub policy: CoalescePolicy,
    pub merge: MergeStrategy,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub quorum_count: Option<usize>,
    #[serde(default)]
    pub primary_branch: Option<String>,
    #[serde(default)]
    pub select_branch: Option<String>,
}

/// Parámetros de backoff exponencial con jitter del RetryManager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3,
               base_delay: 1.0,
               max_delay: 60.0,
               exponential_base: 2.0,
               jitter: 1.0 }
    }
}

/// Dónde persiste el CheckpointManager su estado versionado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    pub path: PathBuf,
}
