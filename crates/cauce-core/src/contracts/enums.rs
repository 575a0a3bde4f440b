//! Enumeraciones estables del modelo de datos.
//!
//! Los `as_str` producen las formas en minúsculas que se persisten en el
//! ledger; cambiarlas rompe la compatibilidad de runs históricos.

use serde::{Deserialize, Serialize};

/// Tipo de vértice del DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Source,
    Transform,
    Gate,
    Aggregation,
    Coalesce,
    Sink,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Transform => "transform",
            NodeKind::Gate => "gate",
            NodeKind::Aggregation => "aggregation",
            NodeKind::Coalesce => "coalesce",
            NodeKind::Sink => "sink",
        }
    }
}

/// Modo de un edge: flujo normal (MOVE), duplicación en fork (COPY) o
/// desvío de errores (DIVERT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Move,
    Copy,
    Divert,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Move => "move",
            RoutingMode::Copy => "copy",
            RoutingMode::Divert => "divert",
        }
    }
}

/// Estado de un run. Se transiciona exactamente una vez a un estado terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Running
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// El único estado terminal de un token. Exactamente uno por token, siempre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Completed,
    Routed,
    Quarantined,
    Failed,
    Forked,
    Coalesced,
    ConsumedInBatch,
    Buffered,
    Expanded,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Completed => "completed",
            RowOutcome::Routed => "routed",
            RowOutcome::Quarantined => "quarantined",
            RowOutcome::Failed => "failed",
            RowOutcome::Forked => "forked",
            RowOutcome::Coalesced => "coalesced",
            RowOutcome::ConsumedInBatch => "consumed_in_batch",
            RowOutcome::Buffered => "buffered",
            RowOutcome::Expanded => "expanded",
        }
    }
}

/// Estado de un node_state: abierto al comenzar el intento, cerrado como
/// completed/failed al terminar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStateStatus {
    Open,
    Completed,
    Failed,
}

impl NodeStateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStateStatus::Open => "open",
            NodeStateStatus::Completed => "completed",
            NodeStateStatus::Failed => "failed",
        }
    }
}

/// Ciclo de vida de un batch de agregación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Open,
    Flushing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "open",
            BatchStatus::Flushing => "flushing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Determinismo declarado por un transform. Informativo para el audit trail;
/// el runtime no lo usa para cachear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    Deterministic,
    NonDeterministic,
}

impl Determinism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Determinism::Deterministic => "deterministic",
            Determinism::NonDeterministic => "non_deterministic",
        }
    }
}
