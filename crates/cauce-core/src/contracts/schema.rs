//! Contrato de schema declarado por un plugin.
//!
//! El runtime no valida filas contra el schema (eso es responsabilidad de
//! capas externas); sólo lo snapshotea en el registro del nodo para que el
//! audit trail conserve qué contrato declaraba cada plugin en ese run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaFields {
    /// Campos libres: el plugin acepta/produce cualquier forma de objeto.
    Dynamic,
    /// Lista cerrada de campos declarados.
    Fixed(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub fields: SchemaFields,
}

impl SchemaConfig {
    pub fn dynamic() -> Self {
        Self { fields: SchemaFields::Dynamic }
    }

    pub fn fixed(fields: Vec<String>) -> Self {
        Self { fields: SchemaFields::Fixed(fields) }
    }

    /// Snapshot JSON que se persiste junto al nodo.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
