//! Almacén de payloads direccionado por contenido.
//!
//! El hash es el ancla de auditoría: sobrevive a una purga de payloads. El
//! backend es pluggable; el runtime sólo hace `put` al hashear y `get` en
//! consultas de lineage cuando el payload inline fue purgado.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

pub trait PayloadStore: Send + Sync {
    fn put(&self, hash: &str, payload: &Value);

    fn get(&self, hash: &str) -> Option<Value>;
}

/// Implementación en memoria, deduplicada por hash.
#[derive(Default)]
pub struct MemoryPayloadStore {
    inner: Mutex<HashMap<String, Value>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("payload store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn put(&self, hash: &str, payload: &Value) {
        let mut map = self.inner.lock().expect("payload store poisoned");
        map.entry(hash.to_string()).or_insert_with(|| payload.clone());
    }

    fn get(&self, hash: &str) -> Option<Value> {
        self.inner.lock().expect("payload store poisoned").get(hash).cloned()
    }
}
