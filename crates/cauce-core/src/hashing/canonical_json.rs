//! JSON canónico mínimo: claves de objeto ordenadas, arrays en su orden.
//!
//! Notas:
//! - Los números usan la representación por defecto de serde_json (no usar
//!   NaN/Inf en payloads del pipeline).
//! - Strings se serializan con serde_json para escapar correctamente.

use serde_json::Value;
use std::collections::BTreeMap;

pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let ordered: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, to_canonical_json(v))).collect();
            let parts: Vec<String> = ordered
                .into_iter()
                .map(|(k, v)| {
                    format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), v)
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}
