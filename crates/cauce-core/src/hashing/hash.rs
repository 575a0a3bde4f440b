//! Hash blake3 (hex) sobre JSON canónico.

use serde_json::Value;

use super::to_canonical_json;

/// Hash hex de un valor JSON en su forma canónica.
pub fn hash_value(value: &Value) -> String {
    hash_str(&to_canonical_json(value))
}

/// Hash hex de un string arbitrario.
pub fn hash_str(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}
