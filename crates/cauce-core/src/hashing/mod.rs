//! Canonicalización JSON y helpers de hash.
//!
//! Todo hash del audit trail (payloads de filas, razones de error, snapshots
//! de configuración) se calcula sobre la forma canónica del JSON, de modo que
//! el hash sea estable ante reordenamientos de claves.

mod canonical_json;
mod hash;

pub use canonical_json::to_canonical_json;
pub use hash::{hash_str, hash_value};
