//! cauce-persistence
//!
//! Backend Postgres (Diesel) del `AuditStore` de cauce-core. Objetivo:
//! paridad 1:1 con el backend en memoria (mismos invariantes, con unique
//! constraints como barrera de corrección, y mismos órdenes de lectura)
//! más durabilidad y consultas desde fuera del proceso.
//!
//! Módulos:
//! - `pg`: `PgStore` y utilidades de pool/retry.
//! - `schema`: tablas Diesel del ledger.
//! - `migrations`: runner embebido de migraciones.
//! - `config`: carga de configuración desde `.env`.
//! - `error`: mapeo de errores Diesel a variantes semánticas.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, PgPayloadStore, PgPool, PgStore};
