//! cauce-adapters: plugins incluidos para demos y tests.
//!
//! Implementaciones concretas de los contratos de `cauce-core`: sources
//! estáticos y JSONL, transforms aritméticos/validadores/batch, gates de
//! umbral y split, sinks de colección en memoria y JSONL. El catálogo real
//! de plugins de producción es un colaborador externo; esto es lo mínimo
//! para ejercitar el runtime de punta a punta.

pub mod gates;
pub mod sinks;
pub mod sources;
pub mod transforms;

pub use gates::{SplitterGate, ThresholdGate};
pub use sinks::{CollectSink, JsonlSink};
pub use sources::{JsonlSource, StaticSource};
pub use transforms::{BatchSum, FieldEnricher, RangeValidator, Scale, SplitRows};
