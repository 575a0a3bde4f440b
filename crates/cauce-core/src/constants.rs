//! Constantes globales del runtime.

/// Versión del motor. Participa en el snapshot de configuración del run y
/// permite detectar replays contra versiones incompatibles.
pub const ENGINE_VERSION: &str = "cauce-core/0.1.0";

/// Cota superior de iteraciones de la work queue por fila de source.
/// Superarla es una violación de invariante (loop atrapado > hang silencioso).
pub const MAX_WORK_QUEUE_ITERATIONS: usize = 10_000;

/// Versión del estado de checkpoint serializado. Una versión desconocida al
/// restaurar es un error duro, nunca un best-effort.
pub const CHECKPOINT_STATE_VERSION: u32 = 1;
