//! RetryManager: backoff exponencial con jitter sobre fallos clasificados.
//!
//! Acepta una clausura falible que recibe el número de intento (0-based) y
//! devuelve éxito o un `EngineError` ya clasificado. Sólo los errores con
//! `is_retryable()` se reintentan; el resto propaga de inmediato. El
//! agotamiento levanta `MaxRetriesExceeded`, que el procesador mapea a
//! outcome FAILED.

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::contracts::RetrySettings;
use crate::errors::EngineError;

pub struct RetryManager {
    settings: RetrySettings,
}

impl RetryManager {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Delay del intento dado: `base * exp_base^attempt`, acotado por
    /// `max_delay`, más jitter uniforme en `[0, jitter)`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.settings.base_delay
                  * self.settings.exponential_base.powi(attempt as i32);
        let capped = exp.min(self.settings.max_delay);
        let jitter = if self.settings.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.settings.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }

    /// Ejecuta la operación con reintentos. La clausura recibe el número de
    /// intento para que cada uno audite su propio node_state.
    pub fn execute<T, F>(&self, mut op: F) -> Result<T, EngineError>
        where F: FnMut(u32) -> Result<T, EngineError>
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempt + 1 >= max_attempts {
                        return Err(EngineError::MaxRetriesExceeded {
                            attempts: max_attempts,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    log::warn!("retryable failure (attempt {}): {} -> backing off {:?}",
                               attempt,
                               err,
                               delay);
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
