//! Fábrica de spans abstracta.
//!
//! El runtime emite spans contra esta seam; los exporters reales (OTel u
//! otros) viven fuera del core. El default mide duración y la deja en el log
//! a nivel trace.

use std::time::Instant;

/// Backend de exportación de spans.
pub trait SpanExporter: Send + Sync {
    fn export(&self, name: &str, duration_ms: u64);
}

pub struct SpanFactory {
    exporter: Option<Box<dyn SpanExporter>>,
}

impl SpanFactory {
    /// Fábrica sin exporter: sólo logging.
    pub fn noop() -> Self {
        Self { exporter: None }
    }

    pub fn with_exporter(exporter: Box<dyn SpanExporter>) -> Self {
        Self { exporter: Some(exporter) }
    }

    /// Abre un span; se cierra (y exporta) al soltar el guard.
    pub fn start(&self, name: impl Into<String>) -> Span<'_> {
        Span { name: name.into(),
               started: Instant::now(),
               factory: self }
    }
}

impl Default for SpanFactory {
    fn default() -> Self {
        Self::noop()
    }
}

pub struct Span<'a> {
    name: String,
    started: Instant,
    factory: &'a SpanFactory,
}

impl Drop for Span<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        match &self.factory.exporter {
            Some(exporter) => exporter.export(&self.name, elapsed),
            None => log::trace!("span {} took {}ms", self.name, elapsed),
        }
    }
}
