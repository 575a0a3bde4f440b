//! Eventos de fase del pipeline.
//!
//! El orquestador emite exactamente un `PhaseError` por run fallido,
//! atribuido a la fase que levantó el primer error fatal. El bus es local al
//! proceso: quien quiera exportarlo (exit codes, telemetría) se suscribe.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Source,
    Process,
    Sink,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Source => "source",
            PipelinePhase::Process => "process",
            PipelinePhase::Sink => "sink",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PhaseError {
    pub phase: PipelinePhase,
    pub error: String,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted { run_id: String },
    PhaseError(PhaseError),
    RunCompleted { run_id: String, failed: bool },
}

type Subscriber = Box<dyn Fn(&PipelineEvent)>;

/// Bus mínimo de suscripción por clausura.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(&PipelineEvent) + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn emit(&self, event: &PipelineEvent) {
        for subscriber in &self.subscribers {
            subscriber(event);
        }
    }
}
