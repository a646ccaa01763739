//! Phase lifecycle events.

use std::time::Duration;

use tracing::{error, info};

/// What happened to a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Started,
    /// Skipped because every output was already committed.
    Resumed,
    Finished { elapsed: Duration },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: &'static str,
    pub label: &'static str,
    pub kind: EventKind,
    /// RFC 3339, UTC.
    pub at: String,
}

/// Receives phase events. Observers cannot influence the run.
pub trait PhaseObserver {
    fn on_event(&mut self, event: &PhaseEvent);
}

/// Reports events through `tracing`.
#[derive(Debug, Default)]
pub struct LogObserver;

impl PhaseObserver for LogObserver {
    fn on_event(&mut self, event: &PhaseEvent) {
        let phase = event.phase;
        match &event.kind {
            EventKind::Started => info!(phase, at = %event.at, "{}...", event.label),
            EventKind::Resumed => info!(phase, "{}: already done, skipping", event.label),
            EventKind::Finished { elapsed } => info!(
                phase,
                elapsed_secs = elapsed.as_secs_f64(),
                "{}: done",
                event.label
            ),
            EventKind::Failed { error } => error!(phase, at = %event.at, %error, "{}: failed", event.label),
        }
    }
}

/// Collects events, for callers that want the whole history.
impl PhaseObserver for Vec<PhaseEvent> {
    fn on_event(&mut self, event: &PhaseEvent) {
        self.push(event.clone());
    }
}
