//! Unit execution reporting

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::pipeline::ExecutionOutcome;
use crate::unit::UnitId;

/// Events emitted while units execute
#[derive(Debug, Clone)]
pub enum UnitEvent {
    /// A unit's attempt is starting
    Started { id: UnitId, description: String },
    /// A unit's action produced output
    Output {
        id: UnitId,
        line: String,
        is_stderr: bool,
    },
    /// A unit reached a non-failed outcome
    Finished {
        id: UnitId,
        outcome: ExecutionOutcome,
        duration: Duration,
    },
    /// A unit failed
    Failed {
        id: UnitId,
        duration: Duration,
        error: String,
    },
    /// A unit was not attempted
    Skipped { id: UnitId, reason: String },
    /// All units completed
    AllCompleted {
        total: usize,
        executed: usize,
        up_to_date: usize,
        from_cache: usize,
        no_source: usize,
        failed: usize,
        skipped: usize,
        duration: Duration,
    },
}

/// Trait for reporting unit execution progress
pub trait UnitReporter: Send + Sync {
    /// Handle a unit event
    fn report(&self, event: &UnitEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl UnitReporter for TracingReporter {
    fn report(&self, event: &UnitEvent) {
        match event {
            UnitEvent::Started { id, description } => {
                tracing::info!("Starting {}: {}", id, description);
            }
            UnitEvent::Output { id, line, is_stderr } => {
                if *is_stderr {
                    tracing::warn!("[{}] {}", id, line);
                } else {
                    tracing::debug!("[{}] {}", id, line);
                }
            }
            UnitEvent::Finished {
                id,
                outcome,
                duration,
            } => {
                tracing::info!("{} {} in {:.1}s", id, outcome, duration.as_secs_f64());
            }
            UnitEvent::Failed {
                id,
                duration,
                error,
            } => {
                tracing::error!("{} failed after {:.1}s: {}", id, duration.as_secs_f64(), error);
            }
            UnitEvent::Skipped { id, reason } => {
                tracing::info!("{} skipped: {}", id, reason);
            }
            UnitEvent::AllCompleted {
                total,
                executed,
                up_to_date,
                from_cache,
                no_source,
                failed,
                skipped,
                duration,
            } => {
                tracing::info!(
                    "{} units: {} executed, {} up-to-date, {} from cache, {} no source, {} failed, {} skipped ({:.1}s)",
                    total,
                    executed,
                    up_to_date,
                    from_cache,
                    no_source,
                    failed,
                    skipped,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<UnitEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<UnitEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl UnitReporter for CollectingReporter {
    fn report(&self, event: &UnitEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Registry of unit reporters, itself a reporter that broadcasts
pub struct UnitReporterRegistry {
    reporters: Vec<Arc<dyn UnitReporter>>,
}

impl UnitReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: UnitReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_shared(&mut self, reporter: Arc<dyn UnitReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn UnitReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &UnitEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl UnitReporter for UnitReporterRegistry {
    fn report(&self, event: &UnitEvent) {
        self.broadcast(event);
    }
}

impl Default for UnitReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        let id = UnitId::new("core", "compile");

        reporter.report(&UnitEvent::Started {
            id: id.clone(),
            description: "cc -c".to_string(),
        });
        reporter.report(&UnitEvent::Finished {
            id,
            outcome: ExecutionOutcome::Executed,
            duration: Duration::from_secs(5),
        });

        let events = reporter.events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;
        let id = UnitId::new("core", "compile");

        // Just verify it doesn't panic
        reporter.report(&UnitEvent::Started {
            id: id.clone(),
            description: "cc -c".to_string(),
        });
        reporter.report(&UnitEvent::Finished {
            id,
            outcome: ExecutionOutcome::FromCache,
            duration: Duration::from_secs(1),
        });
    }

    #[test]
    fn test_broadcast() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = UnitReporterRegistry::empty();
        registry.register_shared(collecting.clone());

        registry.report(&UnitEvent::Skipped {
            id: UnitId::new("core", "compile"),
            reason: "build aborted".to_string(),
        });

        assert_eq!(collecting.events().len(), 1);
    }

    #[test]
    fn test_register() {
        let mut registry = UnitReporterRegistry::empty();
        assert!(registry.all().is_empty());

        registry.register(TracingReporter);
        assert_eq!(registry.all().len(), 1);

        registry.register(CollectingReporter::default());
        assert_eq!(registry.all().len(), 2);
        assert_eq!(UnitReporterRegistry::default().all().len(), 1);
    }
}
