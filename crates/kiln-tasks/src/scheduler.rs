//! Unit scheduler: runs independent units on a bounded tokio pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::pipeline::{BuildAbort, ExecutionError, ExecutionOutcome, ExecutionPipeline, UnitResult};
use crate::reporter::{UnitEvent, UnitReporter};
use crate::unit::{UnitId, WorkUnit};

/// Options for the unit scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent units
    pub concurrency: usize,
    /// Whether to keep starting units after one failed
    pub continue_on_error: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus(),
            continue_on_error: false,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Outcome of a whole build
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Units that were attempted, in submission order
    pub results: Vec<UnitResult>,
    /// Units that were never started
    pub skipped: Vec<UnitId>,
    /// Set when an unrecoverable unpack stopped the build
    pub aborted: Option<BuildAbort>,
    pub duration: Duration,
}

impl BuildReport {
    pub fn count(&self, outcome: ExecutionOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &UnitResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == ExecutionOutcome::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.failed().next().is_none()
    }
}

/// Runs units through the execution pipeline with bounded parallelism
pub struct UnitScheduler {
    pipeline: Arc<ExecutionPipeline>,
    options: SchedulerOptions,
}

impl UnitScheduler {
    pub fn new(pipeline: Arc<ExecutionPipeline>, options: SchedulerOptions) -> Self {
        Self { pipeline, options }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Execute every unit. Each unit's attempt runs on a single tokio task
    /// from start to finish.
    pub async fn run(&self, units: Vec<Arc<WorkUnit>>) -> BuildReport {
        let start = Instant::now();
        let reporter = Arc::clone(&self.pipeline.services().reporter);
        let mut report = BuildReport::default();

        if let Err(e) = self.pipeline.declare_outputs(&units).await {
            warn!(error = %e, "could not declare output locations up front");
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for unit in units {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "scheduler pool closed");
                    skip(&mut report, reporter.as_ref(), unit.id.clone(), "scheduler pool closed");
                    continue;
                }
            };
            if stop.load(Ordering::SeqCst) {
                drop(permit);
                skip(&mut report, reporter.as_ref(), unit.id.clone(), "build stopped after failure");
                continue;
            }

            let id = unit.id.clone();
            let pipeline = Arc::clone(&self.pipeline);
            let stop = Arc::clone(&stop);
            let continue_on_error = self.options.continue_on_error;
            debug!(unit = %id, "launching unit");

            let handle = tokio::spawn(async move {
                let result = pipeline.execute(unit).await;
                match &result {
                    Err(_) => stop.store(true, Ordering::SeqCst),
                    Ok(r) if r.outcome == ExecutionOutcome::Failed && !continue_on_error => {
                        stop.store(true, Ordering::SeqCst)
                    }
                    Ok(_) => {}
                }
                drop(permit);
                result
            });
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => report.results.push(result),
                Ok(Err(abort)) => {
                    if report.aborted.is_none() {
                        report.aborted = Some(abort);
                    }
                }
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    let message = format!("{}", e);
                    reporter.report(&UnitEvent::Failed {
                        id: id.clone(),
                        duration: Duration::ZERO,
                        error: format!("unit panicked: {}", message),
                    });
                    report.results.push(UnitResult {
                        id,
                        outcome: ExecutionOutcome::Failed,
                        did_work: false,
                        duration: Duration::ZERO,
                        cache_key: None,
                        origin: None,
                        failure: Some(ExecutionError::Panicked(message)),
                    });
                }
            }
        }

        report.duration = start.elapsed();
        reporter.report(&UnitEvent::AllCompleted {
            total: report.results.len() + report.skipped.len(),
            executed: report.count(ExecutionOutcome::Executed),
            up_to_date: report.count(ExecutionOutcome::UpToDate),
            from_cache: report.count(ExecutionOutcome::FromCache),
            no_source: report.count(ExecutionOutcome::NoSource),
            failed: report.count(ExecutionOutcome::Failed),
            skipped: report.skipped.len(),
            duration: report.duration,
        });
        report
    }
}

fn skip(report: &mut BuildReport, reporter: &dyn UnitReporter, id: UnitId, reason: &str) {
    reporter.report(&UnitEvent::Skipped {
        id: id.clone(),
        reason: reason.to_string(),
    });
    report.skipped.push(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{WorkAction, WorkContext, WorkError};
    use crate::cache::{CacheKey, UnrecoverableUnpackError};
    use crate::hash::Digest;
    use crate::pipeline::{
        ExecutionContext, ExecutionServices, ExecutionStage, ResolvePropertiesStage,
    };
    use crate::reporter::CollectingReporter;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl WorkAction for Noop {
        fn describe(&self) -> String {
            "noop".to_string()
        }

        async fn execute(&self, _ctx: &WorkContext<'_>) -> Result<(), WorkError> {
            Ok(())
        }
    }

    /// Fails units named `broken`, aborts on `corrupt`, executes the rest
    struct ScriptedStage;

    #[async_trait]
    impl ExecutionStage for ScriptedStage {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn attempt(
            &self,
            ctx: &mut ExecutionContext,
            _services: &ExecutionServices,
        ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
            match ctx.unit.id.name.as_str() {
                "broken" => Err(WorkError::Failed("boom".to_string()).into()),
                "corrupt" => Err(UnrecoverableUnpackError {
                    unit: ctx.unit.id.clone(),
                    key: CacheKey::from(Digest::of(b"k")),
                    message: "cleanup failed".to_string(),
                }
                .into()),
                _ => Ok(Some(ExecutionOutcome::Executed)),
            }
        }
    }

    fn unit(project: &str, name: &str) -> Arc<WorkUnit> {
        Arc::new(
            WorkUnit::builder(UnitId::new(project, name), Arc::new(Noop))
                .build()
                .unwrap(),
        )
    }

    fn scheduler(options: SchedulerOptions) -> (UnitScheduler, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::default());
        let services = ExecutionServices::in_memory().with_reporter(reporter.clone());
        let pipeline = ExecutionPipeline::with_stages(
            services,
            vec![Box::new(ResolvePropertiesStage), Box::new(ScriptedStage)],
        );
        (UnitScheduler::new(Arc::new(pipeline), options), reporter)
    }

    #[test]
    fn test_scheduler_options_default() {
        let opts = SchedulerOptions::default();
        assert!(opts.concurrency > 0);
        assert!(!opts.continue_on_error);
    }

    #[tokio::test]
    async fn test_runs_all_units() {
        let (scheduler, reporter) = scheduler(SchedulerOptions::default());
        let report = scheduler
            .run(vec![unit("a", "compile"), unit("b", "compile"), unit("c", "compile")])
            .await;

        assert!(report.is_success());
        assert_eq!(report.count(ExecutionOutcome::Executed), 3);
        assert!(reporter.events().iter().any(|e| matches!(
            e,
            UnitEvent::AllCompleted {
                total: 3,
                executed: 3,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_units() {
        let options = SchedulerOptions {
            concurrency: 1,
            continue_on_error: false,
        };
        let (scheduler, _) = scheduler(options);
        let report = scheduler
            .run(vec![unit("a", "broken"), unit("b", "compile"), unit("c", "compile")])
            .await;

        assert!(!report.is_success());
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.skipped, vec![UnitId::new("b", "compile"), UnitId::new("c", "compile")]);
    }

    #[tokio::test]
    async fn test_continue_on_error_isolates_failures() {
        let options = SchedulerOptions {
            concurrency: 1,
            continue_on_error: true,
        };
        let (scheduler, _) = scheduler(options);
        let report = scheduler
            .run(vec![unit("a", "broken"), unit("b", "compile")])
            .await;

        assert_eq!(report.count(ExecutionOutcome::Failed), 1);
        assert_eq!(report.count(ExecutionOutcome::Executed), 1);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_abort_stops_launching_units() {
        let options = SchedulerOptions {
            concurrency: 1,
            continue_on_error: true,
        };
        let (scheduler, reporter) = scheduler(options);
        let report = scheduler
            .run(vec![unit("a", "corrupt"), unit("b", "compile")])
            .await;

        let abort = report.aborted.as_ref().unwrap();
        assert_eq!(abort.unit, UnitId::new("a", "corrupt"));
        assert_eq!(report.skipped, vec![UnitId::new("b", "compile")]);
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, UnitEvent::Skipped { .. })));
    }
}
