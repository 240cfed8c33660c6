//! Execution pipeline
//!
//! A unit's attempt runs through a fixed list of stages. Each stage either
//! produces a terminal outcome or hands over to the next one. Stages that
//! handed over get their [`ExecutionStage::complete`] hook called in reverse
//! order once an outcome exists, which is where post-conditions such as the
//! cache store and the history update run.

mod cached;
mod context;
mod empty_source;
mod execute;
mod load_history;
mod resolve;
mod snapshot;
mod up_to_date;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::action::WorkError;
use crate::cache::{BuildCache, CacheKey, OriginMetadata, UnrecoverableUnpackError};
use crate::fingerprint::{FingerprintError, Fingerprinter};
use crate::history::{ExecutionHistory, HistoryCheckouts, HistoryError, InMemoryExecutionHistory};
use crate::lease::{LeaseError, ProjectLocks};
use crate::properties::{PropertyResolutionError, PropertyResolver};
use crate::registry::OutputRegistry;
use crate::reporter::{TracingReporter, UnitEvent, UnitReporter};
use crate::unit::{PropertyValue, UnitId, WorkUnit};

pub use cached::SkipCachedStage;
pub use context::ExecutionContext;
pub use empty_source::SkipEmptySourceStage;
pub use execute::ExecuteStage;
pub use load_history::LoadHistoryStage;
pub use resolve::ResolvePropertiesStage;
pub use snapshot::SnapshotInputsStage;
pub use up_to_date::SkipUpToDateStage;

/// Terminal result of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOutcome {
    Executed,
    UpToDate,
    FromCache,
    NoSource,
    Failed,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// Real work was avoided
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::UpToDate | Self::FromCache | Self::NoSource)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executed => "executed",
            Self::UpToDate => "up-to-date",
            Self::FromCache => "from cache",
            Self::NoSource => "no source",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors scoped to a single unit's attempt
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    PropertyResolution(#[from] PropertyResolutionError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("execution failed: {0}")]
    Work(#[from] WorkError),

    #[error("failed to delete stale output {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no stage produced an outcome")]
    NoOutcome,

    #[error("unit panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    UnrecoverableUnpack(#[from] UnrecoverableUnpackError),
}

impl ExecutionError {
    /// Only corrupt outputs from a failed unpack stop the whole build
    pub fn is_build_fatal(&self) -> bool {
        matches!(self, Self::UnrecoverableUnpack(_))
    }

    pub(crate) fn cleanup(path: &Path, source: std::io::Error) -> Self {
        Self::Cleanup {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The build must stop
#[derive(Debug, Clone, thiserror::Error)]
#[error("build aborted by {unit}: {source}")]
pub struct BuildAbort {
    pub unit: UnitId,
    #[source]
    pub source: UnrecoverableUnpackError,
}

/// Result of one unit's attempt
#[derive(Debug)]
pub struct UnitResult {
    pub id: UnitId,
    pub outcome: ExecutionOutcome,
    pub did_work: bool,
    pub duration: Duration,
    pub cache_key: Option<CacheKey>,
    pub origin: Option<OriginMetadata>,
    pub failure: Option<ExecutionError>,
}

/// A decision step of the pipeline
#[async_trait]
pub trait ExecutionStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce a terminal outcome, or `None` to hand over to the next stage
    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError>;

    /// Runs after a later stage produced the outcome
    async fn complete(
        &self,
        _ctx: &mut ExecutionContext,
        _services: &ExecutionServices,
    ) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Collaborators shared by every attempt of a build
pub struct ExecutionServices {
    pub history: Arc<dyn ExecutionHistory>,
    pub checkouts: Arc<HistoryCheckouts>,
    pub cache: BuildCache,
    pub registry: Arc<OutputRegistry>,
    pub locks: Arc<ProjectLocks>,
    pub reporter: Arc<dyn UnitReporter>,
    pub resolver: PropertyResolver,
    pub fingerprinter: Fingerprinter,
    /// Identifies this build in origin metadata
    pub build_id: String,
    /// Build-wide switch for up-to-date checks
    pub up_to_date_checks: bool,
}

impl ExecutionServices {
    pub fn new(history: Arc<dyn ExecutionHistory>) -> Self {
        Self {
            history,
            checkouts: HistoryCheckouts::new(),
            cache: BuildCache::disabled(),
            registry: Arc::new(OutputRegistry::default()),
            locks: Arc::new(ProjectLocks::new()),
            reporter: Arc::new(TracingReporter),
            resolver: PropertyResolver::new(),
            fingerprinter: Fingerprinter::new(),
            build_id: uuid::Uuid::new_v4().to_string(),
            up_to_date_checks: true,
        }
    }

    /// Services with in-memory history and no cache
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryExecutionHistory::new()))
    }

    pub fn with_cache(mut self, cache: BuildCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_registry(mut self, registry: OutputRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn UnitReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_up_to_date_checks(mut self, enabled: bool) -> Self {
        self.up_to_date_checks = enabled;
        self
    }
}

/// Drives units through the ordered stages
pub struct ExecutionPipeline {
    stages: Vec<Box<dyn ExecutionStage>>,
    services: ExecutionServices,
}

impl ExecutionPipeline {
    /// Pipeline with the standard stage order
    pub fn new(services: ExecutionServices) -> Self {
        Self::with_stages(
            services,
            vec![
                Box::new(ResolvePropertiesStage),
                Box::new(LoadHistoryStage),
                Box::new(SkipEmptySourceStage),
                Box::new(SnapshotInputsStage),
                Box::new(SkipUpToDateStage),
                Box::new(SkipCachedStage),
                Box::new(ExecuteStage),
            ],
        )
    }

    pub fn with_stages(services: ExecutionServices, stages: Vec<Box<dyn ExecutionStage>>) -> Self {
        Self { stages, services }
    }

    pub fn services(&self) -> &ExecutionServices {
        &self.services
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Claim the fixed output locations of `units` up front, so overlap
    /// between units is visible regardless of execution order
    pub async fn declare_outputs(&self, units: &[Arc<WorkUnit>]) -> Result<(), LeaseError> {
        for unit in units {
            let paths: Vec<PathBuf> = unit
                .outputs
                .iter()
                .filter_map(|o| match &o.location {
                    PropertyValue::Fixed(path) => Some(unit.project_dir.join(path)),
                    _ => None,
                })
                .collect();
            if paths.is_empty() {
                continue;
            }
            let lease = self.services.locks.acquire(&unit.id.project).await;
            self.services.registry.declare(&lease.permit()?, &unit.id, paths);
        }
        Ok(())
    }

    /// Run one unit to a terminal outcome.
    ///
    /// Unit-scoped errors become a `Failed` result; only an unrecoverable
    /// unpack is returned as an error.
    #[instrument(skip_all, fields(unit = %unit.id))]
    pub async fn execute(&self, unit: Arc<WorkUnit>) -> Result<UnitResult, BuildAbort> {
        let services = &self.services;
        services.reporter.report(&UnitEvent::Started {
            id: unit.id.clone(),
            description: unit.implementation.version.clone(),
        });

        let lease = services.locks.acquire(&unit.id.project).await;
        let mut ctx = ExecutionContext::new(Arc::clone(&unit), lease);
        let mut delegated = Vec::new();

        for (index, stage) in self.stages.iter().enumerate() {
            match stage.attempt(&mut ctx, services).await {
                Ok(Some(outcome)) => {
                    debug!(stage = stage.name(), %outcome, "stage produced outcome");
                    ctx.outcome = Some(outcome);
                    break;
                }
                Ok(None) => delegated.push(index),
                Err(e) => {
                    debug!(stage = stage.name(), error = %e, "stage failed");
                    self.fail_or_abort(&mut ctx, e)?;
                    break;
                }
            }
        }
        if ctx.outcome.is_none() {
            ctx.fail(ExecutionError::NoOutcome);
        }

        for index in delegated.into_iter().rev() {
            let stage = &self.stages[index];
            if let Err(e) = stage.complete(&mut ctx, services).await {
                debug!(stage = stage.name(), error = %e, "stage completion failed");
                self.fail_or_abort(&mut ctx, e)?;
            }
        }

        let outcome = ctx.outcome.unwrap_or(ExecutionOutcome::Failed);
        let duration = ctx.started.elapsed();
        match &ctx.failure {
            Some(failure) => {
                error!(error = %failure, "unit failed");
                services.reporter.report(&UnitEvent::Failed {
                    id: unit.id.clone(),
                    duration,
                    error: failure.to_string(),
                });
            }
            None => {
                info!(%outcome, did_work = ctx.did_work, "unit finished");
                services.reporter.report(&UnitEvent::Finished {
                    id: unit.id.clone(),
                    outcome,
                    duration,
                });
            }
        }

        Ok(UnitResult {
            id: unit.id.clone(),
            outcome,
            did_work: ctx.did_work,
            duration,
            cache_key: ctx.cache_key,
            origin: ctx.origin,
            failure: ctx.failure,
        })
    }

    fn fail_or_abort(&self, ctx: &mut ExecutionContext, error: ExecutionError) -> Result<(), BuildAbort> {
        match error {
            ExecutionError::UnrecoverableUnpack(source) => {
                error!(error = %source, "aborting build");
                self.services.reporter.report(&UnitEvent::Failed {
                    id: ctx.unit.id.clone(),
                    duration: ctx.started.elapsed(),
                    error: source.to_string(),
                });
                Err(BuildAbort {
                    unit: ctx.unit.id.clone(),
                    source,
                })
            }
            other => {
                ctx.fail(other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests;
