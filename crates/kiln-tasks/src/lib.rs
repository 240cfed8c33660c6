//! Kiln Tasks - incremental execution engine
//!
//! This crate decides, for every work unit of a build, whether its real
//! logic has to run: units without source are skipped (cleaning stale
//! outputs), unchanged units are up-to-date, and units whose cache key is
//! known load their outputs from the build cache.

pub mod action;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod hash;
pub mod history;
pub mod lease;
pub mod pipeline;
pub mod properties;
pub mod registry;
pub mod reporter;
pub mod scheduler;
pub mod state;
pub mod unit;

pub use action::{ShellAction, WorkAction, WorkContext, WorkError};
pub use cache::{BuildCache, CacheKey, CacheKeyBuilder, CacheTransport, OriginMetadata};
pub use fingerprint::{FileCollectionFingerprint, Fingerprinter, Normalization};
pub use history::{ExecutionHistory, FileExecutionHistory, PreviousExecutionState};
pub use pipeline::{
    BuildAbort, ExecutionError, ExecutionOutcome, ExecutionPipeline, ExecutionServices, UnitResult,
};
pub use properties::{PropertyResolver, ResolvedProperties};
pub use reporter::{UnitEvent, UnitReporter, UnitReporterRegistry};
pub use scheduler::{BuildReport, SchedulerOptions, UnitScheduler};
pub use state::ArtifactStateTracker;
pub use unit::{UnitId, WorkUnit};
