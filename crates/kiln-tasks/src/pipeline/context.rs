//! Per-attempt execution context

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheKey, OriginMetadata};
use crate::fingerprint::{FileCollectionFingerprint, FingerprintError, Fingerprinter};
use crate::history::HistoryCheckout;
use crate::lease::ProjectLease;
use crate::properties::{OutputLocation, ResolvedProperties};
use crate::state::{ArtifactStateTracker, CachingState};
use crate::unit::WorkUnit;

use super::{ExecutionError, ExecutionOutcome};

/// Mutable state carried between the stages of one unit's attempt
pub struct ExecutionContext {
    pub unit: Arc<WorkUnit>,
    pub lease: ProjectLease,
    pub checkout: Option<HistoryCheckout>,
    pub resolved: ResolvedProperties,
    /// Output locations as found before the attempt touched them
    pub outputs_before: BTreeMap<String, FileCollectionFingerprint>,
    pub state: ArtifactStateTracker,
    pub cache_key: Option<CacheKey>,
    pub caching: CachingState,
    /// Set once the cache was consulted; stores only happen after that
    pub cache_consulted: bool,
    pub outcome: Option<ExecutionOutcome>,
    pub failure: Option<ExecutionError>,
    pub origin: Option<OriginMetadata>,
    /// Output fingerprints after the outcome was produced
    pub output_fingerprints: BTreeMap<String, FileCollectionFingerprint>,
    pub execution_time: Duration,
    /// The attempt changed the filesystem
    pub did_work: bool,
    pub started: Instant,
}

impl ExecutionContext {
    pub fn new(unit: Arc<WorkUnit>, lease: ProjectLease) -> Self {
        Self {
            unit,
            lease,
            checkout: None,
            resolved: ResolvedProperties::default(),
            outputs_before: BTreeMap::new(),
            state: ArtifactStateTracker::default(),
            cache_key: None,
            caching: CachingState::Disabled(Vec::new()),
            cache_consulted: false,
            outcome: None,
            failure: None,
            origin: None,
            output_fingerprints: BTreeMap::new(),
            execution_time: Duration::ZERO,
            did_work: false,
            started: Instant::now(),
        }
    }

    /// Record a unit-scoped failure; the first failure wins
    pub fn fail(&mut self, error: ExecutionError) {
        self.outcome = Some(ExecutionOutcome::Failed);
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.outcome.is_some_and(|o| o != ExecutionOutcome::Failed)
    }

    /// Fingerprint every resolved output location as it is now
    pub fn fingerprint_outputs(
        &self,
        fingerprinter: &Fingerprinter,
    ) -> Result<BTreeMap<String, FileCollectionFingerprint>, FingerprintError> {
        let mut fingerprints = BTreeMap::new();
        for output in &self.resolved.outputs {
            let fingerprint = match &output.location {
                OutputLocation::Absent => FileCollectionFingerprint::absent(),
                OutputLocation::File(path) | OutputLocation::Directory(path) => {
                    fingerprinter.fingerprint_output(path)?
                }
            };
            fingerprints.insert(output.name.clone(), fingerprint);
        }
        Ok(fingerprints)
    }
}
