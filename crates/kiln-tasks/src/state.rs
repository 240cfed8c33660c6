//! Artifact state tracking: current vs previous execution state

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::fingerprint::{compare, EntryKind, FileChange, FileCollectionFingerprint};
use crate::hash::Digest;
use crate::history::PreviousExecutionState;
use crate::properties::ResolvedProperties;
use crate::registry::OutputRegistry;
use crate::unit::{CachingPolicy, UnitId};

/// Fingerprints taken before a unit executes
#[derive(Debug, Clone, PartialEq)]
pub struct BeforeExecutionState {
    pub implementation: Digest,
    pub scalar_inputs: BTreeMap<String, Digest>,
    pub input_files: BTreeMap<String, FileCollectionFingerprint>,
    /// Output locations as found on disk before executing
    pub outputs: BTreeMap<String, FileCollectionFingerprint>,
}

/// A reason the unit is out of date
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStateChange {
    NoHistory,
    ImplementationChanged,
    InputPropertyAdded(String),
    InputPropertyRemoved(String),
    InputPropertyChanged(String),
    InputFileChanged { property: String, change: FileChange },
    OutputPropertiesChanged,
    OutputFileChanged { property: String, change: FileChange },
}

impl fmt::Display for ExecutionStateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHistory => write!(f, "No history is available"),
            Self::ImplementationChanged => write!(f, "Implementation has changed"),
            Self::InputPropertyAdded(name) => write!(f, "Input property '{}' has been added", name),
            Self::InputPropertyRemoved(name) => write!(f, "Input property '{}' has been removed", name),
            Self::InputPropertyChanged(name) => write!(f, "Value of input property '{}' has changed", name),
            Self::InputFileChanged { property, change } => {
                write!(f, "Input property '{}' file {}", property, change)
            }
            Self::OutputPropertiesChanged => write!(f, "Output property names have changed"),
            Self::OutputFileChanged { property, change } => {
                write!(f, "Output property '{}' file {}", property, change)
            }
        }
    }
}

/// Output paths this unit cannot claim exclusively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlappingOutputs {
    pub property: String,
    pub path: PathBuf,
    /// Another unit of this build claiming the path, if that is the source
    pub claimed_by: Option<UnitId>,
}

impl fmt::Display for OverlappingOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.claimed_by {
            Some(unit) => write!(
                f,
                "output property '{}' overlaps {} declared by {}",
                self.property,
                self.path.display(),
                unit
            ),
            None => write!(
                f,
                "output property '{}' contains {} which was not created by this unit",
                self.property,
                self.path.display()
            ),
        }
    }
}

/// Why caching is off for an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachingDisabledReason {
    BuildCacheDisabled,
    NotCacheable(String),
    NoOutputsDeclared,
    OverlappingOutputs(OverlappingOutputs),
}

impl fmt::Display for CachingDisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildCacheDisabled => write!(f, "build cache is disabled"),
            Self::NotCacheable(reason) => write!(f, "caching has been disabled: {}", reason),
            Self::NoOutputsDeclared => write!(f, "no outputs declared"),
            Self::OverlappingOutputs(overlap) => write!(f, "overlapping outputs: {}", overlap),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachingState {
    Enabled,
    Disabled(Vec<CachingDisabledReason>),
}

impl CachingState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Detect overlapping outputs of `unit` before it executes.
///
/// Two sources count: another unit of this build claiming a path at, inside
/// or above an output location, and content found in an output location that
/// the previous execution did not record. The location root itself never
/// counts as foreign.
pub fn detect_overlapping_outputs(
    unit: &UnitId,
    resolved: &ResolvedProperties,
    registry: &OutputRegistry,
    previous: Option<&PreviousExecutionState>,
    before: &BTreeMap<String, FileCollectionFingerprint>,
) -> Option<OverlappingOutputs> {
    for output in &resolved.outputs {
        let Some(location) = output.location.path() else {
            continue;
        };
        if let Some(claim) = registry.overlapping_claims(unit, location).into_iter().next() {
            return Some(OverlappingOutputs {
                property: output.name.clone(),
                path: claim.path,
                claimed_by: Some(claim.unit),
            });
        }

        let Some(snapshot) = before.get(&output.name) else {
            continue;
        };
        let recorded = previous.and_then(|p| p.output_files.get(&output.name));
        for entry in &snapshot.entries {
            if !matches!(entry.kind, EntryKind::File | EntryKind::Directory)
                || entry.absolute_path == location
            {
                continue;
            }
            let known = recorded.and_then(|r| {
                r.entries
                    .iter()
                    .find(|e| e.absolute_path == entry.absolute_path)
            });
            let foreign = match known {
                None => true,
                Some(prev) => prev.kind != entry.kind || prev.content_hash != entry.content_hash,
            };
            if foreign {
                return Some(OverlappingOutputs {
                    property: output.name.clone(),
                    path: entry.absolute_path.clone(),
                    claimed_by: None,
                });
            }
        }
    }
    None
}

/// Compares the current attempt against the previous successful execution
#[derive(Debug, Default)]
pub struct ArtifactStateTracker {
    previous: Option<PreviousExecutionState>,
    current: Option<BeforeExecutionState>,
    overlapping: Option<OverlappingOutputs>,
}

impl ArtifactStateTracker {
    pub fn new(previous: Option<PreviousExecutionState>) -> Self {
        Self {
            previous,
            current: None,
            overlapping: None,
        }
    }

    pub fn previous(&self) -> Option<&PreviousExecutionState> {
        self.previous.as_ref()
    }

    /// Previously recorded output fingerprints, if any outputs existed
    pub fn previous_outputs(&self) -> Option<&BTreeMap<String, FileCollectionFingerprint>> {
        self.previous
            .as_ref()
            .map(|p| &p.output_files)
            .filter(|outputs| outputs.values().any(FileCollectionFingerprint::has_content))
    }

    pub fn set_overlapping_outputs(&mut self, overlap: Option<OverlappingOutputs>) {
        self.overlapping = overlap;
    }

    pub fn overlapping_outputs(&self) -> Option<&OverlappingOutputs> {
        self.overlapping.as_ref()
    }

    pub fn set_current(&mut self, current: BeforeExecutionState) {
        self.current = Some(current);
    }

    pub fn current(&self) -> Option<&BeforeExecutionState> {
        self.current.as_ref()
    }

    /// Whether anything differs from the previous execution
    pub fn has_any_change(&self) -> bool {
        match (&self.current, &self.previous) {
            (Some(current), Some(previous)) => has_any_change(current, previous),
            _ => true,
        }
    }

    /// Every detected difference, for reporting
    pub fn changes(&self) -> Vec<ExecutionStateChange> {
        let (Some(current), Some(previous)) = (&self.current, &self.previous) else {
            return vec![ExecutionStateChange::NoHistory];
        };
        let mut changes = Vec::new();

        if current.implementation != previous.implementation {
            changes.push(ExecutionStateChange::ImplementationChanged);
        }

        for (name, digest) in &current.scalar_inputs {
            match previous.scalar_inputs.get(name) {
                None => changes.push(ExecutionStateChange::InputPropertyAdded(name.clone())),
                Some(prev) if prev != digest => {
                    changes.push(ExecutionStateChange::InputPropertyChanged(name.clone()))
                }
                _ => {}
            }
        }
        for name in previous.scalar_inputs.keys() {
            if !current.scalar_inputs.contains_key(name) {
                changes.push(ExecutionStateChange::InputPropertyRemoved(name.clone()));
            }
        }

        for (name, fingerprint) in &current.input_files {
            match previous.input_files.get(name) {
                None => changes.push(ExecutionStateChange::InputPropertyAdded(name.clone())),
                Some(prev) => changes.extend(compare(prev, fingerprint).into_iter().map(|change| {
                    ExecutionStateChange::InputFileChanged {
                        property: name.clone(),
                        change,
                    }
                })),
            }
        }
        for name in previous.input_files.keys() {
            if !current.input_files.contains_key(name) {
                changes.push(ExecutionStateChange::InputPropertyRemoved(name.clone()));
            }
        }

        if !same_keys(&current.outputs, &previous.output_files) {
            changes.push(ExecutionStateChange::OutputPropertiesChanged);
        } else {
            for (name, fingerprint) in &current.outputs {
                if let Some(prev) = previous.output_files.get(name) {
                    changes.extend(compare(prev, fingerprint).into_iter().map(|change| {
                        ExecutionStateChange::OutputFileChanged {
                            property: name.clone(),
                            change,
                        }
                    }));
                }
            }
        }

        changes
    }

    /// Whether outputs may be loaded from or stored to the cache
    pub fn is_allowed_to_use_cached_results(
        &self,
        policy: &CachingPolicy,
        resolved: &ResolvedProperties,
    ) -> bool {
        self.disabled_reasons(policy, resolved).is_empty()
    }

    pub fn caching_state(
        &self,
        build_cache_enabled: bool,
        policy: &CachingPolicy,
        resolved: &ResolvedProperties,
    ) -> CachingState {
        let mut reasons = Vec::new();
        if !build_cache_enabled {
            reasons.push(CachingDisabledReason::BuildCacheDisabled);
        }
        reasons.extend(self.disabled_reasons(policy, resolved));
        if reasons.is_empty() {
            CachingState::Enabled
        } else {
            CachingState::Disabled(reasons)
        }
    }

    fn disabled_reasons(
        &self,
        policy: &CachingPolicy,
        resolved: &ResolvedProperties,
    ) -> Vec<CachingDisabledReason> {
        let mut reasons = Vec::new();
        if let CachingPolicy::Disabled(reason) = policy {
            reasons.push(CachingDisabledReason::NotCacheable(reason.clone()));
        }
        if resolved.output_paths().next().is_none() {
            reasons.push(CachingDisabledReason::NoOutputsDeclared);
        }
        if let Some(overlap) = &self.overlapping {
            reasons.push(CachingDisabledReason::OverlappingOutputs(overlap.clone()));
        }
        reasons
    }
}

fn same_keys<A, B>(a: &BTreeMap<String, A>, b: &BTreeMap<String, B>) -> bool {
    a.len() == b.len() && a.keys().zip(b.keys()).all(|(x, y)| x == y)
}

/// Whether `current` differs from `previous` in implementation, inputs or outputs
pub fn has_any_change(current: &BeforeExecutionState, previous: &PreviousExecutionState) -> bool {
    if current.implementation != previous.implementation
        || current.scalar_inputs != previous.scalar_inputs
        || !same_keys(&current.input_files, &previous.input_files)
        || !same_keys(&current.outputs, &previous.output_files)
    {
        return true;
    }
    let inputs_changed = current
        .input_files
        .iter()
        .any(|(name, fp)| previous.input_files.get(name).map(|p| &p.hash) != Some(&fp.hash));
    let outputs_changed = current
        .outputs
        .iter()
        .any(|(name, fp)| previous.output_files.get(name).map(|p| &p.hash) != Some(&fp.hash));
    inputs_changed || outputs_changed
}
