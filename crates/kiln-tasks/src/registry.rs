//! Build-wide record of output locations

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::lease::MutationPermit;
use crate::unit::UnitId;

/// A location claimed as output by a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputClaim {
    pub unit: UnitId,
    pub path: PathBuf,
}

/// Output locations declared by units in this build, and the managed output
/// area that cleanup is allowed to touch
#[derive(Debug, Default)]
pub struct OutputRegistry {
    roots: Vec<PathBuf>,
    claims: Mutex<Vec<OutputClaim>>,
}

impl OutputRegistry {
    /// Registry whose managed area is everything below `roots`
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            claims: Mutex::new(Vec::new()),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Whether `path` lies inside the build's managed output area.
    ///
    /// Paths that step upwards with `..` are never owned, whatever they
    /// resolve to.
    pub fn is_owned_by_build(&self, path: &Path) -> bool {
        let Some(path) = without_parent_steps(path) else {
            return false;
        };
        self.roots
            .iter()
            .filter_map(|root| without_parent_steps(root))
            .any(|root| path.starts_with(root))
    }

    /// Record output locations of `unit`
    pub fn declare<I>(&self, _permit: &MutationPermit<'_>, unit: &UnitId, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            let claim = OutputClaim {
                unit: unit.clone(),
                path,
            };
            if !claims.contains(&claim) {
                debug!(unit = %unit, path = %claim.path.display(), "output location declared");
                claims.push(claim);
            }
        }
    }

    /// Claims of other units at, inside or above `path`
    pub fn overlapping_claims(&self, unit: &UnitId, path: &Path) -> Vec<OutputClaim> {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims
            .iter()
            .filter(|c| &c.unit != unit)
            .filter(|c| c.path.starts_with(path) || path.starts_with(&c.path))
            .cloned()
            .collect()
    }

    pub fn claims(&self) -> Vec<OutputClaim> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// `path` with `.` components dropped, or `None` if it contains `..`
fn without_parent_steps(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => return None,
            other => normalized.push(other),
        }
    }
    Some(normalized)
}
