//! Cache keys

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fingerprint::FileCollectionFingerprint;
use crate::hash::{Digest, Hasher};
use crate::properties::ResolvedProperties;
use crate::unit::WorkUnit;

/// Digest identifying one unit of work with exactly these inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Digest);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl From<Digest> for CacheKey {
    fn from(digest: Digest) -> Self {
        Self(digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Digest of a scalar input value.
///
/// `serde_json` maps are ordered by key, so the serialized form is canonical.
pub fn digest_scalar(value: &serde_json::Value) -> Digest {
    Digest::of(value.to_string().as_bytes())
}

/// Digests of all scalar inputs, by property name
pub fn scalar_input_digests(resolved: &ResolvedProperties) -> BTreeMap<String, Digest> {
    resolved
        .scalar_inputs
        .iter()
        .map(|(name, value)| (name.clone(), digest_scalar(value)))
        .collect()
}

/// Derives cache keys
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Key over the implementation identity, scalar inputs, input file
    /// fingerprints and the set of output property names
    pub fn build(
        unit: &WorkUnit,
        resolved: &ResolvedProperties,
        input_fingerprints: &BTreeMap<String, FileCollectionFingerprint>,
    ) -> CacheKey {
        let mut hasher = Hasher::new();
        hasher.put_digest(&unit.implementation.digest());

        let scalars = scalar_input_digests(resolved);
        hasher.put_str("inputs");
        for (name, digest) in &scalars {
            hasher.put_str(name);
            hasher.put_digest(digest);
        }

        hasher.put_str("files");
        for (name, fingerprint) in input_fingerprints {
            hasher.put_str(name);
            hasher.put_digest(&fingerprint.hash);
        }

        let mut outputs: Vec<&str> = resolved.outputs.iter().map(|o| o.name.as_str()).collect();
        outputs.sort_unstable();
        hasher.put_str("outputs");
        for name in outputs {
            hasher.put_str(name);
        }

        CacheKey(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ShellAction;
    use crate::fingerprint::{Fingerprinter, Normalization};
    use crate::properties::PropertyResolver;
    use crate::unit::UnitId;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn unit(dir: &Path, command: &str, sources: Vec<String>, outputs: &[&str]) -> WorkUnit {
        let mut builder = WorkUnit::builder(UnitId::new("p", "compile"), Arc::new(ShellAction::new(command)))
            .with_project_dir(dir)
            .with_input_files("sources", sources, Normalization::RelativePath);
        for name in outputs {
            builder = builder.with_output_dir(*name, format!("build/{}", name));
        }
        builder.build().unwrap()
    }

    fn key_for(unit: &WorkUnit) -> CacheKey {
        let resolved = PropertyResolver::new().resolve(unit).unwrap();
        let fingerprinter = Fingerprinter::new();
        let fingerprints = resolved
            .input_files
            .iter()
            .map(|input| {
                let fp = fingerprinter.fingerprint(&input.roots, input.normalization).unwrap();
                (input.name.clone(), fp)
            })
            .collect();
        CacheKeyBuilder::build(unit, &resolved, &fingerprints)
    }

    fn setup() -> TempDir {
        let temp = TempDir::new().unwrap();
        for name in ["a.c", "b.c"] {
            std::fs::write(temp.path().join(name), name).unwrap();
        }
        temp
    }

    #[test]
    fn test_key_is_stable_under_input_reordering() {
        let temp = setup();
        let forward = unit(temp.path(), "cc", vec!["a.c".into(), "b.c".into()], &["classes"]);
        let backward = unit(temp.path(), "cc", vec!["b.c".into(), "a.c".into()], &["classes"]);
        assert_eq!(key_for(&forward), key_for(&backward));
    }

    #[test]
    fn test_key_changes_with_content() {
        let temp = setup();
        let u = unit(temp.path(), "cc", vec!["a.c".into(), "b.c".into()], &["classes"]);
        let before = key_for(&u);
        std::fs::write(temp.path().join("a.c"), "changed").unwrap();
        assert_ne!(before, key_for(&u));
    }

    #[test]
    fn test_key_changes_with_output_names_and_implementation() {
        let temp = setup();
        let base = key_for(&unit(temp.path(), "cc", vec!["a.c".into()], &["classes"]));
        let more_outputs = key_for(&unit(temp.path(), "cc", vec!["a.c".into()], &["classes", "headers"]));
        let other_command = key_for(&unit(temp.path(), "clang", vec!["a.c".into()], &["classes"]));
        assert_ne!(base, more_outputs);
        assert_ne!(base, other_command);
    }

    #[test]
    fn test_key_ignores_output_locations() {
        let temp = setup();
        let a = WorkUnit::builder(UnitId::new("p", "x"), Arc::new(ShellAction::new("cc")))
            .with_project_dir(temp.path())
            .with_output_dir("classes", PathBuf::from("out/one"))
            .build()
            .unwrap();
        let b = WorkUnit::builder(UnitId::new("p", "y"), Arc::new(ShellAction::new("cc")))
            .with_project_dir(temp.path())
            .with_output_dir("classes", PathBuf::from("out/two"))
            .build()
            .unwrap();
        assert_eq!(key_for(&a), key_for(&b));
    }

    #[test]
    fn test_scalar_digest_is_canonical() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(digest_scalar(&a), digest_scalar(&b));
    }
}
