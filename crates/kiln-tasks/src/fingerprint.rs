//! File collection fingerprinting
//!
//! A fingerprint is a list of entries (normalized path, kind, content hash)
//! plus one aggregate digest over that list. Entries are sorted unless the
//! normalization is order-sensitive, so the aggregate is independent of the
//! order roots were declared in.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;
use walkdir::WalkDir;

use crate::hash::{Digest, Hasher};

/// How file paths take part in a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// Full absolute path
    AbsolutePath,
    /// Path relative to the declared root
    RelativePath,
    /// File name only
    NameOnly,
    /// Content only
    IgnoredPath,
    /// Relative paths, declaration order matters
    Classpath,
}

impl Normalization {
    pub fn is_order_sensitive(&self) -> bool {
        matches!(self, Self::Classpath)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbsolutePath => "absolute",
            Self::RelativePath => "relative",
            Self::NameOnly => "name-only",
            Self::IgnoredPath => "ignore-path",
            Self::Classpath => "classpath",
        }
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Normalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absolute" => Ok(Self::AbsolutePath),
            "relative" => Ok(Self::RelativePath),
            "name-only" => Ok(Self::NameOnly),
            "ignore-path" => Ok(Self::IgnoredPath),
            "classpath" => Ok(Self::Classpath),
            other => Err(format!("unknown normalization '{}'", other)),
        }
    }
}

/// Kind of a fingerprinted path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    /// Declared location with nothing on disk
    Missing,
    /// Output property declared absent
    Absent,
}

impl EntryKind {
    fn tag(&self) -> &'static str {
        match self {
            Self::File => "f",
            Self::Directory => "d",
            Self::Missing => "m",
            Self::Absent => "a",
        }
    }
}

/// One path within a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub normalized_path: String,
    pub absolute_path: PathBuf,
    pub kind: EntryKind,
    /// Content hash, files only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<Digest>,
}

impl FingerprintEntry {
    fn same_content(&self, other: &Self) -> bool {
        self.kind == other.kind && self.content_hash == other.content_hash
    }
}

/// Fingerprint of a named file collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCollectionFingerprint {
    pub entries: Vec<FingerprintEntry>,
    pub hash: Digest,
    pub order_sensitive: bool,
}

impl FileCollectionFingerprint {
    fn from_entries(mut entries: Vec<FingerprintEntry>, order_sensitive: bool) -> Self {
        if !order_sensitive {
            entries.sort_by(|a, b| {
                a.normalized_path
                    .cmp(&b.normalized_path)
                    .then_with(|| a.kind.cmp(&b.kind))
                    .then_with(|| a.content_hash.cmp(&b.content_hash))
            });
        }
        let mut hasher = Hasher::new();
        hasher.put_bool(order_sensitive);
        for entry in &entries {
            hasher.put_str(&entry.normalized_path);
            hasher.put_str(entry.kind.tag());
            if let Some(content) = &entry.content_hash {
                hasher.put_digest(content);
            }
        }
        Self {
            entries,
            hash: hasher.finish(),
            order_sensitive,
        }
    }

    /// Fingerprint of a collection with no files
    pub fn empty() -> Self {
        Self::from_entries(Vec::new(), false)
    }

    /// Marker for an output property declared absent
    pub fn absent() -> Self {
        Self::from_entries(
            vec![FingerprintEntry {
                normalized_path: String::new(),
                absolute_path: PathBuf::new(),
                kind: EntryKind::Absent,
                content_hash: None,
            }],
            false,
        )
    }

    pub fn is_absent(&self) -> bool {
        self.entries.iter().any(|e| e.kind == EntryKind::Absent)
    }

    /// Whether any file or directory exists in the collection
    pub fn has_content(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.kind, EntryKind::File | EntryKind::Directory))
    }

    /// Absolute paths of existing files and directories
    pub fn existing_paths(&self) -> impl Iterator<Item = (&Path, EntryKind)> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::File | EntryKind::Directory))
            .map(|e| (e.absolute_path.as_path(), e.kind))
    }
}

/// Errors raised while fingerprinting
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How one path differs between two fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    /// Same entries in a different order (order-sensitive collections only)
    Reordered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl fmt::Display for FileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            ChangeKind::Added => "has been added",
            ChangeKind::Removed => "has been removed",
            ChangeKind::Modified => "has changed",
            ChangeKind::Reordered => "has been reordered",
        };
        write!(f, "{} {}", self.path.display(), verb)
    }
}

/// Compare two fingerprints path by path
pub fn compare(
    previous: &FileCollectionFingerprint,
    current: &FileCollectionFingerprint,
) -> Vec<FileChange> {
    if previous.hash == current.hash {
        return Vec::new();
    }

    fn index(fp: &FileCollectionFingerprint) -> BTreeMap<&str, Vec<&FingerprintEntry>> {
        let mut map: BTreeMap<&str, Vec<&FingerprintEntry>> = BTreeMap::new();
        for entry in &fp.entries {
            map.entry(entry.normalized_path.as_str()).or_default().push(entry);
        }
        map
    }

    let before = index(previous);
    let after = index(current);

    let mut keys: Vec<&str> = before.keys().chain(after.keys()).copied().collect();
    keys.sort_unstable();
    keys.dedup();

    let mut changes = Vec::new();
    for key in keys {
        let old = before.get(key).map(Vec::as_slice).unwrap_or_default();
        let new = after.get(key).map(Vec::as_slice).unwrap_or_default();
        for i in 0..old.len().max(new.len()) {
            match (old.get(i), new.get(i)) {
                (Some(o), Some(n)) if !o.same_content(n) => changes.push(FileChange {
                    path: n.absolute_path.clone(),
                    kind: ChangeKind::Modified,
                }),
                (None, Some(n)) => changes.push(FileChange {
                    path: n.absolute_path.clone(),
                    kind: ChangeKind::Added,
                }),
                (Some(o), None) => changes.push(FileChange {
                    path: o.absolute_path.clone(),
                    kind: ChangeKind::Removed,
                }),
                _ => {}
            }
        }
    }

    if changes.is_empty() {
        let path = current
            .entries
            .first()
            .map(|e| e.absolute_path.clone())
            .unwrap_or_default();
        changes.push(FileChange {
            path,
            kind: ChangeKind::Reordered,
        });
    }
    changes
}

/// Produces fingerprints for file collections
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter;

impl Fingerprinter {
    pub fn new() -> Self {
        Self
    }

    /// Fingerprint input roots. Directories contribute the files below them.
    pub fn fingerprint(
        &self,
        roots: &[PathBuf],
        normalization: Normalization,
    ) -> Result<FileCollectionFingerprint, FingerprintError> {
        let mut entries = Vec::new();
        for root in roots {
            collect(root, normalization, false, &mut entries)?;
        }
        trace!(roots = roots.len(), entries = entries.len(), %normalization, "fingerprinted input");
        Ok(FileCollectionFingerprint::from_entries(
            entries,
            normalization.is_order_sensitive(),
        ))
    }

    /// Fingerprint an output location, including its directories
    pub fn fingerprint_output(
        &self,
        location: &Path,
    ) -> Result<FileCollectionFingerprint, FingerprintError> {
        let mut entries = Vec::new();
        collect(location, Normalization::RelativePath, true, &mut entries)?;
        Ok(FileCollectionFingerprint::from_entries(entries, false))
    }
}

fn collect(
    root: &Path,
    normalization: Normalization,
    include_directories: bool,
    entries: &mut Vec<FingerprintEntry>,
) -> Result<(), FingerprintError> {
    let metadata = match std::fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            entries.push(FingerprintEntry {
                normalized_path: root_name(root, normalization),
                absolute_path: root.to_path_buf(),
                kind: EntryKind::Missing,
                content_hash: None,
            });
            return Ok(());
        }
        Err(source) => {
            return Err(FingerprintError::Read {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    if metadata.is_file() {
        entries.push(FingerprintEntry {
            normalized_path: root_name(root, normalization),
            absolute_path: root.to_path_buf(),
            kind: EntryKind::File,
            content_hash: Some(hash_file(root)?),
        });
        return Ok(());
    }

    let walker = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|source| FingerprintError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let is_dir = entry.file_type().is_dir();

        if is_dir {
            if !include_directories || normalization == Normalization::IgnoredPath {
                continue;
            }
            entries.push(FingerprintEntry {
                normalized_path: normalize(path, relative, normalization),
                absolute_path: path.to_path_buf(),
                kind: EntryKind::Directory,
                content_hash: None,
            });
        } else {
            entries.push(FingerprintEntry {
                normalized_path: normalize(path, relative, normalization),
                absolute_path: path.to_path_buf(),
                kind: EntryKind::File,
                content_hash: Some(hash_file(path)?),
            });
        }
    }
    Ok(())
}

fn root_name(root: &Path, normalization: Normalization) -> String {
    match normalization {
        Normalization::AbsolutePath => root.to_string_lossy().into_owned(),
        Normalization::IgnoredPath => String::new(),
        _ => root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

fn normalize(path: &Path, relative: &Path, normalization: Normalization) -> String {
    match normalization {
        Normalization::AbsolutePath => path.to_string_lossy().into_owned(),
        Normalization::RelativePath | Normalization::Classpath => relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Normalization::NameOnly => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Normalization::IgnoredPath => String::new(),
    }
}

fn hash_file(path: &Path) -> Result<Digest, FingerprintError> {
    let read_error = |source| FingerprintError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(read_error)?;
    Digest::of_reader(&mut file).map_err(read_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_normalization_parse() {
        for name in ["absolute", "relative", "name-only", "ignore-path", "classpath"] {
            let parsed: Normalization = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
        assert!("fuzzy".parse::<Normalization>().is_err());
        assert!(Normalization::Classpath.is_order_sensitive());
        assert!(!Normalization::RelativePath.is_order_sensitive());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "src/a.txt", "a");
        write(temp.path(), "src/nested/b.txt", "b");
        let fp = Fingerprinter::new();
        let roots = vec![temp.path().join("src")];

        let first = fp.fingerprint(&roots, Normalization::RelativePath).unwrap();
        let second = fp.fingerprint(&roots, Normalization::RelativePath).unwrap();
        assert_eq!(first, second);
        let paths: Vec<_> = first.entries.iter().map(|e| e.normalized_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "nested/b.txt"]);
    }

    #[test]
    fn test_root_order_ignored_unless_classpath() {
        let temp = TempDir::new().unwrap();
        let a = write(temp.path(), "a.jar", "a");
        let b = write(temp.path(), "b.jar", "b");
        let fp = Fingerprinter::new();
        let forward = vec![a.clone(), b.clone()];
        let backward = vec![b, a];

        assert_eq!(
            fp.fingerprint(&forward, Normalization::RelativePath).unwrap().hash,
            fp.fingerprint(&backward, Normalization::RelativePath).unwrap().hash
        );
        let cp_forward = fp.fingerprint(&forward, Normalization::Classpath).unwrap();
        let cp_backward = fp.fingerprint(&backward, Normalization::Classpath).unwrap();
        assert_ne!(cp_forward.hash, cp_backward.hash);
        let changes = compare(&cp_forward, &cp_backward);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Reordered);
    }

    #[test]
    fn test_content_change_detected() {
        let temp = TempDir::new().unwrap();
        let file = write(temp.path(), "src/a.txt", "one");
        let fp = Fingerprinter::new();
        let roots = vec![temp.path().join("src")];
        let before = fp.fingerprint(&roots, Normalization::RelativePath).unwrap();

        std::fs::write(&file, "two").unwrap();
        write(temp.path(), "src/new.txt", "new");
        let after = fp.fingerprint(&roots, Normalization::RelativePath).unwrap();

        let mut kinds: Vec<_> = compare(&before, &after).into_iter().map(|c| c.kind).collect();
        kinds.sort_by_key(|k| *k as u8);
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Modified]);
    }

    #[test]
    fn test_removed_file_detected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "src/a.txt", "a");
        let gone = write(temp.path(), "src/b.txt", "b");
        let fp = Fingerprinter::new();
        let roots = vec![temp.path().join("src")];
        let before = fp.fingerprint(&roots, Normalization::RelativePath).unwrap();

        std::fs::remove_file(&gone).unwrap();
        let after = fp.fingerprint(&roots, Normalization::RelativePath).unwrap();

        let changes = compare(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[0].path, gone);
        assert!(compare(&after, &after).is_empty());
    }

    #[test]
    fn test_ignored_path_tracks_content_only() {
        let temp = TempDir::new().unwrap();
        let a = write(temp.path(), "one/data.bin", "same");
        let b = write(temp.path(), "two/other.bin", "same");
        let fp = Fingerprinter::new();
        assert_eq!(
            fp.fingerprint(&[a.clone()], Normalization::IgnoredPath).unwrap().hash,
            fp.fingerprint(&[b.clone()], Normalization::IgnoredPath).unwrap().hash
        );
        assert_ne!(
            fp.fingerprint(&[a], Normalization::NameOnly).unwrap().hash,
            fp.fingerprint(&[b], Normalization::NameOnly).unwrap().hash
        );
    }

    #[test]
    fn test_missing_and_absent_are_distinct() {
        let temp = TempDir::new().unwrap();
        let fp = Fingerprinter::new();
        let missing = fp.fingerprint_output(&temp.path().join("nothing")).unwrap();
        assert_eq!(missing.entries[0].kind, EntryKind::Missing);
        assert!(!missing.has_content());

        let absent = FileCollectionFingerprint::absent();
        assert!(absent.is_absent());
        assert_ne!(missing.hash, absent.hash);
        assert_ne!(absent.hash, FileCollectionFingerprint::empty().hash);
    }

    #[test]
    fn test_output_fingerprint_includes_directories() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "build/classes/pkg/A.class", "A");
        let fp = Fingerprinter::new();
        let output = fp.fingerprint_output(&temp.path().join("build/classes")).unwrap();
        let kinds: Vec<_> = output
            .entries
            .iter()
            .map(|e| (e.normalized_path.as_str(), e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("", EntryKind::Directory),
                ("pkg", EntryKind::Directory),
                ("pkg/A.class", EntryKind::File),
            ]
        );
    }
}
