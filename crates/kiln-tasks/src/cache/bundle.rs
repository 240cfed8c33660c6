//! Output bundles: gzip tar archives of a unit's output properties
//!
//! Layout:
//!
//! ```text
//! METADATA.json
//! tree/<property>/...   directory outputs
//! file/<property>       file outputs
//! missing/<property>    outputs that did not exist
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

use super::OriginMetadata;
use crate::properties::{OutputLocation, ResolvedOutput};
use crate::unit::UnitId;

const METADATA_ENTRY: &str = "METADATA.json";

/// Header stored at the start of every bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub unit: UnitId,
    pub origin: OriginMetadata,
    /// Output property names in the bundle
    pub outputs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Bundle encoding errors
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("bundle I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid bundle metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid bundle entry '{0}'")]
    InvalidEntry(String),

    #[error("bundle has no {METADATA_ENTRY}")]
    MissingMetadata,

    #[error("bundle outputs {found:?} do not match declared outputs {expected:?}")]
    OutputMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

/// Pack the current contents of `outputs`
pub fn pack(
    unit: &UnitId,
    outputs: &[ResolvedOutput],
    origin: &OriginMetadata,
) -> Result<Vec<u8>, BundleError> {
    let metadata = BundleMetadata {
        unit: unit.clone(),
        origin: origin.clone(),
        outputs: outputs.iter().map(|o| o.name.clone()).collect(),
        created_at: Utc::now(),
    };

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(true);

    let json = serde_json::to_vec(&metadata)?;
    append_bytes(&mut builder, METADATA_ENTRY, &json)?;

    for output in outputs {
        match &output.location {
            OutputLocation::Directory(path) if path.is_dir() => {
                builder.append_dir_all(format!("tree/{}", output.name), path)?;
            }
            OutputLocation::File(path) if path.is_file() => {
                builder.append_path_with_name(path, format!("file/{}", output.name))?;
            }
            _ => append_bytes(&mut builder, &format!("missing/{}", output.name), &[])?,
        }
    }

    let bytes = builder.into_inner()?.finish()?;
    debug!(unit = %unit, size = bytes.len(), "packed output bundle");
    Ok(bytes)
}

fn append_bytes<W: io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

#[derive(Debug)]
enum TreeEntry {
    Dir(PathBuf),
    File { path: PathBuf, data: Vec<u8>, mode: u32 },
}

#[derive(Debug)]
enum PropertyContent {
    Missing,
    File { data: Vec<u8>, mode: u32 },
    Tree(Vec<TreeEntry>),
}

/// A bundle fully read into memory, ready to be written out
#[derive(Debug)]
pub struct UnpackedBundle {
    pub metadata: BundleMetadata,
    properties: BTreeMap<String, PropertyContent>,
}

/// Read and validate a bundle without touching the filesystem
pub fn read(bytes: &[u8]) -> Result<UnpackedBundle, BundleError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut metadata = None;
    let mut properties: BTreeMap<String, PropertyContent> = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let display = path.to_string_lossy().into_owned();
        let components = normal_components(&path).ok_or_else(|| BundleError::InvalidEntry(display.clone()))?;

        if components.len() == 1 && components[0] == METADATA_ENTRY {
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            metadata = Some(serde_json::from_slice::<BundleMetadata>(&json)?);
            continue;
        }
        if components.len() < 2 {
            return Err(BundleError::InvalidEntry(display));
        }

        let section = components[0].as_str();
        let property = components[1].clone();
        let is_dir = entry.header().entry_type().is_dir();
        let mode = entry.header().mode().unwrap_or(0o644);

        match (section, components.len()) {
            ("missing", 2) => {
                properties.insert(property, PropertyContent::Missing);
            }
            ("file", 2) if !is_dir => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                properties.insert(property, PropertyContent::File { data, mode });
            }
            ("tree", _) => {
                let relative: PathBuf = components[2..].iter().collect();
                let content = properties
                    .entry(property)
                    .or_insert_with(|| PropertyContent::Tree(Vec::new()));
                let PropertyContent::Tree(entries) = content else {
                    return Err(BundleError::InvalidEntry(display));
                };
                if is_dir {
                    entries.push(TreeEntry::Dir(relative));
                } else {
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data)?;
                    entries.push(TreeEntry::File {
                        path: relative,
                        data,
                        mode,
                    });
                }
            }
            _ => return Err(BundleError::InvalidEntry(display)),
        }
    }

    let metadata = metadata.ok_or(BundleError::MissingMetadata)?;
    Ok(UnpackedBundle {
        metadata,
        properties,
    })
}

fn normal_components(path: &Path) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

impl UnpackedBundle {
    /// Check that the bundle carries exactly the declared output properties
    pub fn check_outputs(&self, outputs: &[ResolvedOutput]) -> Result<(), BundleError> {
        let expected: BTreeSet<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
        let found: BTreeSet<&str> = self.metadata.outputs.iter().map(String::as_str).collect();
        let mismatch = expected != found
            || self.properties.keys().any(|k| !expected.contains(k.as_str()));
        if mismatch {
            return Err(BundleError::OutputMismatch {
                expected: expected.into_iter().map(String::from).collect(),
                found: found.into_iter().map(String::from).collect(),
            });
        }
        Ok(())
    }

    /// Replace each output location with the bundled content.
    ///
    /// Returns the number of files written. A failure part way through leaves
    /// outputs partially overwritten.
    pub fn write_outputs(&self, outputs: &[ResolvedOutput]) -> io::Result<usize> {
        let mut written = 0;
        for output in outputs {
            let Some(location) = output.location.path() else {
                continue;
            };
            remove_location(location)?;

            match self.properties.get(&output.name) {
                None | Some(PropertyContent::Missing) => {}
                Some(PropertyContent::File { data, mode }) => {
                    write_file(location, data, *mode)?;
                    written += 1;
                }
                Some(PropertyContent::Tree(entries)) => {
                    fs::create_dir_all(location)?;
                    for entry in entries {
                        match entry {
                            TreeEntry::Dir(relative) => fs::create_dir_all(location.join(relative))?,
                            TreeEntry::File { path, data, mode } => {
                                write_file(&location.join(path), data, *mode)?;
                                written += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(written)
    }
}

/// Remove a file or directory if present
pub fn remove_location(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn write_file(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
