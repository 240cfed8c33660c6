//! Property resolution: declarations to concrete paths and values

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::fingerprint::Normalization;
use crate::unit::{InputProperty, InputValue, OutputKind, UnitId, WorkUnit};

/// Errors raised while resolving a unit's properties
#[derive(Debug, thiserror::Error)]
pub enum PropertyResolutionError {
    #[error("{unit}: no value has been specified for property '{property}'")]
    MissingValue { unit: UnitId, property: String },

    #[error("{unit}: failed to evaluate property '{property}': {message}")]
    ProviderFailed {
        unit: UnitId,
        property: String,
        message: String,
    },

    #[error("{unit}: invalid pattern '{pattern}' for property '{property}': {message}")]
    InvalidGlob {
        unit: UnitId,
        property: String,
        pattern: String,
        message: String,
    },

    #[error("{unit}: property '{property}' is declared more than once")]
    DuplicateProperty { unit: UnitId, property: String },
}

/// A file input resolved to concrete roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFileInput {
    pub name: String,
    /// Files and directories, in declaration order
    pub roots: Vec<PathBuf>,
    pub normalization: Normalization,
    pub skip_when_empty: bool,
}

/// Where an output property resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLocation {
    File(PathBuf),
    Directory(PathBuf),
    /// Optional output without a location
    Absent,
}

impl OutputLocation {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) | Self::Directory(path) => Some(path),
            Self::Absent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub name: String,
    pub location: OutputLocation,
}

/// A unit's declarations materialized for one execution attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedProperties {
    pub input_files: Vec<ResolvedFileInput>,
    pub scalar_inputs: BTreeMap<String, serde_json::Value>,
    pub outputs: Vec<ResolvedOutput>,
    /// Files of source properties; `None` when the unit declares none
    pub source_files: Option<Vec<PathBuf>>,
}

impl ResolvedProperties {
    /// Whether the unit declares any source property
    pub fn has_source_files(&self) -> bool {
        self.source_files.is_some()
    }

    /// A source property is declared and it resolved to no files
    pub fn source_files_empty(&self) -> bool {
        self.source_files.as_ref().is_some_and(Vec::is_empty)
    }

    pub fn output(&self, name: &str) -> Option<&ResolvedOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Locations of all outputs that resolved to a path
    pub fn output_paths(&self) -> impl Iterator<Item = &Path> {
        self.outputs.iter().filter_map(|o| o.location.path())
    }
}

/// Resolves work unit declarations against the filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyResolver;

impl PropertyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve every declared property. Reads the filesystem, never writes it.
    #[instrument(skip_all, fields(unit = %unit.id))]
    pub fn resolve(&self, unit: &WorkUnit) -> Result<ResolvedProperties, PropertyResolutionError> {
        let mut resolved = ResolvedProperties::default();
        let mut seen = HashSet::new();
        let mut sources: Option<Vec<PathBuf>> = None;

        self.resolve_inputs(unit, "", &unit.inputs, &mut seen, &mut resolved, &mut sources)?;

        for output in &unit.outputs {
            if !seen.insert(output.name.clone()) {
                return Err(PropertyResolutionError::DuplicateProperty {
                    unit: unit.id.clone(),
                    property: output.name.clone(),
                });
            }
            let value = output.location.evaluate().map_err(|message| {
                PropertyResolutionError::ProviderFailed {
                    unit: unit.id.clone(),
                    property: output.name.clone(),
                    message,
                }
            })?;
            let location = match (value, output.optional) {
                (Some(path), _) => {
                    let path = unit.project_dir.join(path);
                    match output.kind {
                        OutputKind::File => OutputLocation::File(path),
                        OutputKind::Directory => OutputLocation::Directory(path),
                    }
                }
                (None, true) => OutputLocation::Absent,
                (None, false) => {
                    return Err(PropertyResolutionError::MissingValue {
                        unit: unit.id.clone(),
                        property: output.name.clone(),
                    })
                }
            };
            resolved.outputs.push(ResolvedOutput {
                name: output.name.clone(),
                location,
            });
        }

        resolved.source_files = sources;
        debug!(
            inputs = resolved.input_files.len(),
            scalars = resolved.scalar_inputs.len(),
            outputs = resolved.outputs.len(),
            sources = resolved.source_files.as_ref().map(Vec::len),
            "resolved properties"
        );
        Ok(resolved)
    }

    fn resolve_inputs(
        &self,
        unit: &WorkUnit,
        prefix: &str,
        inputs: &[InputProperty],
        seen: &mut HashSet<String>,
        resolved: &mut ResolvedProperties,
        sources: &mut Option<Vec<PathBuf>>,
    ) -> Result<(), PropertyResolutionError> {
        for input in inputs {
            let name = format!("{}{}", prefix, input.name);
            if let InputValue::Nested(children) = &input.value {
                let prefix = format!("{}.", name);
                self.resolve_inputs(unit, &prefix, children, seen, resolved, sources)?;
                continue;
            }
            if !seen.insert(name.clone()) {
                return Err(PropertyResolutionError::DuplicateProperty {
                    unit: unit.id.clone(),
                    property: name,
                });
            }

            let provider_failed = |message| PropertyResolutionError::ProviderFailed {
                unit: unit.id.clone(),
                property: name.clone(),
                message,
            };
            let missing = || PropertyResolutionError::MissingValue {
                unit: unit.id.clone(),
                property: name.clone(),
            };

            match &input.value {
                InputValue::Nested(_) => {}
                InputValue::Scalar(value) => match value.evaluate().map_err(provider_failed)? {
                    Some(value) => {
                        resolved.scalar_inputs.insert(name, value);
                    }
                    None if input.optional => {
                        resolved.scalar_inputs.insert(name, serde_json::Value::Null);
                    }
                    None => return Err(missing()),
                },
                InputValue::Files(files) => {
                    let patterns = match files.paths.evaluate().map_err(provider_failed)? {
                        Some(patterns) => patterns,
                        None if input.optional || files.skip_when_empty => Vec::new(),
                        None => return Err(missing()),
                    };
                    let roots = expand_patterns(unit, &name, &patterns)?;
                    if files.skip_when_empty {
                        let found = sources.get_or_insert_with(Vec::new);
                        found.extend(existing_files(&roots));
                    }
                    resolved.input_files.push(ResolvedFileInput {
                        name,
                        roots,
                        normalization: files.normalization,
                        skip_when_empty: files.skip_when_empty,
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn expand_patterns(
    unit: &WorkUnit,
    property: &str,
    patterns: &[String],
) -> Result<Vec<PathBuf>, PropertyResolutionError> {
    let mut roots = Vec::new();
    for pattern in patterns {
        if !is_glob(pattern) {
            roots.push(unit.project_dir.join(pattern));
            continue;
        }
        let full = unit.project_dir.join(pattern);
        let invalid = |message: String| PropertyResolutionError::InvalidGlob {
            unit: unit.id.clone(),
            property: property.to_string(),
            pattern: pattern.clone(),
            message,
        };
        let paths = glob::glob(&full.to_string_lossy()).map_err(|e| invalid(e.to_string()))?;
        let mut matched = Vec::new();
        for path in paths {
            matched.push(path.map_err(|e| invalid(e.to_string()))?);
        }
        matched.sort();
        roots.extend(matched);
    }
    Ok(roots)
}

fn existing_files(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        if root.is_file() {
            files.push(root.clone());
        } else if root.is_dir() {
            files.extend(
                WalkDir::new(root)
                    .follow_links(true)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path()),
            );
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ShellAction;
    use crate::unit::{FileInput, OutputProperty, PropertyValue};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn builder(dir: &Path) -> crate::unit::WorkUnitBuilder {
        WorkUnit::builder(UnitId::new("p", "compile"), Arc::new(ShellAction::new("true")))
            .with_project_dir(dir)
    }

    #[test]
    fn test_resolves_globs_and_sources() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("src/nested")).unwrap();
        std::fs::write(temp.path().join("src/a.c"), "a").unwrap();
        std::fs::write(temp.path().join("src/nested/b.c"), "b").unwrap();
        std::fs::write(temp.path().join("src/readme.md"), "r").unwrap();

        let unit = builder(temp.path())
            .with_source_files("sources", vec!["src/**/*.c".to_string()])
            .with_input_value("opt", serde_json::json!("O2"))
            .with_output_dir("classes", "build/classes")
            .build()
            .unwrap();

        let resolved = PropertyResolver::new().resolve(&unit).unwrap();
        assert!(resolved.has_source_files());
        assert!(!resolved.source_files_empty());
        assert_eq!(
            resolved.source_files.unwrap(),
            vec![temp.path().join("src/a.c"), temp.path().join("src/nested/b.c")]
        );
        assert_eq!(resolved.scalar_inputs["opt"], serde_json::json!("O2"));
        assert_eq!(
            resolved.outputs[0].location,
            OutputLocation::Directory(temp.path().join("build/classes"))
        );
    }

    #[test]
    fn test_empty_source_distinct_from_no_source() {
        let temp = TempDir::new().unwrap();
        let with_source = builder(temp.path())
            .with_source_files("sources", vec!["src/**/*.c".to_string()])
            .build()
            .unwrap();
        let resolved = PropertyResolver::new().resolve(&with_source).unwrap();
        assert!(resolved.source_files_empty());

        let without_source = builder(temp.path())
            .with_input_files("config", vec!["conf".to_string()], Normalization::RelativePath)
            .build()
            .unwrap();
        let resolved = PropertyResolver::new().resolve(&without_source).unwrap();
        assert!(!resolved.has_source_files());
        assert!(!resolved.source_files_empty());
    }

    #[test]
    fn test_missing_required_output_fails() {
        let temp = TempDir::new().unwrap();
        let unit = builder(temp.path())
            .with_output(OutputProperty {
                name: "classes".to_string(),
                kind: OutputKind::Directory,
                location: PropertyValue::Missing,
                optional: false,
            })
            .build()
            .unwrap();
        let err = PropertyResolver::new().resolve(&unit).unwrap_err();
        assert!(matches!(err, PropertyResolutionError::MissingValue { ref property, .. } if property == "classes"));
    }

    #[test]
    fn test_optional_output_resolves_absent() {
        let temp = TempDir::new().unwrap();
        let unit = builder(temp.path())
            .with_output(OutputProperty {
                name: "report".to_string(),
                kind: OutputKind::File,
                location: PropertyValue::Missing,
                optional: true,
            })
            .build()
            .unwrap();
        let resolved = PropertyResolver::new().resolve(&unit).unwrap();
        assert_eq!(resolved.outputs[0].location, OutputLocation::Absent);
        assert_eq!(resolved.output_paths().count(), 0);
    }

    #[test]
    fn test_deferred_failure_and_nested_names() {
        let temp = TempDir::new().unwrap();
        let unit = builder(temp.path())
            .with_input(InputProperty {
                name: "options".to_string(),
                value: InputValue::Nested(vec![InputProperty {
                    name: "level".to_string(),
                    value: InputValue::Scalar(PropertyValue::deferred(|| Ok(Some(serde_json::json!(3))))),
                    optional: false,
                }]),
                optional: false,
            })
            .build()
            .unwrap();
        let resolved = PropertyResolver::new().resolve(&unit).unwrap();
        assert_eq!(resolved.scalar_inputs["options.level"], serde_json::json!(3));

        let failing = builder(temp.path())
            .with_input(InputProperty {
                name: "files".to_string(),
                value: InputValue::Files(FileInput {
                    paths: PropertyValue::deferred(|| Err("not configured".to_string())),
                    normalization: Normalization::RelativePath,
                    skip_when_empty: false,
                }),
                optional: false,
            })
            .build()
            .unwrap();
        let err = PropertyResolver::new().resolve(&failing).unwrap_err();
        assert!(matches!(err, PropertyResolutionError::ProviderFailed { .. }));
    }

    #[test]
    fn test_invalid_glob_reported() {
        let temp = TempDir::new().unwrap();
        let unit = builder(temp.path())
            .with_input_files("bad", vec!["src/[".to_string()], Normalization::RelativePath)
            .build()
            .unwrap();
        let err = PropertyResolver::new().resolve(&unit).unwrap_err();
        assert!(matches!(err, PropertyResolutionError::InvalidGlob { .. }));
    }
}
