//! Work unit types and declarations

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::WorkAction;
use crate::fingerprint::Normalization;
use crate::hash::{Digest, Hasher};

/// Unique identifier for a work unit within the build
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    /// Project the unit belongs to
    pub project: String,
    /// Unit name (e.g., "compile", "test")
    pub name: String,
}

impl UnitId {
    /// Create a new unit ID
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    /// Parse a unit ID from "project:name" format
    pub fn parse(s: &str) -> Option<Self> {
        let (project, name) = s.rsplit_once(':')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(project, name))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.name)
    }
}

type Provider<T> = Arc<dyn Fn() -> Result<Option<T>, String> + Send + Sync>;

/// A property value, possibly evaluated lazily at execution time
pub enum PropertyValue<T> {
    /// A value known at declaration time
    Fixed(T),
    /// No value was provided
    Missing,
    /// Computed when the unit executes; `Ok(None)` means no value
    Deferred(Provider<T>),
}

impl<T: Clone> PropertyValue<T> {
    /// Wrap a closure evaluated at execution time
    pub fn deferred<F>(provider: F) -> Self
    where
        F: Fn() -> Result<Option<T>, String> + Send + Sync + 'static,
    {
        Self::Deferred(Arc::new(provider))
    }

    /// Evaluate the value
    pub fn evaluate(&self) -> Result<Option<T>, String> {
        match self {
            Self::Fixed(value) => Ok(Some(value.clone())),
            Self::Missing => Ok(None),
            Self::Deferred(provider) => provider(),
        }
    }
}

impl<T: Clone> Clone for PropertyValue<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(value) => Self::Fixed(value.clone()),
            Self::Missing => Self::Missing,
            Self::Deferred(provider) => Self::Deferred(Arc::clone(provider)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PropertyValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Self::Missing => f.write_str("Missing"),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A file collection input
#[derive(Debug, Clone)]
pub struct FileInput {
    /// Paths or glob patterns, relative to the project directory
    pub paths: PropertyValue<Vec<String>>,
    /// How paths are normalized when fingerprinting
    pub normalization: Normalization,
    /// Source property: when it resolves to no files the unit has nothing to do
    pub skip_when_empty: bool,
}

/// Value of an input property
#[derive(Debug, Clone)]
pub enum InputValue {
    Files(FileInput),
    Scalar(PropertyValue<serde_json::Value>),
    /// Child properties, resolved as `parent.child`
    Nested(Vec<InputProperty>),
}

/// A declared input property
#[derive(Debug, Clone)]
pub struct InputProperty {
    pub name: String,
    pub value: InputValue,
    pub optional: bool,
}

impl InputProperty {
    fn declares_source(&self) -> bool {
        match &self.value {
            InputValue::Files(files) => files.skip_when_empty,
            InputValue::Scalar(_) => false,
            InputValue::Nested(children) => children.iter().any(InputProperty::declares_source),
        }
    }
}

/// Kind of an output location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    File,
    Directory,
}

/// A declared output property
#[derive(Debug, Clone)]
pub struct OutputProperty {
    pub name: String,
    pub kind: OutputKind,
    /// Location, relative to the project directory
    pub location: PropertyValue<PathBuf>,
    /// An optional output without a location resolves as declared-absent
    pub optional: bool,
}

/// Whether a unit's outputs may be cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachingPolicy {
    Enabled,
    Disabled(String),
}

impl CachingPolicy {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Values a transform-style unit may receive, replacing reflective injection
#[derive(Debug, Clone, Default)]
pub struct InjectableValues {
    /// The artifact being transformed
    pub primary_input: Option<PathBuf>,
    /// Isolated transform parameters
    pub parameters: Option<serde_json::Value>,
    /// Dependencies of the primary input; only present when requested
    pub dependencies: Option<Vec<PathBuf>>,
}

impl InjectableValues {
    pub fn requires_dependencies(&self) -> bool {
        self.dependencies.is_some()
    }
}

/// Kind of unit, selecting defaults for incremental behavior
#[derive(Debug, Clone)]
pub enum UnitKind {
    /// A task; up-to-date checks on by default
    Task,
    /// An artifact transform; identified purely by its inputs, so it relies
    /// on the build cache and skips up-to-date checks by default
    Transform(InjectableValues),
}

impl UnitKind {
    fn default_up_to_date_checks(&self) -> bool {
        matches!(self, Self::Task)
    }
}

/// Stable identity of a unit's logic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationIdentity {
    /// Implementation type (e.g., "shell")
    pub type_name: String,
    /// Anything that changes the logic: command line, tool version
    pub version: String,
}

impl ImplementationIdentity {
    pub fn new(type_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            version: version.into(),
        }
    }

    pub fn digest(&self) -> Digest {
        let mut hasher = Hasher::new();
        hasher.put_str(&self.type_name);
        hasher.put_str(&self.version);
        hasher.finish()
    }
}

/// Errors raised while declaring a unit
#[derive(Debug, thiserror::Error)]
pub enum UnitDefinitionError {
    #[error("{unit} declares property '{property}' more than once")]
    DuplicateProperty { unit: UnitId, property: String },

    #[error("{unit}: unknown normalization '{value}' for property '{property}'")]
    InvalidNormalization {
        unit: UnitId,
        property: String,
        value: String,
    },
}

/// A named piece of work with declared inputs and outputs.
///
/// Immutable once built; one build executes it at most once.
#[derive(Clone)]
pub struct WorkUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    pub implementation: ImplementationIdentity,
    /// Base directory for relative input and output paths
    pub project_dir: PathBuf,
    pub inputs: Vec<InputProperty>,
    pub outputs: Vec<OutputProperty>,
    pub caching: CachingPolicy,
    pub up_to_date_checks: bool,
    pub action: Arc<dyn WorkAction>,
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("implementation", &self.implementation)
            .field("project_dir", &self.project_dir)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("caching", &self.caching)
            .field("up_to_date_checks", &self.up_to_date_checks)
            .finish_non_exhaustive()
    }
}

impl WorkUnit {
    /// Start declaring a task
    pub fn builder(id: UnitId, action: Arc<dyn WorkAction>) -> WorkUnitBuilder {
        WorkUnitBuilder::new(id, UnitKind::Task, action)
    }

    /// Start declaring a transform; injectable values become input properties
    pub fn transform(
        id: UnitId,
        action: Arc<dyn WorkAction>,
        injectables: InjectableValues,
    ) -> WorkUnitBuilder {
        let mut builder = WorkUnitBuilder::new(id, UnitKind::Transform(injectables.clone()), action);
        if let Some(primary) = &injectables.primary_input {
            builder = builder.with_input_files(
                "primaryInput",
                vec![primary.to_string_lossy().into_owned()],
                Normalization::AbsolutePath,
            );
        }
        if let Some(dependencies) = &injectables.dependencies {
            let paths = dependencies
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            builder = builder.with_input_files("primaryInputDependencies", paths, Normalization::Classpath);
        }
        if let Some(parameters) = injectables.parameters {
            builder = builder.with_input_value("parameters", parameters);
        }
        builder
    }

    /// Whether any file input is a source property
    pub fn declares_source(&self) -> bool {
        self.inputs.iter().any(InputProperty::declares_source)
    }

    pub fn injectables(&self) -> Option<&InjectableValues> {
        match &self.kind {
            UnitKind::Transform(values) => Some(values),
            UnitKind::Task => None,
        }
    }
}

/// Builder for [`WorkUnit`]
pub struct WorkUnitBuilder {
    id: UnitId,
    kind: UnitKind,
    action: Arc<dyn WorkAction>,
    implementation: Option<ImplementationIdentity>,
    project_dir: PathBuf,
    inputs: Vec<InputProperty>,
    outputs: Vec<OutputProperty>,
    caching: CachingPolicy,
    up_to_date_checks: Option<bool>,
}

impl WorkUnitBuilder {
    fn new(id: UnitId, kind: UnitKind, action: Arc<dyn WorkAction>) -> Self {
        Self {
            id,
            kind,
            action,
            implementation: None,
            project_dir: PathBuf::from("."),
            inputs: Vec::new(),
            outputs: Vec::new(),
            caching: CachingPolicy::Enabled,
            up_to_date_checks: None,
        }
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    /// Override the implementation identity; defaults to the action's description
    pub fn with_implementation(mut self, implementation: ImplementationIdentity) -> Self {
        self.implementation = Some(implementation);
        self
    }

    pub fn with_input(mut self, property: InputProperty) -> Self {
        self.inputs.push(property);
        self
    }

    pub fn with_input_files(
        self,
        name: impl Into<String>,
        paths: Vec<String>,
        normalization: Normalization,
    ) -> Self {
        self.with_input(InputProperty {
            name: name.into(),
            value: InputValue::Files(FileInput {
                paths: PropertyValue::Fixed(paths),
                normalization,
                skip_when_empty: false,
            }),
            optional: false,
        })
    }

    /// Declare a source property (skipped when empty)
    pub fn with_source_files(self, name: impl Into<String>, paths: Vec<String>) -> Self {
        self.with_input(InputProperty {
            name: name.into(),
            value: InputValue::Files(FileInput {
                paths: PropertyValue::Fixed(paths),
                normalization: Normalization::RelativePath,
                skip_when_empty: true,
            }),
            optional: false,
        })
    }

    pub fn with_input_value(self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.with_input(InputProperty {
            name: name.into(),
            value: InputValue::Scalar(PropertyValue::Fixed(value)),
            optional: false,
        })
    }

    pub fn with_output(mut self, property: OutputProperty) -> Self {
        self.outputs.push(property);
        self
    }

    pub fn with_output_file(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.with_output(OutputProperty {
            name: name.into(),
            kind: OutputKind::File,
            location: PropertyValue::Fixed(path.into()),
            optional: false,
        })
    }

    pub fn with_output_dir(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.with_output(OutputProperty {
            name: name.into(),
            kind: OutputKind::Directory,
            location: PropertyValue::Fixed(path.into()),
            optional: false,
        })
    }

    pub fn with_caching(mut self, caching: CachingPolicy) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_up_to_date_checks(mut self, enabled: bool) -> Self {
        self.up_to_date_checks = Some(enabled);
        self
    }

    /// Freeze the declarations
    pub fn build(self) -> Result<WorkUnit, UnitDefinitionError> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        collect_input_names("", &self.inputs, &mut names);
        names.extend(self.outputs.iter().map(|o| o.name.clone()));
        for name in names {
            if !seen.insert(name.clone()) {
                return Err(UnitDefinitionError::DuplicateProperty {
                    unit: self.id,
                    property: name,
                });
            }
        }

        let implementation = self
            .implementation
            .unwrap_or_else(|| ImplementationIdentity::new("action", self.action.describe()));
        let up_to_date_checks = self
            .up_to_date_checks
            .unwrap_or_else(|| self.kind.default_up_to_date_checks());

        Ok(WorkUnit {
            id: self.id,
            kind: self.kind,
            implementation,
            project_dir: self.project_dir,
            inputs: self.inputs,
            outputs: self.outputs,
            caching: self.caching,
            up_to_date_checks,
            action: self.action,
        })
    }
}

fn collect_input_names(prefix: &str, inputs: &[InputProperty], names: &mut Vec<String>) {
    for input in inputs {
        let name = format!("{}{}", prefix, input.name);
        if let InputValue::Nested(children) = &input.value {
            collect_input_names(&format!("{}.", name), children, names);
        } else {
            names.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ShellAction;

    fn action() -> Arc<dyn WorkAction> {
        Arc::new(ShellAction::new("true"))
    }

    #[test]
    fn test_unit_id_display_and_parse() {
        let id = UnitId::new("core", "compile");
        assert_eq!(id.to_string(), "core:compile");
        assert_eq!(UnitId::parse("core:compile"), Some(id));
        assert_eq!(UnitId::parse("a:b:c"), Some(UnitId::new("a:b", "c")));
        assert!(UnitId::parse("nocolon").is_none());
        assert!(UnitId::parse("core:").is_none());
    }

    #[test]
    fn test_property_value_evaluation() {
        assert_eq!(PropertyValue::Fixed(3).evaluate(), Ok(Some(3)));
        assert_eq!(PropertyValue::<i32>::Missing.evaluate(), Ok(None));
        let deferred = PropertyValue::deferred(|| Ok(Some(7)));
        assert_eq!(deferred.evaluate(), Ok(Some(7)));
        let failing = PropertyValue::<i32>::deferred(|| Err("boom".to_string()));
        assert!(failing.evaluate().is_err());
    }

    #[test]
    fn test_builder_detects_duplicate_properties() {
        let result = WorkUnit::builder(UnitId::new("p", "u"), action())
            .with_source_files("src", vec!["src".to_string()])
            .with_output_dir("src", "build")
            .build();
        assert!(matches!(
            result,
            Err(UnitDefinitionError::DuplicateProperty { ref property, .. }) if property == "src"
        ));
    }

    #[test]
    fn test_declares_source_through_nesting() {
        let nested = InputProperty {
            name: "group".to_string(),
            value: InputValue::Nested(vec![InputProperty {
                name: "sources".to_string(),
                value: InputValue::Files(FileInput {
                    paths: PropertyValue::Fixed(vec!["src".to_string()]),
                    normalization: Normalization::RelativePath,
                    skip_when_empty: true,
                }),
                optional: false,
            }]),
            optional: false,
        };
        let unit = WorkUnit::builder(UnitId::new("p", "u"), action())
            .with_input(nested)
            .build()
            .unwrap();
        assert!(unit.declares_source());

        let plain = WorkUnit::builder(UnitId::new("p", "v"), action())
            .with_input_value("level", serde_json::json!(2))
            .build()
            .unwrap();
        assert!(!plain.declares_source());
    }

    #[test]
    fn test_up_to_date_defaults_follow_kind() {
        let task = WorkUnit::builder(UnitId::new("p", "t"), action()).build().unwrap();
        assert!(task.up_to_date_checks);

        let transform = WorkUnit::transform(
            UnitId::new("p", "x"),
            action(),
            InjectableValues {
                primary_input: Some(PathBuf::from("lib.jar")),
                parameters: Some(serde_json::json!({"minify": true})),
                dependencies: None,
            },
        )
        .build()
        .unwrap();
        assert!(!transform.up_to_date_checks);
        let names: Vec<_> = transform.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["primaryInput", "parameters"]);
        assert!(!transform.injectables().unwrap().requires_dependencies());
    }

    #[test]
    fn test_implementation_digest_changes_with_version() {
        let a = ImplementationIdentity::new("shell", "cc -O2");
        let b = ImplementationIdentity::new("shell", "cc -O3");
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }
}
