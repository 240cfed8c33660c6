//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for kiln
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Build name, used in logs and origin metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Build cache configuration
    pub cache: CacheConfig,

    /// Execution configuration
    pub execution: ExecutionConfig,

    /// Execution history configuration
    pub history: HistoryConfig,

    /// Work unit declarations, keyed by unit name
    pub units: BTreeMap<String, UnitConfig>,
}

/// Build cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch for the build cache
    pub enabled: bool,

    /// Local directory cache
    pub local: LocalCacheConfig,

    /// Optional remote HTTP cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local: LocalCacheConfig::default(),
            remote: None,
        }
    }
}

/// Local directory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Whether the local cache is used
    pub enabled: bool,

    /// Cache directory, relative to the build root
    pub directory: PathBuf,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".kiln/cache"),
        }
    }
}

/// Remote HTTP cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    /// Base URL; entries live at `{url}/{key}`
    pub url: String,

    /// Whether results are pushed to the remote cache
    pub push: bool,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            push: false,
            timeout_secs: 30,
        }
    }
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum concurrent units
    pub concurrency: usize,

    /// Default for skipping units whose inputs and outputs are unchanged
    pub up_to_date_checks: bool,

    /// Keep starting independent units after one fails
    pub continue_on_error: bool,

    /// Managed output area; stale outputs are only deleted below these roots
    pub output_roots: Vec<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            up_to_date_checks: true,
            continue_on_error: false,
            output_roots: vec![PathBuf::from(".")],
        }
    }
}

/// Execution history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Directory holding one record per unit, relative to the build root
    pub directory: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".kiln/history"),
        }
    }
}

/// A work unit declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Project the unit belongs to (directory relative to the build root)
    pub project: String,

    /// Shell command to execute
    pub command: String,

    /// Extra implementation version; bump to invalidate previous results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Environment variables passed to the command (tracked as inputs)
    pub env: BTreeMap<String, String>,

    /// Scalar input properties
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// File input properties
    pub files: BTreeMap<String, FileInputConfig>,

    /// Output properties
    pub outputs: BTreeMap<String, OutputConfig>,

    /// Whether outputs may be loaded from / stored to the build cache
    pub cacheable: bool,

    /// Overrides `execution.up_to_date_checks` for this unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_to_date_checks: Option<bool>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            project: ".".to_string(),
            command: String::new(),
            version: None,
            env: BTreeMap::new(),
            inputs: BTreeMap::new(),
            files: BTreeMap::new(),
            outputs: BTreeMap::new(),
            cacheable: true,
            up_to_date_checks: None,
        }
    }
}

/// A file input property
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileInputConfig {
    /// Paths or glob patterns relative to the project directory
    pub paths: Vec<String>,

    /// Path normalization used when fingerprinting
    pub normalization: String,

    /// Marks the property as a source property: empty means nothing to do
    pub skip_when_empty: bool,

    /// Whether an empty `paths` list is acceptable
    pub optional: bool,
}

impl Default for FileInputConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            normalization: "relative".to_string(),
            skip_when_empty: false,
            optional: false,
        }
    }
}

/// Kind of an output location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKindConfig {
    /// A single file
    File,
    /// A directory tree
    #[default]
    Directory,
}

/// An output property
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Location relative to the project directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// File or directory
    pub kind: OutputKindConfig,

    /// Whether the property may be left without a location
    pub optional: bool,
}
