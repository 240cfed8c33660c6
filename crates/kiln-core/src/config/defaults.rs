//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "kiln.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "kiln.yaml";

/// Path normalization names accepted by file inputs
pub const NORMALIZATION_NAMES: [&str; 5] =
    ["absolute", "relative", "name-only", "ignore-path", "classpath"];

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".kiln.toml",
        ".kiln.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# kiln configuration

[cache]
enabled = true

[cache.local]
enabled = true
directory = ".kiln/cache"

# [cache.remote]
# url = "https://cache.example.com/kiln"
# push = false
# timeout_secs = 30

[execution]
concurrency = 4
up_to_date_checks = true
continue_on_error = false
output_roots = ["."]

[history]
directory = ".kiln/history"

[units.compile]
project = "."
command = "mkdir -p build/classes && cp src/*.txt build/classes/"

[units.compile.files.sources]
paths = ["src/**/*.txt"]
skip_when_empty = true

[units.compile.outputs.classes]
path = "build/classes"
kind = "directory"
"#;
