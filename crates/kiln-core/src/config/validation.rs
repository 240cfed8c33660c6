//! Configuration validation

use std::collections::HashSet;
use std::path::Component;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::defaults::NORMALIZATION_NAMES;
use super::types::{Config, UnitConfig};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_execution(config)?;
    validate_cache(config)?;
    validate_units(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_execution(config: &Config) -> Result<()> {
    if config.execution.concurrency == 0 {
        return Err(ConfigError::invalid(
            "execution.concurrency",
            "must be at least 1",
        )
        .into());
    }

    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    if config.cache.local.enabled && config.cache.local.directory.as_os_str().is_empty() {
        return Err(ConfigError::invalid("cache.local.directory", "cannot be empty").into());
    }

    if let Some(remote) = &config.cache.remote {
        let parsed = url::Url::parse(&remote.url)
            .map_err(|e| ConfigError::invalid("cache.remote.url", e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "cache.remote.url",
                format!("unsupported scheme '{}', expected http or https", parsed.scheme()),
            )
            .into());
        }
        if remote.timeout_secs == 0 {
            return Err(
                ConfigError::invalid("cache.remote.timeout_secs", "must be at least 1").into(),
            );
        }
    }

    Ok(())
}

fn validate_units(config: &Config) -> Result<()> {
    if !config.units.is_empty() {
        debug!(count = config.units.len(), "validating units");
    }
    for (name, unit) in &config.units {
        validate_unit(name, unit)?;
    }

    Ok(())
}

fn validate_unit(name: &str, unit: &UnitConfig) -> Result<()> {
    let field = |suffix: &str| format!("units.{}.{}", name, suffix);

    if name.contains(':') {
        return Err(ConfigError::invalid(format!("units.{}", name), "name cannot contain ':'").into());
    }

    if unit.command.trim().is_empty() {
        return Err(ConfigError::MissingField(field("command")).into());
    }

    for (property, input) in &unit.files {
        if !NORMALIZATION_NAMES.contains(&input.normalization.as_str()) {
            return Err(ConfigError::invalid(
                field(&format!("files.{}.normalization", property)),
                format!("must be one of: {}", NORMALIZATION_NAMES.join(", ")),
            )
            .into());
        }
        if input.paths.is_empty() && !input.optional && !input.skip_when_empty {
            return Err(ConfigError::invalid(
                field(&format!("files.{}.paths", property)),
                "must list at least one path unless the property is optional",
            )
            .into());
        }
    }

    let mut locations = HashSet::new();
    for (property, output) in &unit.outputs {
        match &output.path {
            Some(path) => {
                if path.components().any(|c| c == Component::ParentDir) {
                    return Err(ConfigError::invalid(
                        field(&format!("outputs.{}.path", property)),
                        format!("location {} cannot contain '..'", path.display()),
                    )
                    .into());
                }
                if !locations.insert(path.clone()) {
                    return Err(ConfigError::invalid(
                        field(&format!("outputs.{}.path", property)),
                        format!("location {} is declared by more than one output", path.display()),
                    )
                    .into());
                }
            }
            None if !output.optional => {
                return Err(ConfigError::MissingField(field(&format!("outputs.{}.path", property))).into());
            }
            None => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileInputConfig, OutputConfig, RemoteCacheConfig};
    use crate::error::KilnError;
    use std::path::PathBuf;

    fn unit(command: &str) -> UnitConfig {
        UnitConfig {
            command: command.to_string(),
            ..Default::default()
        }
    }

    fn config_with(name: &str, unit: UnitConfig) -> Config {
        let mut config = Config::default();
        config.units.insert(name.to_string(), unit);
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.execution.concurrency = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = config_with("compile", unit("  "));
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(
            err,
            KilnError::Config(ConfigError::MissingField(ref f)) if f == "units.compile.command"
        ));
    }

    #[test]
    fn test_unknown_normalization_rejected() {
        let mut u = unit("make");
        u.files.insert(
            "sources".to_string(),
            FileInputConfig {
                paths: vec!["src".to_string()],
                normalization: "fuzzy".to_string(),
                ..Default::default()
            },
        );
        assert!(validate_config(&config_with("compile", u)).is_err());
    }

    #[test]
    fn test_duplicate_output_location_rejected() {
        let mut u = unit("make");
        for name in ["a", "b"] {
            u.outputs.insert(
                name.to_string(),
                OutputConfig {
                    path: Some(PathBuf::from("build/out")),
                    ..Default::default()
                },
            );
        }
        assert!(validate_config(&config_with("compile", u)).is_err());
    }

    #[test]
    fn test_output_outside_project_rejected() {
        let mut u = unit("make");
        u.outputs.insert(
            "dist".to_string(),
            OutputConfig {
                path: Some(PathBuf::from("build/../../dist")),
                ..Default::default()
            },
        );
        let err = validate_config(&config_with("package", u)).unwrap_err();
        assert!(err.to_string().contains("cannot contain '..'"));
    }

    #[test]
    fn test_optional_output_without_path_allowed() {
        let mut u = unit("make");
        u.outputs.insert(
            "report".to_string(),
            OutputConfig {
                optional: true,
                ..Default::default()
            },
        );
        assert!(validate_config(&config_with("compile", u)).is_ok());
    }

    #[test]
    fn test_remote_url_scheme_checked() {
        let mut config = Config::default();
        config.cache.remote = Some(RemoteCacheConfig {
            url: "ftp://cache.example.com".to_string(),
            ..Default::default()
        });
        assert!(validate_config(&config).is_err());

        config.cache.remote = Some(RemoteCacheConfig {
            url: "https://cache.example.com/kiln".to_string(),
            ..Default::default()
        });
        assert!(validate_config(&config).is_ok());
    }
}
