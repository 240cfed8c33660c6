//! Wiring from `kiln.toml` declarations to units and execution services

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::config::{OutputKindConfig, UnitConfig};
use kiln_core::{Config, ConfigError, Result};
use tracing::debug;

use crate::action::ShellAction;
use crate::cache::{BuildCache, HttpTransport, LocalDirectoryTransport};
use crate::fingerprint::Normalization;
use crate::history::FileExecutionHistory;
use crate::pipeline::ExecutionServices;
use crate::registry::OutputRegistry;
use crate::scheduler::SchedulerOptions;
use crate::unit::{
    CachingPolicy, FileInput, ImplementationIdentity, InputProperty, InputValue, OutputKind,
    OutputProperty, PropertyValue, UnitDefinitionError, UnitId, WorkUnit,
};

/// Build a work unit for every `[units.<name>]` entry
pub fn units_from_config(config: &Config, root: &Path) -> Result<Vec<WorkUnit>> {
    config
        .units
        .iter()
        .map(|(name, unit)| unit_from_config(name, unit, root))
        .collect()
}

fn unit_from_config(name: &str, config: &UnitConfig, root: &Path) -> Result<WorkUnit> {
    let field = format!("units.{}", name);
    let id = UnitId::new(config.project.clone(), name);
    let action = ShellAction::new(config.command.clone()).with_env(config.env.clone());

    let version = match &config.version {
        Some(version) => format!("{} ({})", config.command, version),
        None => config.command.clone(),
    };
    let mut builder = WorkUnit::builder(id.clone(), Arc::new(action))
        .with_project_dir(root.join(&config.project))
        .with_implementation(ImplementationIdentity::new("shell", version));

    for (input, value) in &config.inputs {
        builder = builder.with_input_value(input.clone(), value.clone());
    }
    if !config.env.is_empty() {
        let env = serde_json::to_value(&config.env)
            .map_err(|e| ConfigError::invalid(format!("{}.env", field), e.to_string()))?;
        builder = builder.with_input_value("env", env);
    }

    for (input, files) in &config.files {
        let normalization: Normalization = files.normalization.parse().map_err(|_| {
            let error = UnitDefinitionError::InvalidNormalization {
                unit: id.clone(),
                property: input.clone(),
                value: files.normalization.clone(),
            };
            ConfigError::invalid(field.clone(), error.to_string())
        })?;
        let paths = if files.paths.is_empty() && files.optional {
            PropertyValue::Missing
        } else {
            PropertyValue::Fixed(files.paths.clone())
        };
        builder = builder.with_input(InputProperty {
            name: input.clone(),
            value: InputValue::Files(FileInput {
                paths,
                normalization,
                skip_when_empty: files.skip_when_empty,
            }),
            optional: files.optional,
        });
    }

    for (output, declared) in &config.outputs {
        let kind = match declared.kind {
            OutputKindConfig::File => OutputKind::File,
            OutputKindConfig::Directory => OutputKind::Directory,
        };
        let location = match &declared.path {
            Some(path) => PropertyValue::Fixed(path.clone()),
            None => PropertyValue::Missing,
        };
        builder = builder.with_output(OutputProperty {
            name: output.clone(),
            kind,
            location,
            optional: declared.optional,
        });
    }

    if !config.cacheable {
        builder = builder.with_caching(CachingPolicy::Disabled(
            "caching disabled in configuration".to_string(),
        ));
    }
    if let Some(enabled) = config.up_to_date_checks {
        builder = builder.with_up_to_date_checks(enabled);
    }

    builder
        .build()
        .map_err(|e| ConfigError::invalid(field, e.to_string()).into())
}

/// Build cache as configured, rooted at `root`
pub fn build_cache_from_config(config: &Config, root: &Path) -> Result<BuildCache> {
    let cache_config = &config.cache;
    if !cache_config.enabled {
        return Ok(BuildCache::disabled());
    }

    let mut cache = BuildCache::disabled();
    if cache_config.local.enabled {
        let dir = root.join(&cache_config.local.directory);
        debug!(dir = %dir.display(), "using local build cache");
        cache = cache.with_local(Arc::new(LocalDirectoryTransport::new(dir)));
    }
    if let Some(remote) = &cache_config.remote {
        let transport = HttpTransport::new(&remote.url, Duration::from_secs(remote.timeout_secs))
            .map_err(|e| ConfigError::invalid("cache.remote.url", e.to_string()))?;
        debug!(url = %remote.url, push = remote.push, "using remote build cache");
        cache = cache.with_remote(Arc::new(transport), remote.push);
    }
    Ok(cache)
}

/// Execution services backed by on-disk history and the configured cache
pub fn services_from_config(config: &Config, root: &Path) -> Result<ExecutionServices> {
    let history = FileExecutionHistory::new(root.join(&config.history.directory));
    let roots = config
        .execution
        .output_roots
        .iter()
        .map(|r| root.join(r))
        .collect();

    Ok(ExecutionServices::new(Arc::new(history))
        .with_cache(build_cache_from_config(config, root)?)
        .with_registry(OutputRegistry::new(roots))
        .with_up_to_date_checks(config.execution.up_to_date_checks))
}

pub fn scheduler_options(config: &Config) -> SchedulerOptions {
    SchedulerOptions {
        concurrency: config.execution.concurrency,
        continue_on_error: config.execution.continue_on_error,
    }
}
