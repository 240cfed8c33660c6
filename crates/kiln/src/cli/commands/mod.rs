//! CLI commands

mod cache;
mod completions;
mod history;
mod init;
mod run;

use std::path::PathBuf;

use kiln_core::config::{load_config_from_dir, load_config_or_default};
use kiln_core::Config;

pub use cache::CacheCommand;
pub use completions::CompletionsCommand;
pub use history::HistoryCommand;
pub use init::InitCommand;
pub use run::{BuildFailed, RunCommand};

/// Loaded configuration and the build root it applies to
pub(crate) struct Project {
    pub config: Config,
    /// Directory holding the config file, or the working directory
    pub root: PathBuf,
}

impl Project {
    /// Load the nearest config file; fails when there is none
    pub fn load() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let (config, path) = load_config_from_dir(&cwd)?;
        let root = path.parent().map(PathBuf::from).unwrap_or(cwd);
        Ok(Self { config, root })
    }

    /// Load the nearest config file, falling back to defaults
    pub fn load_or_default() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let (config, path) = load_config_or_default(&cwd);
        let root = path
            .as_deref()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .unwrap_or(cwd);
        Ok(Self { config, root })
    }
}
