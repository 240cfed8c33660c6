//! Init command - write a starter configuration

use std::path::Path;

use clap::Args;

use kiln_core::config::{default_config_toml, find_config, DEFAULT_CONFIG_TOML};

use crate::cli::{output, Cli};

/// Write a default kiln.toml
#[derive(Debug, Args)]
pub struct InitCommand {
    /// Overwrite an existing configuration
    #[arg(long)]
    pub force: bool,
}

impl InitCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let path = write_config(&cwd, self.force)?;
        if !cli.quiet {
            output::success(&format!("Created {}", path.display()));
        }
        Ok(())
    }
}

fn write_config(dir: &Path, force: bool) -> anyhow::Result<std::path::PathBuf> {
    if let Some(existing) = find_config(dir).filter(|p| p.parent() == Some(dir)) {
        if !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                existing.display()
            );
        }
    }
    let path = dir.join(DEFAULT_CONFIG_TOML);
    std::fs::write(&path, default_config_toml())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_config() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), false).unwrap();
        assert!(path.exists());
        kiln_core::load_config(&path).unwrap();

        assert!(write_config(temp.path(), false).is_err());
        assert!(write_config(temp.path(), true).is_ok());
    }
}
