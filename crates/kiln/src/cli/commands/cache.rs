//! Cache management command

use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;

use kiln_tasks::cache::{format_size, LocalDirectoryTransport};

use super::Project;
use crate::cli::{output, Cli, OutputFormat};

/// Build cache maintenance
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove old cache entries
    Prune(CachePruneCommand),
    /// Show cache statistics
    Status(CacheStatusCommand),
    /// Clear all cached entries
    Clean(CacheCleanCommand),
}

/// Prune old cache entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Maximum age in days (default: 7)
    #[arg(long, default_value = "7")]
    pub max_age_days: u64,
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Clear all cached entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let project = Project::load_or_default()?;
        let cache = LocalDirectoryTransport::new(
            project.root.join(&project.config.cache.local.directory),
        );
        match &self.action {
            CacheAction::Prune(cmd) => cmd.execute(cli, &cache),
            CacheAction::Status(cmd) => cmd.execute(cli, &cache),
            CacheAction::Clean(cmd) => cmd.execute(cli, &cache),
        }
    }
}

impl CachePruneCommand {
    fn execute(&self, cli: &Cli, cache: &LocalDirectoryTransport) -> anyhow::Result<()> {
        let max_age = Duration::from_secs(self.max_age_days * 24 * 60 * 60);

        if !cli.quiet && cli.format == OutputFormat::Text {
            output::info(&format!(
                "Pruning cache entries older than {} days...",
                self.max_age_days
            ));
        }

        let stats = cache.prune(max_age)?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "total": stats.total,
                "removed": stats.removed,
                "kept": stats.kept,
                "freed_bytes": stats.freed_bytes,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "  {} Removed {} of {} entries ({} kept, {} freed)",
                style("✓").green(),
                stats.removed,
                stats.total,
                stats.kept,
                format_size(stats.freed_bytes)
            );
        }

        Ok(())
    }
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli, cache: &LocalDirectoryTransport) -> anyhow::Result<()> {
        let stats = cache.status()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "cache_dir": cache.dir().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", output::header("Build Cache Status"));
            println!();
            println!(
                "{}",
                output::key_value(
                    "Location",
                    &output::path_style().apply_to(cache.dir().display()).to_string()
                )
            );
            println!("{}", output::key_value("Entries", &stats.entries.to_string()));
            println!(
                "{}",
                output::key_value("Size", &style(stats.formatted_size()).yellow().to_string())
            );
        }

        Ok(())
    }
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli, cache: &LocalDirectoryTransport) -> anyhow::Result<()> {
        if !cache.dir().exists() {
            if !cli.quiet {
                output::success("Cache directory does not exist.");
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all cached entries at {}?",
                    cache.dir().display()
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                output::warning("Aborted.");
                return Ok(());
            }
        }

        let stats = cache.clean()?;

        if !cli.quiet {
            println!(
                "{} Removed {} entries ({}) at {}",
                style("✓").green(),
                stats.entries,
                stats.formatted_size(),
                output::path_style().apply_to(cache.dir().display())
            );
        }

        Ok(())
    }
}
