//! History command - inspect previous execution states

use clap::{Args, Subcommand};
use console::style;

use kiln_tasks::{ExecutionHistory, FileExecutionHistory, UnitId};

use super::Project;
use crate::cli::{output, Cli, OutputFormat};

/// Inspect or clear execution history
#[derive(Debug, Args)]
pub struct HistoryCommand {
    #[command(subcommand)]
    pub action: HistoryAction,
}

/// History subcommands
#[derive(Debug, Subcommand)]
pub enum HistoryAction {
    /// Show recorded executions
    Show(HistoryShowCommand),
    /// Forget recorded executions, forcing units to run again
    Clear(HistoryClearCommand),
}

/// Show recorded executions
#[derive(Debug, Args)]
pub struct HistoryShowCommand {
    /// Only show this unit (`project:name`)
    pub unit: Option<String>,
}

/// Forget recorded executions
#[derive(Debug, Args)]
pub struct HistoryClearCommand {
    /// Only forget this unit (`project:name`)
    pub unit: Option<String>,

    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl HistoryCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let project = Project::load_or_default()?;
        let history = FileExecutionHistory::new(project.root.join(&project.config.history.directory));
        match &self.action {
            HistoryAction::Show(cmd) => cmd.execute(cli, &history),
            HistoryAction::Clear(cmd) => cmd.execute(cli, &history),
        }
    }
}

fn parse_unit(value: &str) -> anyhow::Result<UnitId> {
    UnitId::parse(value)
        .ok_or_else(|| anyhow::anyhow!("invalid unit '{}', expected project:name", value))
}

impl HistoryShowCommand {
    fn execute(&self, cli: &Cli, history: &FileExecutionHistory) -> anyhow::Result<()> {
        let records = match &self.unit {
            Some(unit) => history.load(&parse_unit(unit)?)?.into_iter().collect(),
            None => history.list()?,
        };

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&records)?);
            return Ok(());
        }
        if cli.quiet {
            return Ok(());
        }
        if records.is_empty() {
            output::info("No execution history recorded.");
            return Ok(());
        }

        println!("{}", output::header("Execution History"));
        for record in &records {
            println!();
            println!("  {}", style(&record.unit).bold());
            println!(
                "{}",
                output::key_value("Recorded", &record.recorded_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            );
            println!(
                "{}",
                output::key_value(
                    "Cache key",
                    record.cache_key.as_ref().map(|k| k.digest().short()).unwrap_or("-")
                )
            );
            println!(
                "{}",
                output::key_value(
                    "Execution",
                    &format!(
                        "{:.1}s in build {}",
                        record.origin.execution_time().as_secs_f64(),
                        record.origin.build_invocation_id
                    )
                )
            );
            if cli.verbose {
                for (name, fingerprint) in &record.input_files {
                    println!(
                        "    {} {} {} files",
                        style("in ").dim(),
                        name,
                        fingerprint.entries.len()
                    );
                }
                for (name, fingerprint) in &record.output_files {
                    println!(
                        "    {} {} {} entries",
                        style("out").dim(),
                        name,
                        fingerprint.entries.len()
                    );
                }
            }
        }

        Ok(())
    }
}

impl HistoryClearCommand {
    fn execute(&self, cli: &Cli, history: &FileExecutionHistory) -> anyhow::Result<()> {
        let target = self.unit.as_deref().map(parse_unit).transpose()?;

        if !self.yes {
            let prompt = match &target {
                Some(unit) => format!("Forget the recorded execution of {}?", unit),
                None => format!("Forget all recorded executions in {}?", history.dir().display()),
            };
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()?;
            if !confirmed {
                output::warning("Aborted.");
                return Ok(());
            }
        }

        let removed = match &target {
            Some(unit) => usize::from(history.remove(unit)?),
            None => history.clear()?,
        };

        if !cli.quiet {
            output::success(&format!(
                "Removed {} record{}",
                removed,
                if removed == 1 { "" } else { "s" }
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit() {
        assert_eq!(parse_unit("app:compileJava").unwrap(), UnitId::new("app", "compileJava"));
        assert!(parse_unit("compileJava").is_err());
    }
}
