//! Run command - execute work units

use std::fmt;
use std::sync::Arc;

use clap::Args;
use console::style;
use tracing::info;

use kiln_tasks::config::{scheduler_options, services_from_config, units_from_config};
use kiln_tasks::{
    BuildCache, ExecutionOutcome, ExecutionPipeline, UnitEvent, UnitReporter,
    UnitReporterRegistry, UnitScheduler, WorkUnit,
};

use super::Project;
use crate::cli::{Cli, OutputFormat};

/// Execute work units
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Units to run, by name or `project:name` (default: all)
    pub units: Vec<String>,

    /// Maximum concurrent units
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Keep starting units after one fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Disable the build cache for this run
    #[arg(long)]
    pub no_cache: bool,

    /// Ignore up-to-date checks and execute every unit with source
    #[arg(long)]
    pub rerun: bool,
}

/// Units failed; the build finished otherwise
#[derive(Debug)]
pub struct BuildFailed {
    pub failed: usize,
}

impl fmt::Display for BuildFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unit{} failed",
            self.failed,
            if self.failed == 1 { "" } else { "s" }
        )
    }
}

impl std::error::Error for BuildFailed {}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let project = Project::load()?;
        let units = self.select(units_from_config(&project.config, &project.root)?)?;

        if units.is_empty() {
            if !cli.quiet {
                println!("{} No units to run.", style("✓").green());
            }
            return Ok(());
        }
        info!(units = units.len(), root = %project.root.display(), "starting build");

        let mut services = services_from_config(&project.config, &project.root)?;
        if self.no_cache {
            services = services.with_cache(BuildCache::disabled());
        }
        if self.rerun {
            services = services.with_up_to_date_checks(false);
        }

        let mut reporters = UnitReporterRegistry::new();
        if !cli.quiet && cli.format == OutputFormat::Text {
            reporters.register(ConsoleReporter::new(cli.verbose));
            println!();
            println!(
                "{} {} unit{}",
                style("→").blue(),
                units.len(),
                if units.len() == 1 { "" } else { "s" },
            );
            println!();
        }
        let services = services.with_reporter(Arc::new(reporters));

        let mut options = scheduler_options(&project.config);
        if let Some(concurrency) = self.concurrency {
            options.concurrency = concurrency;
        }
        options.continue_on_error |= self.continue_on_error;

        let pipeline = Arc::new(ExecutionPipeline::new(services));
        let scheduler = UnitScheduler::new(pipeline, options);
        let mut report = scheduler
            .run(units.into_iter().map(Arc::new).collect())
            .await;

        if cli.format == OutputFormat::Json {
            let summary = serde_json::json!({
                "total": report.results.len() + report.skipped.len(),
                "executed": report.count(ExecutionOutcome::Executed),
                "up_to_date": report.count(ExecutionOutcome::UpToDate),
                "from_cache": report.count(ExecutionOutcome::FromCache),
                "no_source": report.count(ExecutionOutcome::NoSource),
                "failed": report.count(ExecutionOutcome::Failed),
                "skipped": report.skipped.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                "aborted": report.aborted.as_ref().map(|a| a.to_string()),
                "units": report.results.iter().map(|r| {
                    serde_json::json!({
                        "id": r.id.to_string(),
                        "outcome": r.outcome,
                        "did_work": r.did_work,
                        "duration_ms": r.duration.as_millis(),
                        "cache_key": r.cache_key.as_ref().map(|k| k.to_string()),
                        "error": r.failure.as_ref().map(|e| e.to_string()),
                    })
                }).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        if let Some(abort) = report.aborted.take() {
            return Err(abort.into());
        }

        let failed: Vec<_> = report.failed().collect();
        if !failed.is_empty() {
            if !cli.quiet && cli.format == OutputFormat::Text {
                println!();
                println!(
                    "  {} {}/{} units failed:",
                    style("✗").red().bold(),
                    failed.len(),
                    report.results.len()
                );
                for r in &failed {
                    if let Some(error) = &r.failure {
                        println!("    {} {}: {}", style("✗").red(), r.id, error);
                    }
                }
            }
            return Err(BuildFailed {
                failed: failed.len(),
            }
            .into());
        }

        Ok(())
    }

    /// Keep the requested units, in request order
    fn select(&self, units: Vec<WorkUnit>) -> anyhow::Result<Vec<WorkUnit>> {
        if self.units.is_empty() {
            return Ok(units);
        }
        let mut selected = Vec::new();
        for requested in &self.units {
            let matching: Vec<&WorkUnit> = units
                .iter()
                .filter(|u| &u.id.name == requested || &u.id.to_string() == requested)
                .collect();
            if matching.is_empty() {
                anyhow::bail!("no unit named '{}'", requested);
            }
            for unit in matching {
                if !selected.iter().any(|s: &WorkUnit| s.id == unit.id) {
                    selected.push(unit.clone());
                }
            }
        }
        Ok(selected)
    }
}

/// Console reporter with live output
struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl UnitReporter for ConsoleReporter {
    fn report(&self, event: &UnitEvent) {
        match event {
            UnitEvent::Started { id, description } => {
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    style(id).bold(),
                    if self.verbose {
                        style(format!("({})", description)).dim().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            UnitEvent::Output { id, line, is_stderr } => {
                if self.verbose {
                    if *is_stderr {
                        println!("    {} {}", style(format!("[{}]", id)).red().dim(), line);
                    } else {
                        println!("    {} {}", style(format!("[{}]", id)).dim(), line);
                    }
                }
            }
            UnitEvent::Finished {
                id,
                outcome,
                duration,
            } => {
                let label = match outcome {
                    ExecutionOutcome::Executed => String::new(),
                    other => style(format!("({})", other)).cyan().to_string(),
                };
                println!(
                    "  {} {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    label,
                    style(format!("{:.1}s", duration.as_secs_f64())).dim()
                );
            }
            UnitEvent::Failed {
                id,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim(),
                    style(error).red().dim()
                );
            }
            UnitEvent::Skipped { id, reason } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            UnitEvent::AllCompleted {
                total,
                executed,
                up_to_date,
                from_cache,
                no_source,
                failed,
                skipped,
                duration,
            } => {
                println!();
                println!(
                    "  {} {} units: {} executed, {} up-to-date, {} from cache, {} no source, {} failed, {} skipped ({:.1}s)",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    total,
                    executed,
                    up_to_date,
                    from_cache,
                    no_source,
                    failed,
                    skipped,
                    duration.as_secs_f64()
                );
            }
        }
    }
}
