//! Shell completion scripts for kiln

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, ValueEnum};
use clap_complete::{generate, Shell};
use tracing::info;

use crate::cli::{output, Cli};

/// Print or install a completion script
#[derive(Debug, Args)]
pub struct CompletionsCommand {
    /// Target shell
    #[arg(value_enum)]
    pub shell: ShellType,

    /// Write the script to this file instead of stdout
    #[arg(short, long, conflicts_with = "install")]
    pub output: Option<PathBuf>,

    /// Write the script to ~/.kiln/completions/<file>
    #[arg(long)]
    pub install: bool,
}

/// Shells clap_complete can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShellType {
    /// GNU bash; source the script from ~/.bashrc
    Bash,
    /// Zsh; the script must land in a directory on $fpath
    Zsh,
    Fish,
    /// Windows PowerShell and pwsh
    #[value(name = "powershell")]
    PowerShell,
}

impl ShellType {
    /// Conventional file name for the completion script
    pub fn script_name(self, bin: &str) -> String {
        match self {
            ShellType::Bash => format!("{}.bash", bin),
            ShellType::Zsh => format!("_{}", bin),
            ShellType::Fish => format!("{}.fish", bin),
            ShellType::PowerShell => format!("_{}.ps1", bin),
        }
    }
}

impl From<ShellType> for Shell {
    fn from(shell: ShellType) -> Self {
        match shell {
            ShellType::Bash => Shell::Bash,
            ShellType::Zsh => Shell::Zsh,
            ShellType::Fish => Shell::Fish,
            ShellType::PowerShell => Shell::PowerShell,
        }
    }
}

impl CompletionsCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let target = match (&self.output, self.install) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => Some(install_dir()?.join(self.shell.script_name(bin_name()))),
            (None, false) => None,
        };

        match target {
            Some(path) => {
                write_script(self.shell, &path)?;
                info!(shell = ?self.shell, path = %path.display(), "completion script written");
                if !cli.quiet {
                    output::success(&format!("Completions written to {}", path.display()));
                }
            }
            None => render(self.shell, &mut io::stdout())?,
        }
        Ok(())
    }
}

fn bin_name() -> &'static str {
    "kiln"
}

fn install_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.join(".kiln").join("completions"))
}

/// Generate the script for `shell` into `out`
fn render(shell: ShellType, out: &mut dyn Write) -> io::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(Shell::from(shell), &mut cmd, name, out);
    out.flush()
}

fn write_script(shell: ShellType, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    render(shell, &mut file)?;
    Ok(())
}
