//! Clap derive structures for the `platmc` CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// platmc -- platform monitoring manager runner
#[derive(Debug, Parser)]
#[command(
    name = "platmc",
    version,
    about = "Discover termini, enumerate their sensors and poll readings",
    long_about = "Runs the platform monitoring manager: terminus discovery,\n\
        capability enumeration and periodic sensor polling.\n\n\
        The `demo` command drives it against an in-process loopback bus\n\
        populated from the `[[demo.endpoints]]` section of the config file.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "PLATMC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Log line format (overrides `logging.format`)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

impl GlobalOpts {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(platmc_config::config_path)
    }
}

// ── Output & Log Enums ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect or create the configuration file
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Run the manager against simulated termini
    Demo(DemoArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Print the effective configuration (file + environment + defaults)
    Show,

    /// Write a starter config file with sample demo termini
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// How long to run before printing the summary (e.g. "5s", "1m")
    #[arg(long, short = 'd', default_value = "5s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Print every reading and lifecycle event as it arrives
    #[arg(long, short = 'f')]
    pub follow: bool,

    /// Polling interval override (e.g. "250ms")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,
}
