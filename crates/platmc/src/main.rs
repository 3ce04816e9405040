mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use platmc_config::Config;

use crate::cli::{Cli, Command, LogFormat};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let path = cli.global.config_path();
    let loaded = platmc_config::load_config_from(&path).map_err(|e| CliError::config(&path, e));

    let logging = loaded
        .as_ref()
        .map(|cfg| cfg.logging.clone())
        .unwrap_or_default();
    let format = cli.global.log_format.unwrap_or(if logging.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });
    init_tracing(cli.global.verbose, format, &logging.level);

    if let Err(err) = run(cli, loaded).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, format: LogFormat, default_level: &str) {
    let filter = match verbosity {
        0 => default_level,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli, loaded: Result<Config, CliError>) -> Result<(), CliError> {
    match cli.command {
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global, loaded),
        Command::Demo(args) => {
            let cfg = loaded?;
            tracing::debug!(?args, "starting demo");
            commands::demo::handle(args, &cfg, &cli.global).await
        }
    }
}
