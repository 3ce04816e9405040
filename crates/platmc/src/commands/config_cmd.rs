//! Config subcommand handlers.

use platmc_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::commands::demo;
use crate::error::CliError;
use crate::output;

pub fn handle(
    args: ConfigArgs,
    global: &GlobalOpts,
    loaded: Result<Config, CliError>,
) -> Result<(), CliError> {
    let path = global.config_path();
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = loaded?;
            let rendered = match output::render_structured(global.output, &cfg)? {
                Some(s) => s,
                None => toml::to_string_pretty(&cfg)
                    .map_err(|e| CliError::Render(e.to_string()))?,
            };
            output::print_output(&rendered, global.quiet);
            Ok(())
        }

        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }

            let mut cfg = Config::default();
            cfg.demo.endpoints = demo::sample_endpoints();
            platmc_config::save_config_to(&cfg, &path).map_err(|e| CliError::config(&path, e))?;

            if !global.quiet {
                eprintln!("Wrote {}", path.display());
            }
            Ok(())
        }
    }
}
