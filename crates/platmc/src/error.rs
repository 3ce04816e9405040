//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use platmc_config::ConfigError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 3;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(
        code(platmc::validation),
        help("Fix the value in {path} or the matching PLATMC_* environment variable.")
    )]
    Validation {
        field: String,
        reason: String,
        path: String,
    },

    #[error("Could not load configuration from {path}")]
    #[diagnostic(
        code(platmc::config),
        help("Check the file syntax; durations are written like \"500ms\" or \"2s\".")
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Configuration file already exists: {path}")]
    #[diagnostic(
        code(platmc::config_exists),
        help("Pass --force to overwrite it.")
    )]
    ConfigExists { path: String },

    // ── Runtime ──────────────────────────────────────────────────────

    #[error("No terminus came online out of {attempted} endpoint(s)")]
    #[diagnostic(
        code(platmc::no_termini),
        help("Run with -v to see why discovery failed for each endpoint.")
    )]
    NoTermini { attempted: usize },

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render output: {0}")]
    #[diagnostic(code(platmc::render))]
    Render(String),
}

impl CliError {
    /// Attach the config path to a config-crate error.
    pub fn config(path: &std::path::Path, err: ConfigError) -> Self {
        let path = path.display().to_string();
        match err {
            ConfigError::Validation { field, reason } => Self::Validation {
                field,
                reason,
                path,
            },
            source => Self::Config { path, source },
        }
    }

    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::Config { .. } => exit_code::CONFIG,
            Self::ConfigExists { .. } => exit_code::CONFLICT,
            Self::NoTermini { .. } => exit_code::CONNECTION,
            Self::Io(_) | Self::Render(_) => exit_code::GENERAL,
        }
    }
}
