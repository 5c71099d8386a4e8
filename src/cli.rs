//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// membrane - PHP application server
#[derive(Parser, Debug)]
#[command(name = "membrane")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "MEMBRANE_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "MEMBRANE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Log to file (in addition to stderr).
    #[arg(long, env = "MEMBRANE_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the application server.
    Serve(ServeArgs),

    /// Validate a configuration file and exit.
    Check(CheckArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MEMBRANE_CONFIG", default_value = "membrane.yaml")]
    pub config: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct CheckArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MEMBRANE_CONFIG", default_value = "membrane.yaml")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from(["membrane", "serve", "--config", "/etc/membrane.yaml"])
            .unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.config, PathBuf::from("/etc/membrane.yaml"));
            }
            other => panic!("expected serve, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_check_with_default_config() {
        let cli = Cli::try_parse_from(["membrane", "check"]).unwrap();
        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.config, PathBuf::from("membrane.yaml"));
            }
            other => panic!("expected check, got {:?}", other),
        }
    }

    #[test]
    fn test_global_log_flags() {
        let cli = Cli::try_parse_from([
            "membrane",
            "serve",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }
}
