//! membrane - PHP application server

use anyhow::{Context, Result};
use clap::Parser;
use membrane::cli::{CheckArgs, Cli, Commands, ServeArgs};
use membrane::config::Config;
use membrane::logging::{self, LogConfig};
use membrane::server;
use owo_colors::{OwoColorize, Stream::Stderr};

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Check(args) => cmd_check(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn cmd_serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let cfg = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    logging::init(build_log_config(cli, &cfg));

    let runtime = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    runtime.block_on(server::run(cfg))?;
    Ok(())
}

fn cmd_check(args: &CheckArgs) -> Result<()> {
    Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    println!("{}: configuration OK", args.config.display());
    Ok(())
}

/// Config file settings, overridden by CLI flags, overridden by env vars.
fn build_log_config(cli: &Cli, cfg: &Config) -> LogConfig {
    let mut log_cfg = LogConfig::from_settings(&cfg.logging);
    if let Some(level) = cli.log_level.as_deref()
        && let Some(parsed) = logging::parse_level(level)
    {
        log_cfg = log_cfg.with_level(parsed);
    }
    if let Some(format) = cli.log_format.as_deref()
        && let Ok(parsed) = format.parse()
    {
        log_cfg = log_cfg.with_format(parsed);
    }
    if let Some(path) = &cli.log_file {
        log_cfg = log_cfg.with_file(path.clone());
    }
    log_cfg.with_env_overrides()
}
