pub mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use steward_core::config::{ConfigError, EngineConfig, LogFormat};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "steward",
    about = "Steward operator CLI",
    long_about = "Submit governed completion tasks, inspect effective configuration, and run readiness checks against the configured model catalog.",
    after_help = "Examples:\n  steward submit --prompt \"summarize the onboarding doc\" --tenant acme\n  steward doctor --json\n  steward config"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "Path to the engine TOML config (defaults to $STEWARD_CONFIG)"
    )]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run one task through the engine and print the execution result")]
    Submit(commands::submit::SubmitArgs),
    #[command(about = "Inspect effective configuration values with secret redaction")]
    Config,
    #[command(about = "Validate config, model catalog, and provider reachability")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

fn load_config(path: Option<&str>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) => EngineConfig::from_path(path),
        None => EngineConfig::from_env(),
    }
}

fn init_logging(config: &EngineConfig) {
    let filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    // A second init (e.g. from tests) is not an error worth surfacing.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let loaded = load_config(cli.config.as_deref());
    if let Ok(config) = &loaded {
        init_logging(config);
    }

    let result = match cli.command {
        Command::Submit(args) => match &loaded {
            Ok(config) => commands::submit::run(config, args),
            Err(error) => commands::CommandResult::failure(
                "submit",
                "config_validation",
                error.to_string(),
                2,
            ),
        },
        Command::Config => match &loaded {
            Ok(config) => {
                commands::CommandResult { exit_code: 0, output: commands::config::run(config) }
            }
            Err(error) => commands::CommandResult::failure(
                "config",
                "config_validation",
                error.to_string(),
                2,
            ),
        },
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(&loaded, json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
