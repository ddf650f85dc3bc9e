mod cli_logger;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use cli_logger::CliLogger;
use memtrend::{Config, ProfileCommand, WatchArgs, profile_command, watch_command};

#[derive(Debug, Parser)]
#[command(name = "memtrend", version, about = "Process memory sampling, leak checks and profile trends")]
struct Cli {
    /// Config file (missing file means defaults)
    #[arg(long, global = true, default_value = "memtrend.toml")]
    config: PathBuf,

    /// Override the profile store directory
    #[arg(long = "base-dir", global = true)]
    base_dir: Option<PathBuf>,

    /// Emit JSON instead of the pretty tree
    #[arg(long, global = true)]
    json: bool,

    #[arg(long = "no-color", global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sample a process and report statistics, leaks and alerts
    Watch(WatchArgs),
    /// Inspect, compare and clean up stored profiles
    #[command(subcommand)]
    Profile(ProfileCommand),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    let logger = CliLogger::new(cli.json, cli.no_color);

    match run(&cli).and_then(|value| logger.print_serialized(&value)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            logger.print_error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<serde_json::Value> {
    let mut config = Config::load_optional(&cli.config);
    if let Some(dir) = &cli.base_dir {
        config.base_dir = dir.clone();
    }

    match &cli.command {
        Command::Watch(args) => watch_command(&config, args).context("watch failed"),
        Command::Profile(cmd) => profile_command(&config, cmd).context("profile command failed"),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("memtrend=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
