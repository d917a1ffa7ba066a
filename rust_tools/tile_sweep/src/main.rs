use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::process::ExitCode;

use tile_sweep::cli::{Args, Command};
use tile_sweep::{commands, Config, Result, TileSweepError};

fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(n_threads) = args.threads {
        config.detect.workers = n_threads;
    }
    config.validate()?;

    match args.command {
        Command::Grid { json } => commands::grid(&config, json.as_deref()),
        Command::Export { quota, dry_run } => commands::export(&config, quota, dry_run),
        Command::Run {
            batch_size,
            source,
            dry_run,
        } => commands::run(&config, batch_size, source, dry_run),
        Command::Merge { output } => commands::merge_results(&config, output),
        Command::Status => commands::status(&config),
        Command::Retry { ids } => commands::retry(&config, &ids),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== Tile Sweep ===");

    match run(args) {
        Ok(()) => {
            info!("=== Done! ===");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            if let TileSweepError::CorruptState { path, .. } = &e {
                error!(
                    "The progress state at {} was left untouched; repair or restore it before rerunning",
                    path.display()
                );
            } else if !e.is_fatal() {
                error!("Command aborted; progress committed so far is kept");
            }
            ExitCode::FAILURE
        }
    }
}
