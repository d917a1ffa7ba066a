use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tile-sweep")]
#[command(about = "Grid, export, detect and merge continental-scale tile batches")]
#[command(version)]
pub struct Args {
    /// Config file (default: ./tile-sweep.toml if present)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Number of detection workers (overrides detect.workers)
    #[arg(short, long, value_name = "N", global = true)]
    pub threads: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate the tile grid and report land/ocean counts
    Grid {
        /// Write the land tiles as JSON
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },

    /// Request export of the next tiles not yet exported
    Export {
        /// Maximum tiles to request this run (overrides export.quota)
        #[arg(short, long, value_name = "N")]
        quota: Option<usize>,

        /// Show the selection without requesting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the detector over the next batch of available tile files
    Run {
        /// Maximum tiles to process (overrides detect.batch_size)
        #[arg(short, long, value_name = "N")]
        batch_size: Option<usize>,

        /// Directory holding exported tile files (overrides paths.tiles_dir)
        #[arg(short, long, value_name = "DIR")]
        source: Option<PathBuf>,

        /// Show the selection without processing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Merge all done tiles into one deduplicated collection
    Merge {
        /// Output directory (overrides paths.output_dir)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Report per-status tile counts
    Status,

    /// Move failed tiles back to pending
    Retry {
        /// Only these tile ids (comma separated); default is every failed tile
        #[arg(long, value_delimiter = ',', value_name = "IDS")]
        ids: Vec<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_globals() {
        let args = Args::try_parse_from([
            "tile-sweep", "run", "--batch-size", "5", "-t", "4", "--config", "x.toml",
        ])
        .unwrap();
        assert_eq!(args.threads, Some(4));
        assert_eq!(args.config, Some(PathBuf::from("x.toml")));
        match args.command {
            Command::Run {
                batch_size,
                dry_run,
                ..
            } => {
                assert_eq!(batch_size, Some(5));
                assert!(!dry_run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_retry_ids() {
        let args = Args::try_parse_from(["tile-sweep", "retry", "--ids", "3,7,9"]).unwrap();
        match args.command {
            Command::Retry { ids } => assert_eq!(ids, vec![3, 7, 9]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_command_required() {
        assert!(Args::try_parse_from(["tile-sweep"]).is_err());
    }
}
