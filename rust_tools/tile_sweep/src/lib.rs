// Library exports for testing and reuse

pub mod atomic;
pub mod cli;
pub mod command;
pub mod commands;
pub mod config;
pub mod detector;
pub mod error;
pub mod export;
pub mod geometry;
pub mod grid;
pub mod merge;
pub mod progress;
pub mod results;
pub mod runner;
pub mod tiles;

// Re-export commonly used types
pub use config::Config;
pub use detector::{Detection, DetectionResult, Detector};
pub use error::{DetectionError, Result, TileSweepError};
pub use export::{next_batch, Exporter};
pub use grid::{generate, BBox, LandMask, Tile, TileGrid};
pub use merge::{merge, MergeOptions, MergedCollection};
pub use progress::{ProgressStore, Snapshot, TileStatus};
pub use results::ResultStore;
pub use runner::{BatchReport, BatchRunner};
