use std::path::PathBuf;
use thiserror::Error;

use crate::progress::TileStatus;

#[derive(Error, Debug)]
pub enum TileSweepError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Corrupt progress state at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Tile {tile_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        tile_id: u32,
        from: TileStatus,
        to: TileStatus,
    },

    #[error("Tile {0} is not tracked by the progress store")]
    UnknownTile(u32),

    #[error("Export request for tile {tile_id} rejected: {reason}")]
    Export { tile_id: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl TileSweepError {
    /// Errors that must abort the invoking command before or during work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TileSweepError::InvalidConfiguration(_) | TileSweepError::CorruptState { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TileSweepError>;

/// Per-tile detector failure. Recorded against the tile, never fatal to a batch.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("detector exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("detector timed out after {0} s")]
    Timeout(u64),

    #[error("detector output unreadable: {0}")]
    InvalidOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
