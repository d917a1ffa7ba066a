use crate::atomic::write_json_atomic;
use crate::detector::DetectionResult;
use crate::error::{Result, TileSweepError};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-tile result files, one JSON document per tile id.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tile_id: u32) -> PathBuf {
        self.dir.join(format!("tile_{:04}.json", tile_id))
    }

    /// Written whole or not at all; a tile is only marked done afterwards.
    pub fn write(&self, result: &DetectionResult) -> Result<PathBuf> {
        let path = self.path_for(result.tile_id);
        write_json_atomic(&path, result)?;
        Ok(path)
    }

    /// Read a tile's result back, rejecting documents that cannot be reprojected.
    pub fn read(&self, tile_id: u32) -> Result<DetectionResult> {
        let path = self.path_for(tile_id);
        let bytes = fs::read(&path)?;
        let result: DetectionResult = serde_json::from_slice(&bytes)?;
        result
            .validate()
            .map_err(|e| TileSweepError::CorruptState {
                path,
                reason: e.to_string(),
            })?;
        Ok(result)
    }
}
