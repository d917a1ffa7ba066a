use crate::command::{expand_args, run_with_timeout, CommandOutcome};
use crate::error::DetectionError;
use crate::grid::{BBox, Tile};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One scored polygon in the tile's pixel frame: `[x, y]` from the raster's
/// top-left corner, y growing downward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub polygon: Vec<[f64; 2]>,
    #[serde(alias = "score")]
    pub confidence: f64,
    #[serde(default)]
    pub class: String,
}

/// What the external detector writes for one raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorOutput {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// Detector output bound to the tile it came from. This is what gets
/// persisted per tile and read back at merge time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub tile_id: u32,
    pub bbox: BBox,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn from_output(tile: &Tile, output: DetectorOutput) -> Result<Self, DetectionError> {
        let result = Self {
            tile_id: tile.id,
            bbox: tile.bbox,
            width: output.width,
            height: output.height,
            detections: output.detections,
        };
        result.validate()?;
        Ok(result)
    }

    /// Reprojection needs a non-empty raster and finite polygons of at least
    /// three vertices. Checked on detector output and again on read-back.
    pub fn validate(&self) -> Result<(), DetectionError> {
        if self.width == 0 || self.height == 0 {
            return Err(DetectionError::InvalidOutput(format!(
                "raster size {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.bbox.is_degenerate() {
            return Err(DetectionError::InvalidOutput(format!(
                "tile bbox {:?} is degenerate",
                <[f64; 4]>::from(self.bbox)
            )));
        }
        if let Some(bad) = self.detections.iter().position(|d| {
            d.polygon.len() < 3
                || !d.confidence.is_finite()
                || d.polygon.iter().flatten().any(|c| !c.is_finite())
        }) {
            return Err(DetectionError::InvalidOutput(format!(
                "detection {} has fewer than 3 vertices or non-finite values",
                bad
            )));
        }
        Ok(())
    }
}

/// The opaque image-object detector. Must be safe to call from several
/// worker threads at once.
pub trait Detector: Sync {
    fn detect(&self, tile: &Tile, raster: &Path) -> Result<DetectionResult, DetectionError>;
}

impl<F> Detector for F
where
    F: Fn(&Tile, &Path) -> Result<DetectionResult, DetectionError> + Sync,
{
    fn detect(&self, tile: &Tile, raster: &Path) -> Result<DetectionResult, DetectionError> {
        self(tile, raster)
    }
}

/// Runs an external program per raster. The program receives `{input}` and
/// `{output}` paths and must write a [`DetectorOutput`] JSON document to
/// `{output}`.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    pub program: String,
    pub args: Vec<String>,
    pub scratch_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandDetector {
    fn output_path(&self, tile: &Tile) -> PathBuf {
        self.scratch_dir
            .join(format!("detections_{:04}.json", tile.id))
    }
}

impl Detector for CommandDetector {
    fn detect(&self, tile: &Tile, raster: &Path) -> Result<DetectionResult, DetectionError> {
        fs::create_dir_all(&self.scratch_dir)?;
        let output_path = self.output_path(tile);
        let _ = fs::remove_file(&output_path);

        let args = expand_args(
            &self.args,
            &[
                ("input", raster.display().to_string()),
                ("output", output_path.display().to_string()),
                ("id", tile.id.to_string()),
            ],
        );

        let outcome = run_with_timeout(&self.program, &args, self.timeout);
        let result = match outcome? {
            CommandOutcome::TimedOut => Err(DetectionError::Timeout(
                self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            )),
            CommandOutcome::Exited { status, stderr } if !status.success() => {
                Err(DetectionError::Failed {
                    status: status.to_string(),
                    stderr,
                })
            }
            CommandOutcome::Exited { .. } => {
                let bytes = fs::read(&output_path).map_err(|e| {
                    DetectionError::InvalidOutput(format!(
                        "{}: {}",
                        output_path.display(),
                        e
                    ))
                })?;
                let output: DetectorOutput = serde_json::from_slice(&bytes)
                    .map_err(|e| DetectionError::InvalidOutput(e.to_string()))?;
                debug!(
                    "Tile {}: detector reported {} object(s)",
                    tile.id,
                    output.detections.len()
                );
                DetectionResult::from_output(tile, output)
            }
        };

        let _ = fs::remove_file(&output_path);
        result
    }
}
